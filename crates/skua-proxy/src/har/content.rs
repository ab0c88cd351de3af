//! Conversions from HTTP messages into HAR fields.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, SecondsFormat, Utc};
use encoding_rs::{Encoding, UTF_8};
use http::header::{self, HeaderMap};
use http::{StatusCode, Version};
use skua_core::har::{Cookie, Header, Param, QueryParam};

pub(crate) fn http_version(version: Version) -> &'static str {
    match version {
        Version::HTTP_09 => "HTTP/0.9",
        Version::HTTP_10 => "HTTP/1.0",
        Version::HTTP_2 => "HTTP/2.0",
        Version::HTTP_3 => "HTTP/3.0",
        _ => "HTTP/1.1",
    }
}

pub(crate) fn har_headers(headers: &HeaderMap) -> Vec<Header> {
    headers
        .iter()
        .map(|(name, value)| Header::new(name.as_str(), String::from_utf8_lossy(value.as_bytes())))
        .collect()
}

fn header_block_size(headers: &HeaderMap) -> usize {
    headers
        .iter()
        .map(|(name, value)| name.as_str().len() + 2 + value.len() + 2)
        .sum::<usize>()
        + 2
}

/// Size of the serialized request head
pub(crate) fn request_headers_size(
    method: &str,
    target: &str,
    version: Version,
    headers: &HeaderMap,
) -> i64 {
    let line = method.len() + 1 + target.len() + 1 + http_version(version).len() + 2;
    (line + header_block_size(headers)) as i64
}

/// Size of the serialized response head
pub(crate) fn response_headers_size(version: Version, status: StatusCode, headers: &HeaderMap) -> i64 {
    let reason = status.canonical_reason().unwrap_or("");
    let line = http_version(version).len() + 1 + 3 + 1 + reason.len() + 2;
    (line + header_block_size(headers)) as i64
}

/// Cookies sent by the client
pub(crate) fn request_cookies(headers: &HeaderMap) -> Vec<Cookie> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| {
            let (name, value) = pair.trim().split_once('=')?;
            Some(Cookie {
                name: name.trim().to_string(),
                value: value.trim().to_string(),
                ..Cookie::default()
            })
        })
        .collect()
}

/// Cookies set by the server, one per `Set-Cookie`
pub(crate) fn response_cookies(headers: &HeaderMap) -> Vec<Cookie> {
    headers
        .get_all(header::SET_COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .filter_map(parse_set_cookie)
        .collect()
}

fn parse_set_cookie(value: &str) -> Option<Cookie> {
    let mut parts = value.split(';');
    let (name, val) = parts.next()?.trim().split_once('=')?;
    let mut cookie = Cookie {
        name: name.trim().to_string(),
        value: val.trim().to_string(),
        ..Cookie::default()
    };

    for attribute in parts {
        let (key, attr_value) = match attribute.trim().split_once('=') {
            Some((k, v)) => (k.trim(), Some(v.trim())),
            None => (attribute.trim(), None),
        };
        match (key.to_ascii_lowercase().as_str(), attr_value) {
            ("path", Some(v)) => cookie.path = Some(v.to_string()),
            ("domain", Some(v)) => cookie.domain = Some(v.to_string()),
            ("expires", Some(v)) => {
                // Max-Age wins over Expires
                if cookie.expires.is_none() {
                    cookie.expires = Some(cookie_expiry(v));
                }
            }
            ("max-age", Some(v)) => {
                if let Ok(seconds) = v.parse::<i64>() {
                    let at = Utc::now() + chrono::Duration::seconds(seconds);
                    cookie.expires = Some(at.to_rfc3339_opts(SecondsFormat::Millis, true));
                }
            }
            ("httponly", _) => cookie.http_only = Some(true),
            ("secure", _) => cookie.secure = Some(true),
            _ => {}
        }
    }
    Some(cookie)
}

fn cookie_expiry(raw: &str) -> String {
    DateTime::parse_from_rfc2822(raw)
        .map(|at| at.with_timezone(&Utc).to_rfc3339_opts(SecondsFormat::Millis, true))
        .unwrap_or_else(|_| raw.to_string())
}

pub(crate) fn query_params(url: &str) -> Result<Vec<QueryParam>, url::ParseError> {
    let parsed = url::Url::parse(url)?;
    Ok(parsed
        .query_pairs()
        .map(|(name, value)| QueryParam {
            name: name.into_owned(),
            value: value.into_owned(),
            comment: None,
        })
        .collect())
}

pub(crate) fn form_params(body: &[u8]) -> Vec<Param> {
    url::form_urlencoded::parse(body)
        .map(|(name, value)| Param {
            name: name.into_owned(),
            value: Some(value.into_owned()),
            file_name: None,
            content_type: None,
            comment: None,
        })
        .collect()
}

pub(crate) fn mime_type(headers: &HeaderMap) -> String {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string()
}

pub(crate) fn is_form_urlencoded(content_type: &str) -> bool {
    content_type
        .parse::<mime::Mime>()
        .is_ok_and(|m| m.essence_str() == mime::APPLICATION_WWW_FORM_URLENCODED.essence_str())
}

/// Whether a body of this type is captured as text
pub(crate) fn is_text(content_type: &str) -> bool {
    let Ok(parsed) = content_type.parse::<mime::Mime>() else {
        return false;
    };
    if parsed.type_() == mime::TEXT {
        return true;
    }
    let subtype = parsed.subtype().as_str();
    let suffix = parsed.suffix().map(|s| s.as_str());
    parsed.type_() == mime::APPLICATION
        && (matches!(
            subtype,
            "json" | "xml" | "javascript" | "x-javascript" | "ecmascript" | "x-www-form-urlencoded"
        ) || matches!(suffix, Some("json") | Some("xml")))
}

/// How a captured body ends up in the HAR
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum CapturedText {
    Text(String),
    Base64(String),
}

/// Decode a body with the charset named in its content type.
///
/// A missing or unknown charset decodes as UTF-8. Bytes that are malformed
/// for the charset fall back to base64.
pub(crate) fn decode_body(body: &[u8], content_type: &str) -> CapturedText {
    let label = content_type
        .parse::<mime::Mime>()
        .ok()
        .and_then(|m| m.get_param(mime::CHARSET).map(|c| c.as_str().to_string()));

    let encoding = match label.as_deref() {
        None => {
            tracing::debug!("No charset in '{}'; decoding as UTF-8", content_type);
            UTF_8
        }
        Some(label) => Encoding::for_label(label.as_bytes()).unwrap_or_else(|| {
            tracing::warn!("Unknown charset '{}'; decoding as UTF-8", label);
            UTF_8
        }),
    };

    match encoding.decode_without_bom_handling_and_without_replacement(body) {
        Some(text) => CapturedText::Text(text.into_owned()),
        None => {
            tracing::debug!("Body is not valid {}; capturing as base64", encoding.name());
            CapturedText::Base64(STANDARD.encode(body))
        }
    }
}

pub(crate) fn base64(body: &[u8]) -> String {
    STANDARD.encode(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    #[test]
    fn test_headers_size() {
        let mut headers = HeaderMap::new();
        headers.insert("host", HeaderValue::from_static("a.b"));
        // "GET / HTTP/1.1\r\n" + "host: a.b\r\n" + "\r\n"
        assert_eq!(request_headers_size("GET", "/", Version::HTTP_11, &headers), 16 + 11 + 2);

        let empty = HeaderMap::new();
        // "HTTP/1.1 200 OK\r\n\r\n"
        assert_eq!(response_headers_size(Version::HTTP_11, StatusCode::OK, &empty), 19);
    }

    #[test]
    fn test_request_cookies() {
        let mut headers = HeaderMap::new();
        headers.insert("cookie", HeaderValue::from_static("a=1; b=two; junk"));
        let cookies = request_cookies(&headers);
        assert_eq!(cookies.len(), 2);
        assert_eq!(cookies[1].name, "b");
        assert_eq!(cookies[1].value, "two");
    }

    #[test]
    fn test_set_cookie_attributes() {
        let mut headers = HeaderMap::new();
        headers.append(
            "set-cookie",
            HeaderValue::from_static(
                "session=abc; Path=/app; Domain=example.com; Expires=Wed, 21 Oct 2015 07:28:00 GMT; HttpOnly; Secure",
            ),
        );
        headers.append("set-cookie", HeaderValue::from_static("plain=1"));

        let cookies = response_cookies(&headers);
        assert_eq!(cookies.len(), 2);
        let session = &cookies[0];
        assert_eq!(session.path.as_deref(), Some("/app"));
        assert_eq!(session.domain.as_deref(), Some("example.com"));
        assert_eq!(session.expires.as_deref(), Some("2015-10-21T07:28:00.000Z"));
        assert_eq!(session.http_only, Some(true));
        assert_eq!(session.secure, Some(true));
        assert_eq!(cookies[1].http_only, None);
    }

    #[test]
    fn test_query_params() {
        let params = query_params("http://example.com/search?q=rust+lang&page=2").unwrap();
        assert_eq!(params.len(), 2);
        assert_eq!(params[0].value, "rust lang");
        assert!(query_params("not a url").is_err());
    }

    #[test]
    fn test_text_classification() {
        assert!(is_text("text/html; charset=utf-8"));
        assert!(is_text("application/json"));
        assert!(is_text("application/problem+json"));
        assert!(is_text("application/x-www-form-urlencoded"));
        assert!(!is_text("image/png"));
        assert!(!is_text("application/octet-stream"));
        assert!(!is_text(""));
        assert!(is_form_urlencoded("application/x-www-form-urlencoded; charset=utf-8"));
    }

    #[test]
    fn test_decode_body_charsets() {
        assert_eq!(
            decode_body("héllo".as_bytes(), "text/plain; charset=UTF-8"),
            CapturedText::Text("héllo".to_string())
        );
        assert_eq!(
            decode_body(&[0x68, 0xe9], "text/plain; charset=iso-8859-1"),
            CapturedText::Text("hé".to_string())
        );
        assert_eq!(
            decode_body(&[0xff, 0xfe], "text/plain"),
            CapturedText::Base64("//4=".to_string())
        );
        assert_eq!(
            decode_body(&[0x82, 0xa0], "text/plain; charset=shift_jis"),
            CapturedText::Text("あ".to_string())
        );
    }

    #[test]
    fn test_decode_windows_1252() {
        assert_eq!(
            decode_body(&[0x63, 0x61, 0x66, 0xe9, 0x20, 0x80], "text/html; charset=windows-1252"),
            CapturedText::Text("café €".to_string())
        );
    }

    #[test]
    fn test_unknown_charset_decodes_as_utf8() {
        assert_eq!(
            decode_body("naïve".as_bytes(), "text/plain; charset=x-made-up"),
            CapturedText::Text("naïve".to_string())
        );
        assert!(matches!(
            decode_body(&[0xff, 0xfe, 0xfd], "text/plain; charset=x-made-up"),
            CapturedText::Base64(_)
        ));
    }

    #[test]
    fn test_form_params() {
        let params = form_params(b"name=J%C3%BCrgen&empty=");
        assert_eq!(params[0].value.as_deref(), Some("Jürgen"));
        assert_eq!(params[1].value.as_deref(), Some(""));
    }
}
