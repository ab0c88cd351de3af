use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// HAR format version written by skua
pub const HAR_VERSION: &str = "1.2";

/// Top-level HAR object
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Har {
    pub log: Log,
}

impl Har {
    /// Create an empty HAR document stamped with the given creator
    pub fn new(creator: Creator) -> Self {
        Self {
            log: Log {
                version: HAR_VERSION.to_string(),
                creator,
                browser: None,
                pages: Vec::new(),
                entries: Vec::new(),
                comment: None,
            },
        }
    }

    /// Find a page by id
    pub fn page(&self, id: &str) -> Option<&Page> {
        self.log.pages.iter().find(|page| page.id == id)
    }
}

/// Main HAR log object
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Log {
    pub version: String,
    pub creator: Creator,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub browser: Option<Creator>,
    #[serde(default)]
    pub pages: Vec<Page>,
    pub entries: Vec<Entry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

/// Creator/Browser information
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Creator {
    pub name: String,
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl Creator {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            comment: None,
        }
    }
}

/// Page information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page {
    #[serde(rename = "startedDateTime")]
    pub started_date_time: String,
    pub id: String,
    pub title: String,
    #[serde(rename = "pageTimings")]
    pub page_timings: PageTimings,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

/// Page timing information
///
/// `on_load` stays `None` until the page is ended.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PageTimings {
    #[serde(rename = "onContentLoad", skip_serializing_if = "Option::is_none")]
    pub on_content_load: Option<i64>,
    #[serde(rename = "onLoad", skip_serializing_if = "Option::is_none")]
    pub on_load: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

/// Individual HTTP transaction entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entry {
    #[serde(rename = "pageref", skip_serializing_if = "Option::is_none")]
    pub page_ref: Option<String>,
    #[serde(rename = "startedDateTime")]
    pub started_date_time: String,
    /// Total elapsed time in milliseconds
    pub time: i64,
    pub request: Request,
    pub response: Response,
    pub cache: Cache,
    pub timings: Timings,
    #[serde(rename = "serverIPAddress", skip_serializing_if = "Option::is_none")]
    pub server_ip_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    /// Vendor fields such as `_url` and `_errorMessage`
    #[serde(flatten)]
    pub additional: BTreeMap<String, Value>,
}

impl Entry {
    /// Create an entry for a request with the "no response yet" placeholder installed
    pub fn new(page_ref: Option<String>, started_date_time: String, request: Request) -> Self {
        Self {
            page_ref,
            started_date_time,
            time: 0,
            request,
            response: Response::placeholder(),
            cache: Cache::default(),
            timings: Timings::default(),
            server_ip_address: None,
            connection: None,
            comment: None,
            additional: BTreeMap::new(),
        }
    }

    /// Read a vendor field as a string
    pub fn additional_str(&self, key: &str) -> Option<&str> {
        self.additional.get(key).and_then(Value::as_str)
    }

    /// Set a vendor field; the leading underscore is added when missing
    pub fn set_additional(&mut self, key: &str, value: impl Into<Value>) {
        let key = if key.starts_with('_') {
            key.to_string()
        } else {
            format!("_{}", key)
        };
        self.additional.insert(key, value.into());
    }

    /// Append a comment, keeping any previous one
    pub fn add_comment(&mut self, comment: &str) {
        self.comment = Some(match self.comment.take() {
            Some(existing) => format!("{}; {}", existing, comment),
            None => comment.to_string(),
        });
    }
}

/// HTTP request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub method: String,
    pub url: String,
    #[serde(rename = "httpVersion")]
    pub http_version: String,
    pub cookies: Vec<Cookie>,
    pub headers: Vec<Header>,
    #[serde(rename = "queryString")]
    pub query_string: Vec<QueryParam>,
    #[serde(rename = "postData", skip_serializing_if = "Option::is_none")]
    pub post_data: Option<PostData>,
    #[serde(rename = "headersSize")]
    pub headers_size: i64,
    #[serde(rename = "bodySize")]
    pub body_size: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl Request {
    pub fn new(
        method: impl Into<String>,
        url: impl Into<String>,
        http_version: impl Into<String>,
    ) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
            http_version: http_version.into(),
            cookies: Vec::new(),
            headers: Vec::new(),
            query_string: Vec::new(),
            post_data: None,
            headers_size: -1,
            body_size: -1,
            comment: None,
        }
    }
}

/// HTTP response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub status: i64,
    #[serde(rename = "statusText")]
    pub status_text: String,
    #[serde(rename = "httpVersion")]
    pub http_version: String,
    pub cookies: Vec<Cookie>,
    pub headers: Vec<Header>,
    pub content: Content,
    #[serde(rename = "redirectURL")]
    pub redirect_url: String,
    #[serde(rename = "headersSize")]
    pub headers_size: i64,
    #[serde(rename = "bodySize")]
    pub body_size: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl Response {
    /// The all-default response installed before the server has answered
    pub fn placeholder() -> Self {
        Self {
            status: 0,
            status_text: String::new(),
            http_version: String::new(),
            cookies: Vec::new(),
            headers: Vec::new(),
            content: Content::default(),
            redirect_url: String::new(),
            headers_size: 0,
            body_size: 0,
            comment: None,
        }
    }

    /// Synthetic response recorded when the exchange failed before a response arrived
    pub fn failure() -> Self {
        Self {
            status: 0,
            status_text: String::new(),
            http_version: "unknown".to_string(),
            cookies: Vec::new(),
            headers: Vec::new(),
            content: Content::default(),
            redirect_url: String::new(),
            headers_size: -1,
            body_size: -1,
            comment: None,
        }
    }

    /// Case-insensitive header lookup
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }
}

/// Cookie
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires: Option<String>,
    #[serde(rename = "httpOnly", skip_serializing_if = "Option::is_none")]
    pub http_only: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secure: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

/// HTTP header
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub name: String,
    pub value: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl Header {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            comment: None,
        }
    }
}

/// Query parameter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryParam {
    pub name: String,
    pub value: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

/// POST data
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostData {
    #[serde(rename = "mimeType")]
    pub mime_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Vec<Param>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

/// POST parameter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Param {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(rename = "fileName", skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(rename = "contentType", skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

/// Response content
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Content {
    pub size: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compression: Option<i64>,
    #[serde(rename = "mimeType")]
    pub mime_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

/// Cache information
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Cache {
    #[serde(rename = "beforeRequest", skip_serializing_if = "Option::is_none")]
    pub before_request: Option<CacheEntry>,
    #[serde(rename = "afterRequest", skip_serializing_if = "Option::is_none")]
    pub after_request: Option<CacheEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

/// Cache entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub expires: Option<String>,
    #[serde(rename = "lastAccess")]
    pub last_access: String,
    #[serde(rename = "eTag")]
    pub e_tag: String,
    #[serde(rename = "hitCount")]
    pub hit_count: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

/// Timing information, in whole milliseconds.
///
/// `-1` marks a phase that does not apply (`ssl` on plain HTTP, `connect` on a
/// reused connection). `send`, `wait` and `receive` are mandatory in HAR and
/// start at `0`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timings {
    pub blocked: i64,
    pub dns: i64,
    pub connect: i64,
    pub send: i64,
    pub wait: i64,
    pub receive: i64,
    pub ssl: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            blocked: -1,
            dns: -1,
            connect: -1,
            send: 0,
            wait: 0,
            receive: 0,
            ssl: -1,
            comment: None,
        }
    }
}

impl Timings {
    /// Sum of all phases that actually happened; `ssl` is already part of `connect`
    pub fn total(&self) -> i64 {
        [
            self.blocked,
            self.dns,
            self.connect,
            self.send,
            self.wait,
            self.receive,
        ]
        .iter()
        .filter(|t| **t > 0)
        .sum()
    }
}
