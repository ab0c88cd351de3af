//! Assertions over captured traffic.
//!
//! Every assertion is evaluated against the entries of a HAR whose request URL
//! matches a pattern, either only the most recent one or all of them. When no
//! entry matches, the assertion passes vacuously with an empty entry list.

use crate::filter::{StatusFilter, UrlPattern};
use crate::har::{Entry, Har};
use serde::{Deserialize, Serialize};

/// Outcome for a single matched entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssertionEntry {
    pub url: String,
    pub failed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Aggregated outcome of an assertion
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssertionResult {
    pub passed: bool,
    pub failed: bool,
    /// Human-readable summary, "N passed, M total"
    pub result: String,
    pub requests: Vec<AssertionEntry>,
}

impl AssertionResult {
    fn from_entries(requests: Vec<AssertionEntry>) -> Self {
        let total = requests.len();
        let passed_count = requests.iter().filter(|r| !r.failed).count();
        let passed = passed_count == total;

        Self {
            passed,
            failed: !passed,
            result: format!("{} passed, {} total", passed_count, total),
            requests,
        }
    }
}

/// A check applied to one HAR entry
#[derive(Debug, Clone)]
pub enum Assertion {
    ResponseTimeLessThanOrEqual(i64),
    ContentContains(String),
    ContentDoesNotContain(String),
    ContentMatches(UrlPattern),
    ContentLengthLessThanOrEqual(i64),
    HeaderContains {
        name: Option<String>,
        value: String,
    },
    HeaderDoesNotContain {
        name: Option<String>,
        value: String,
    },
    HeaderMatches {
        name: Option<UrlPattern>,
        value: UrlPattern,
    },
    StatusEquals(i64),
    StatusClass(StatusFilter),
}

impl Assertion {
    /// Check one entry, returning a failure message on mismatch
    pub fn check(&self, entry: &Entry) -> std::result::Result<(), String> {
        let response = &entry.response;
        let text = response.content.text.as_deref().unwrap_or("");

        match self {
            Assertion::ResponseTimeLessThanOrEqual(limit) => {
                if entry.time <= *limit {
                    Ok(())
                } else {
                    Err(format!(
                        "Response time {} ms exceeds {} ms",
                        entry.time, limit
                    ))
                }
            }
            Assertion::ContentContains(needle) => {
                if text.contains(needle.as_str()) {
                    Ok(())
                } else {
                    Err(format!("Content does not contain '{}'", needle))
                }
            }
            Assertion::ContentDoesNotContain(needle) => {
                if text.contains(needle.as_str()) {
                    Err(format!("Content contains '{}'", needle))
                } else {
                    Ok(())
                }
            }
            Assertion::ContentMatches(pattern) => {
                if pattern.matches(text) {
                    Ok(())
                } else {
                    Err(format!("Content does not match '{}'", pattern.as_str()))
                }
            }
            Assertion::ContentLengthLessThanOrEqual(limit) => {
                if response.content.size <= *limit {
                    Ok(())
                } else {
                    Err(format!(
                        "Content length {} exceeds {}",
                        response.content.size, limit
                    ))
                }
            }
            Assertion::HeaderContains { name, value } => {
                if headers_named(entry, name.as_deref()).any(|h| h.contains(value.as_str())) {
                    Ok(())
                } else {
                    Err(format!("No {} contains '{}'", header_label(name), value))
                }
            }
            Assertion::HeaderDoesNotContain { name, value } => {
                if headers_named(entry, name.as_deref()).any(|h| h.contains(value.as_str())) {
                    Err(format!("A {} contains '{}'", header_label(name), value))
                } else {
                    Ok(())
                }
            }
            Assertion::HeaderMatches { name, value } => {
                let mut candidates = response
                    .headers
                    .iter()
                    .filter(|h| name.as_ref().is_none_or(|n| n.matches(&h.name)))
                    .peekable();

                if candidates.peek().is_none() {
                    return Err("No matching header found".to_string());
                }
                if candidates.all(|h| value.matches(&h.value)) {
                    Ok(())
                } else {
                    Err(format!("Header value does not match '{}'", value.as_str()))
                }
            }
            Assertion::StatusEquals(expected) => {
                if response.status == *expected {
                    Ok(())
                } else {
                    Err(format!(
                        "Status {} does not equal {}",
                        response.status, expected
                    ))
                }
            }
            Assertion::StatusClass(filter) => {
                if filter.matches(response.status) {
                    Ok(())
                } else {
                    Err(format!("Status {} is not in {}", response.status, filter))
                }
            }
        }
    }
}

fn headers_named<'a>(entry: &'a Entry, name: Option<&'a str>) -> impl Iterator<Item = &'a str> {
    entry
        .response
        .headers
        .iter()
        .filter(move |h| name.is_none_or(|n| h.name.eq_ignore_ascii_case(n)))
        .map(|h| h.value.as_str())
}

fn header_label(name: &Option<String>) -> String {
    match name {
        Some(name) => format!("'{}' header", name),
        None => "header".to_string(),
    }
}

/// The most recently recorded entry whose URL matches
pub fn find_most_recent_entry<'a>(har: &'a Har, url: &UrlPattern) -> Option<&'a Entry> {
    har.log
        .entries
        .iter()
        .filter(|entry| url.matches(&entry.request.url))
        .max_by(|a, b| a.started_date_time.cmp(&b.started_date_time))
}

/// All entries whose URL matches, in recording order
pub fn find_entries<'a>(har: &'a Har, url: &UrlPattern) -> Vec<&'a Entry> {
    har.log
        .entries
        .iter()
        .filter(|entry| url.matches(&entry.request.url))
        .collect()
}

/// Apply an assertion to the most recent matching entry
pub fn assert_most_recent(har: &Har, url: &UrlPattern, assertion: &Assertion) -> AssertionResult {
    let requests = find_most_recent_entry(har, url)
        .map(|entry| vec![evaluate(entry, assertion)])
        .unwrap_or_default();
    AssertionResult::from_entries(requests)
}

/// Apply an assertion to every matching entry
pub fn assert_all(har: &Har, url: &UrlPattern, assertion: &Assertion) -> AssertionResult {
    let requests = find_entries(har, url)
        .into_iter()
        .map(|entry| evaluate(entry, assertion))
        .collect();
    AssertionResult::from_entries(requests)
}

fn evaluate(entry: &Entry, assertion: &Assertion) -> AssertionEntry {
    let outcome = assertion.check(entry);
    if let Err(message) = &outcome {
        tracing::debug!("Assertion failed for {}: {}", entry.request.url, message);
    }
    AssertionEntry {
        url: entry.request.url.clone(),
        failed: outcome.is_err(),
        message: outcome.err(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::har::{Creator, Header, Request};

    fn entry(url: &str, started: &str, status: i64, time: i64, body: &str) -> Entry {
        let mut entry = Entry::new(
            Some("page_1".to_string()),
            started.to_string(),
            Request::new("GET", url, "HTTP/1.1"),
        );
        entry.time = time;
        entry.response.status = status;
        entry.response.content.text = Some(body.to_string());
        entry.response.content.size = body.len() as i64;
        entry
            .response
            .headers
            .push(Header::new("Content-Type", "application/json; charset=utf-8"));
        entry
    }

    fn sample_har() -> Har {
        let mut har = Har::new(Creator::new("skua", "test"));
        har.log.entries = vec![
            entry(
                "http://example.com/api/users",
                "2024-01-01T00:00:01.000Z",
                200,
                40,
                r#"{"users":[]}"#,
            ),
            entry(
                "http://example.com/api/orders",
                "2024-01-01T00:00:02.000Z",
                500,
                900,
                "boom",
            ),
            entry(
                "http://example.com/api/users",
                "2024-01-01T00:00:03.000Z",
                404,
                15,
                "not found",
            ),
        ];
        har
    }

    #[test]
    fn test_find_most_recent_entry() {
        let har = sample_har();
        let pattern = UrlPattern::new(".*/users").unwrap();
        let found = find_most_recent_entry(&har, &pattern).unwrap();
        assert_eq!(found.response.status, 404);
        assert_eq!(find_entries(&har, &pattern).len(), 2);
    }

    #[test]
    fn test_assert_all_status_class() {
        let har = sample_har();
        let pattern = UrlPattern::new("http://example\\.com/api/.*").unwrap();
        let result = assert_all(
            &har,
            &pattern,
            &Assertion::StatusClass(StatusFilter::parse("2xx").unwrap()),
        );
        assert!(!result.passed);
        assert!(result.failed);
        assert_eq!(result.result, "1 passed, 3 total");
        assert_eq!(result.requests.iter().filter(|r| r.failed).count(), 2);
        assert!(result.requests[1].message.as_deref().unwrap().contains("500"));
    }

    #[test]
    fn test_assert_most_recent_content() {
        let har = sample_har();
        let pattern = UrlPattern::new(".*/users").unwrap();

        let contains =
            assert_most_recent(&har, &pattern, &Assertion::ContentContains("found".into()));
        assert!(contains.passed);
        assert_eq!(contains.result, "1 passed, 1 total");

        let matches = assert_most_recent(
            &har,
            &pattern,
            &Assertion::ContentMatches(UrlPattern::new("not .*").unwrap()),
        );
        assert!(matches.passed);

        let absent = assert_most_recent(
            &har,
            &pattern,
            &Assertion::ContentDoesNotContain("not".into()),
        );
        assert!(absent.failed);
    }

    #[test]
    fn test_assert_response_time() {
        let har = sample_har();
        let pattern = UrlPattern::new(".*").unwrap();
        let result = assert_all(&har, &pattern, &Assertion::ResponseTimeLessThanOrEqual(100));
        assert_eq!(result.result, "2 passed, 3 total");
    }

    #[test]
    fn test_assert_headers() {
        let har = sample_har();
        let pattern = UrlPattern::new(".*/orders").unwrap();

        let named = assert_most_recent(
            &har,
            &pattern,
            &Assertion::HeaderContains {
                name: Some("content-type".into()),
                value: "json".into(),
            },
        );
        assert!(named.passed);

        let wrong_name = assert_most_recent(
            &har,
            &pattern,
            &Assertion::HeaderContains {
                name: Some("x-missing".into()),
                value: "json".into(),
            },
        );
        assert!(wrong_name.failed);

        let matches = assert_most_recent(
            &har,
            &pattern,
            &Assertion::HeaderMatches {
                name: Some(UrlPattern::new("(?i)content-type").unwrap()),
                value: UrlPattern::new("application/json.*").unwrap(),
            },
        );
        assert!(matches.passed);
    }

    #[test]
    fn test_no_match_passes_vacuously() {
        let har = sample_har();
        let pattern = UrlPattern::new(".*/nothing").unwrap();
        let result = assert_most_recent(&har, &pattern, &Assertion::StatusEquals(200));
        assert!(result.passed);
        assert!(result.requests.is_empty());
        assert_eq!(result.result, "0 passed, 0 total");
    }
}
