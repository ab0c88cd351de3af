mod host_matcher;

pub use host_matcher::HostPattern;

use regex::Regex;

/// A regular expression that must match a whole URL (or method) to apply
#[derive(Debug, Clone)]
pub struct UrlPattern {
    source: String,
    regex: Regex,
}

impl UrlPattern {
    pub fn new(pattern: &str) -> crate::Result<Self> {
        let regex = Regex::new(&format!("^(?:{})$", pattern)).map_err(|e| {
            crate::Error::InvalidPattern(format!("Invalid pattern '{}': {}", pattern, e))
        })?;
        Ok(Self {
            source: pattern.to_string(),
            regex,
        })
    }

    pub fn matches(&self, candidate: &str) -> bool {
        self.regex.is_match(candidate)
    }

    /// The pattern as supplied, without the anchors
    pub fn as_str(&self) -> &str {
        &self.source
    }
}

impl PartialEq for UrlPattern {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl Eq for UrlPattern {}

/// Status filter for HTTP status codes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusFilter {
    /// Exact status code (e.g., 404)
    Exact(i64),
    /// Status code range (e.g., 200-299 for "2xx")
    Range(i64, i64),
}

impl StatusFilter {
    /// Parse a status filter pattern
    ///
    /// Supports:
    /// - Exact: "404", "200"
    /// - Class shorthand: "2xx", "4xx", "5xx"
    /// - Explicit range: "200-299", "500-599"
    pub fn parse(pattern: &str) -> crate::Result<Self> {
        let pattern = pattern.trim();

        if pattern.len() == 3 && pattern.to_lowercase().ends_with("xx") {
            if let Some(digit) = pattern.chars().next().and_then(|c| c.to_digit(10)) {
                return Ok(StatusFilter::class(digit as i64));
            }
        }

        if let Some((start_str, end_str)) = pattern.split_once('-') {
            let start = start_str.trim().parse::<i64>().map_err(|_| {
                crate::Error::InvalidPattern(format!("Invalid status range start: {}", start_str))
            })?;
            let end = end_str.trim().parse::<i64>().map_err(|_| {
                crate::Error::InvalidPattern(format!("Invalid status range end: {}", end_str))
            })?;
            return Ok(StatusFilter::Range(start, end));
        }

        let code = pattern.parse::<i64>().map_err(|_| {
            crate::Error::InvalidPattern(format!("Invalid status code: {}", pattern))
        })?;
        Ok(StatusFilter::Exact(code))
    }

    /// The whole class of a leading digit, e.g. `class(4)` is 400-499
    pub fn class(digit: i64) -> Self {
        let start = digit * 100;
        StatusFilter::Range(start, start + 99)
    }

    pub fn matches(&self, status: i64) -> bool {
        match self {
            StatusFilter::Exact(code) => status == *code,
            StatusFilter::Range(start, end) => status >= *start && status <= *end,
        }
    }
}

impl std::fmt::Display for StatusFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StatusFilter::Exact(code) => write!(f, "{}", code),
            StatusFilter::Range(start, end) if end - start == 99 && start % 100 == 0 => {
                write!(f, "{}xx", start / 100)
            }
            StatusFilter::Range(start, end) => write!(f, "{}-{}", start, end),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_pattern_is_anchored() {
        let pattern = UrlPattern::new("https?://example\\.com/.*").unwrap();
        assert!(pattern.matches("http://example.com/a"));
        assert!(pattern.matches("https://example.com/"));
        assert!(!pattern.matches("http://evil.com/?http://example.com/"));
    }

    #[test]
    fn test_url_pattern_alternation_stays_anchored() {
        let pattern = UrlPattern::new("GET|POST").unwrap();
        assert!(pattern.matches("GET"));
        assert!(!pattern.matches("GETX"));
        assert!(!pattern.matches("XPOST"));
    }

    #[test]
    fn test_url_pattern_invalid() {
        assert!(UrlPattern::new("(unclosed").is_err());
    }

    #[test]
    fn test_status_filter_exact() {
        let filter = StatusFilter::parse("404").unwrap();
        assert!(filter.matches(404));
        assert!(!filter.matches(200));
    }

    #[test]
    fn test_status_filter_class() {
        let filter = StatusFilter::parse("2xx").unwrap();
        assert!(filter.matches(200));
        assert!(filter.matches(299));
        assert!(!filter.matches(199));
        assert!(!filter.matches(300));
        assert_eq!(filter.to_string(), "2xx");
    }

    #[test]
    fn test_status_filter_explicit_range() {
        let filter = StatusFilter::parse("500-599").unwrap();
        assert!(filter.matches(503));
        assert!(!filter.matches(600));
    }

    #[test]
    fn test_status_filter_invalid() {
        assert!(StatusFilter::parse("abc").is_err());
        assert!(StatusFilter::parse("1xxx").is_err());
        assert!(StatusFilter::parse("200-abc").is_err());
    }
}
