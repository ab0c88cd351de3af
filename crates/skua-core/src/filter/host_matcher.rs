use regex::Regex;

/// A host pattern with simple `*` wildcards, e.g. `*.internal.example.com`.
///
/// `*` matches any run of characters and every other character is literal.
/// Matching is case-insensitive and anchored at both ends.
#[derive(Debug, Clone)]
pub struct HostPattern {
    source: String,
    regex: Regex,
}

impl HostPattern {
    pub fn parse(pattern: &str) -> crate::Result<Self> {
        let source = pattern.trim().to_lowercase();
        if source.is_empty() {
            return Err(crate::Error::InvalidPattern(
                "Empty host pattern".to_string(),
            ));
        }

        let body = source
            .split('*')
            .map(regex::escape)
            .collect::<Vec<_>>()
            .join(".*?");

        let regex = Regex::new(&format!("^{}$", body)).map_err(|e| {
            crate::Error::InvalidPattern(format!("Invalid host pattern '{}': {}", pattern, e))
        })?;

        Ok(Self { source, regex })
    }

    pub fn matches(&self, hostname: &str) -> bool {
        self.regex.is_match(&hostname.to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_match() {
        let pattern = HostPattern::parse("api.example.com").unwrap();
        assert!(pattern.matches("api.example.com"));
        assert!(pattern.matches("API.EXAMPLE.COM"));
        assert!(!pattern.matches("web.example.com"));
        assert!(!pattern.matches("api.example.com.extra"));
    }

    #[test]
    fn test_dot_is_literal() {
        let pattern = HostPattern::parse("api.example.com").unwrap();
        assert!(!pattern.matches("apiXexample.com"));
    }

    #[test]
    fn test_wildcard_prefix() {
        let pattern = HostPattern::parse("*.example.com").unwrap();
        assert!(pattern.matches("api.example.com"));
        assert!(pattern.matches("a.b.example.com"));
        assert!(!pattern.matches("example.com"));
        assert!(!pattern.matches("api.different.com"));
    }

    #[test]
    fn test_wildcard_middle() {
        let pattern = HostPattern::parse("10.0.*.1").unwrap();
        assert!(pattern.matches("10.0.3.1"));
        assert!(pattern.matches("10.0.200.1"));
        assert!(!pattern.matches("10.1.3.1"));
    }

    #[test]
    fn test_empty_pattern_rejected() {
        assert!(HostPattern::parse("  ").is_err());
    }
}
