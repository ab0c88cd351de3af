use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// One opt-in capture flag.
///
/// Sizes, the status line and timings are always recorded while capture is
/// active; these flags control everything else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureType {
    RequestHeaders,
    RequestCookies,
    RequestContent,
    RequestBinaryContent,
    ResponseHeaders,
    ResponseCookies,
    ResponseContent,
    ResponseBinaryContent,
}

impl CaptureType {
    pub const ALL: [CaptureType; 8] = [
        CaptureType::RequestHeaders,
        CaptureType::RequestCookies,
        CaptureType::RequestContent,
        CaptureType::RequestBinaryContent,
        CaptureType::ResponseHeaders,
        CaptureType::ResponseCookies,
        CaptureType::ResponseContent,
        CaptureType::ResponseBinaryContent,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CaptureType::RequestHeaders => "request_headers",
            CaptureType::RequestCookies => "request_cookies",
            CaptureType::RequestContent => "request_content",
            CaptureType::RequestBinaryContent => "request_binary_content",
            CaptureType::ResponseHeaders => "response_headers",
            CaptureType::ResponseCookies => "response_cookies",
            CaptureType::ResponseContent => "response_content",
            CaptureType::ResponseBinaryContent => "response_binary_content",
        }
    }

    /// Parse a flag name, accepting `-` or `_` separators in any case
    pub fn parse(name: &str) -> crate::Result<Self> {
        let normalized = name.trim().to_lowercase().replace('-', "_");
        CaptureType::ALL
            .into_iter()
            .find(|t| t.as_str() == normalized)
            .ok_or_else(|| crate::Error::InvalidPattern(format!("Unknown capture type: {}", name)))
    }
}

/// A set of independent capture flags
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CaptureTypeSet(BTreeSet<CaptureType>);

impl CaptureTypeSet {
    /// No optional capture: basic fields only
    pub fn none() -> Self {
        Self::default()
    }

    pub fn all() -> Self {
        CaptureType::ALL.into_iter().collect()
    }

    pub fn headers() -> Self {
        [CaptureType::RequestHeaders, CaptureType::ResponseHeaders]
            .into_iter()
            .collect()
    }

    pub fn cookies() -> Self {
        [CaptureType::RequestCookies, CaptureType::ResponseCookies]
            .into_iter()
            .collect()
    }

    /// Text content only; binary bodies are skipped
    pub fn non_binary_content() -> Self {
        [CaptureType::RequestContent, CaptureType::ResponseContent]
            .into_iter()
            .collect()
    }

    pub fn binary_content() -> Self {
        [
            CaptureType::RequestBinaryContent,
            CaptureType::ResponseBinaryContent,
        ]
        .into_iter()
        .collect()
    }

    pub fn contains(&self, capture_type: CaptureType) -> bool {
        self.0.contains(&capture_type)
    }

    pub fn insert(&mut self, capture_type: CaptureType) -> bool {
        self.0.insert(capture_type)
    }

    pub fn remove(&mut self, capture_type: CaptureType) -> bool {
        self.0.remove(&capture_type)
    }

    pub fn enable(&mut self, other: &CaptureTypeSet) {
        self.0.extend(other.0.iter().copied());
    }

    pub fn disable(&mut self, other: &CaptureTypeSet) {
        self.0.retain(|t| !other.contains(*t));
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = CaptureType> + '_ {
        self.0.iter().copied()
    }
}

impl FromIterator<CaptureType> for CaptureTypeSet {
    fn from_iter<I: IntoIterator<Item = CaptureType>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}
