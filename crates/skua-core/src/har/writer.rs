use super::types::Har;
use crate::Result;
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

pub struct HarWriter;

impl HarWriter {
    /// Write a HAR structure to a file
    pub fn to_file(har: &Har, path: &Path) -> Result<()> {
        tracing::debug!("Writing HAR file to: {}", path.display());

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let file = File::create(path)?;
        let writer = BufWriter::new(file);
        serde_json::to_writer_pretty(writer, har)?;

        tracing::info!(
            "Wrote HAR file with {} entries to {}",
            har.log.entries.len(),
            path.display()
        );

        Ok(())
    }

    /// Convert a HAR structure to a JSON string
    pub fn to_string(har: &Har) -> Result<String> {
        Ok(serde_json::to_string_pretty(har)?)
    }

    /// Convert a HAR structure to a compact JSON string
    pub fn to_string_compact(har: &Har) -> Result<String> {
        Ok(serde_json::to_string(har)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::har::Creator;

    #[test]
    fn test_har_to_string() {
        let har = Har::new(Creator::new("skua", "0.1.0"));

        let json = HarWriter::to_string(&har).unwrap();
        assert!(json.contains("\"version\": \"1.2\""));
        assert!(json.contains("\"pages\": []"));
    }

    #[test]
    fn test_har_to_file() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("nested").join("capture.har");

        let har = Har::new(Creator::new("skua", "0.1.0"));
        HarWriter::to_file(&har, &path).unwrap();

        let written = std::fs::read_to_string(&path).unwrap();
        let parsed: Har = serde_json::from_str(&written).unwrap();
        assert_eq!(parsed.log.creator.name, "skua");
        assert!(parsed.log.entries.is_empty());
    }
}
