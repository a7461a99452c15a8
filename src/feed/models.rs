// ABOUTME: Data structures for the bulk-download manifest response
// ABOUTME: Explicit serde structs validated at the deserialization boundary

use serde::{Deserialize, Serialize};

/// One downloadable artifact advertised by the manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub filename: String,
    #[serde(rename = "downloadUrl")]
    pub download_url: String,
    /// Size hint; some manifests omit it, so it defaults to zero.
    #[serde(rename = "fileSize", default)]
    pub file_size: u64,
}

impl ManifestEntry {
    /// The basename the artifact is stored (and deduplicated) under.
    pub fn basename(&self) -> &str {
        self.filename
            .rsplit('/')
            .next()
            .unwrap_or(&self.filename)
    }
}

/// The manifest endpoint's response: full snapshots plus incremental
/// change-files, each list in chronological publication order.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub bulk: Vec<ManifestEntry>,
    #[serde(default)]
    pub delta: Vec<ManifestEntry>,
}

impl Manifest {
    /// The chronologically last delta entry, or `None` when the feed has
    /// published no deltas. Manifest order is assumed chronological.
    pub fn latest_delta(&self) -> Option<&ManifestEntry> {
        self.delta.last()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manifest_deserialization() {
        let raw = r#"{
            "bulk": [
                {"filename": "bulk-light-vehicle_02-02-2026.tar.gz",
                 "downloadUrl": "https://cdn.example.com/bulk.tar.gz",
                 "fileSize": 123456}
            ],
            "delta": [
                {"filename": "delta_09-01-2026.json.gz",
                 "downloadUrl": "https://cdn.example.com/d1.json.gz"},
                {"filename": "delta_10-01-2026.json.gz",
                 "downloadUrl": "https://cdn.example.com/d2.json.gz",
                 "fileSize": 42}
            ]
        }"#;

        let manifest: Manifest = serde_json::from_str(raw).unwrap();
        assert_eq!(manifest.bulk.len(), 1);
        assert_eq!(manifest.bulk[0].file_size, 123456);
        assert_eq!(manifest.delta.len(), 2);
        // Missing fileSize falls back to zero
        assert_eq!(manifest.delta[0].file_size, 0);
    }

    #[test]
    fn test_manifest_missing_sections_default_empty() {
        let manifest: Manifest = serde_json::from_str("{}").unwrap();
        assert!(manifest.bulk.is_empty());
        assert!(manifest.delta.is_empty());
        assert!(manifest.latest_delta().is_none());
    }

    #[test]
    fn test_latest_delta_is_last_entry() {
        let raw = r#"{"delta": [
            {"filename": "delta_08-01-2026.json.gz", "downloadUrl": "u1"},
            {"filename": "delta_09-01-2026.json.gz", "downloadUrl": "u2"},
            {"filename": "delta_10-01-2026.json.gz", "downloadUrl": "u3"}
        ]}"#;
        let manifest: Manifest = serde_json::from_str(raw).unwrap();
        assert_eq!(
            manifest.latest_delta().unwrap().filename,
            "delta_10-01-2026.json.gz"
        );
    }

    #[test]
    fn test_basename_strips_path_components() {
        let entry = ManifestEntry {
            filename: "2026/02/delta_10-01-2026.json.gz".to_string(),
            download_url: "u".to_string(),
            file_size: 0,
        };
        assert_eq!(entry.basename(), "delta_10-01-2026.json.gz");
    }
}
