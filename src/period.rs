// ABOUTME: Period labels for dated feed artifacts (bulk snapshots and delta files)
// ABOUTME: Parses kind and date out of basenames and derives the effective data date

use chrono::NaiveDate;

/// Which section of the manifest an artifact belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Bulk,
    Delta,
}

impl FileKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileKind::Bulk => "bulk",
            FileKind::Delta => "delta",
        }
    }
}

/// One dated unit of source data: a single manifest entry, archive, or
/// period directory. The label is the basename with storage extensions
/// stripped, e.g. `delta-light-vehicle_02-02-2026`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Period {
    pub label: String,
    pub kind: FileKind,
    pub date: NaiveDate,
}

impl Period {
    /// Parse a period out of a file or directory basename.
    ///
    /// Accepts archive names (`bulk-light-vehicle_02-02-2026.tar.gz`),
    /// period directories (`delta-light-vehicle_02-02-2026`) and loose
    /// member files (`delta_10-01-2026.json.gz`). Returns `None` for
    /// anything that does not carry a recognizable kind prefix and a
    /// trailing `dd-mm-yyyy` date.
    pub fn parse(basename: &str) -> Option<Period> {
        let label = strip_storage_extensions(basename);
        let (head, date_str) = label.rsplit_once('_')?;

        let kind = if head.starts_with("bulk") {
            FileKind::Bulk
        } else if head.starts_with("delta") {
            FileKind::Delta
        } else {
            return None;
        };

        let date = NaiveDate::parse_from_str(date_str, "%d-%m-%Y").ok()?;
        Some(Period {
            label: label.to_string(),
            kind,
            date,
        })
    }

    /// The date the period's data actually describes.
    ///
    /// The feed's folder date is the generation day; the dataset covers
    /// the prior day. This is a feed rule, not an off-by-one.
    pub fn effective_date(&self) -> NaiveDate {
        self.date.pred_opt().unwrap_or(self.date)
    }

    /// The effective date rendered the way the feed renders dates.
    pub fn effective_date_string(&self) -> String {
        self.effective_date().format("%d-%m-%Y").to_string()
    }

    /// Basename of the normalized output for this period.
    pub fn output_filename(&self) -> String {
        format!("{}.json", self.label)
    }
}

fn strip_storage_extensions(basename: &str) -> &str {
    for suffix in [".json.gz", ".tar.gz", ".json"] {
        if let Some(stripped) = basename.strip_suffix(suffix) {
            return stripped;
        }
    }
    basename
}
