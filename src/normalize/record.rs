// ABOUTME: The vehicle change record and its lossy tabular projection
// ABOUTME: Explicit struct with named optional fields; unknown feed fields ride along flattened

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Change-type tag carried by delta records. Bulk snapshot records carry
/// none.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Modification {
    Created,
    Updated,
    Deleted,
}

impl Modification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Modification::Created => "CREATED",
            Modification::Updated => "UPDATED",
            Modification::Deleted => "DELETED",
        }
    }
}

/// One vehicle record as published by the feed.
///
/// `registration` is the natural key and the only required field; a line
/// without it is malformed. Uniqueness within a period is not guaranteed;
/// the last occurrence in file-processing order is authoritative for that
/// period. Fields this struct does not name are preserved in `extra` so
/// the tabular autodetection downstream sees everything the feed sent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VehicleRecord {
    pub registration: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub make: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub primary_colour: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secondary_colour: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fuel_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub engine_size: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manufacture_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registration_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_used_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_mot_test_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modification: Option<Modification>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mot_tests: Vec<JsonValue>,
    /// Effective data date, injected during normalization.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, JsonValue>,
}

/// Column set of the lossy CSV projection, in output order.
pub const CSV_FIELDS: [&str; 15] = [
    "date",
    "registration",
    "make",
    "model",
    "primaryColour",
    "secondaryColour",
    "fuelType",
    "engineSize",
    "manufactureDate",
    "registrationDate",
    "firstUsedDate",
    "lastMotTestDate",
    "modification",
    "motTestCount",
    "motTests",
];

impl VehicleRecord {
    /// Flatten the record into the fixed CSV column set.
    ///
    /// Variable-length test history becomes a count plus a serialized
    /// JSON blob. This projection is lossy and never feeds the merge
    /// path.
    pub fn csv_row(&self) -> Vec<String> {
        fn opt(value: &Option<String>) -> String {
            value.clone().unwrap_or_default()
        }

        vec![
            opt(&self.date),
            self.registration.clone(),
            opt(&self.make),
            opt(&self.model),
            opt(&self.primary_colour),
            opt(&self.secondary_colour),
            opt(&self.fuel_type),
            opt(&self.engine_size),
            opt(&self.manufacture_date),
            opt(&self.registration_date),
            opt(&self.first_used_date),
            opt(&self.last_mot_test_date),
            self.modification
                .map(|m| m.as_str().to_string())
                .unwrap_or_default(),
            self.mot_tests.len().to_string(),
            serde_json::to_string(&self.mot_tests).unwrap_or_else(|_| "[]".to_string()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "registration": "AB12CDE",
        "make": "FORD",
        "model": "FOCUS",
        "primaryColour": "Blue",
        "fuelType": "PE",
        "engineSize": "1796",
        "lastMotTestDate": "2026-01-05",
        "modification": "UPDATED",
        "motTests": [{"testResult": "PASSED", "completedDate": "2026-01-05"}],
        "euroStatus": "6"
    }"#;

    #[test]
    fn test_deserialize_known_and_unknown_fields() {
        let record: VehicleRecord = serde_json::from_str(SAMPLE).unwrap();
        assert_eq!(record.registration, "AB12CDE");
        assert_eq!(record.make.as_deref(), Some("FORD"));
        assert_eq!(record.modification, Some(Modification::Updated));
        assert_eq!(record.mot_tests.len(), 1);
        // Unknown fields survive in the flattened map
        assert_eq!(record.extra["euroStatus"], "6");
    }

    #[test]
    fn test_unknown_fields_survive_round_trip() {
        let mut record: VehicleRecord = serde_json::from_str(SAMPLE).unwrap();
        record.date = Some("04-01-2026".to_string());

        let rendered = serde_json::to_string(&record).unwrap();
        let reparsed: serde_json::Value = serde_json::from_str(&rendered).unwrap();
        assert_eq!(reparsed["euroStatus"], "6");
        assert_eq!(reparsed["date"], "04-01-2026");
        assert_eq!(reparsed["modification"], "UPDATED");
    }

    #[test]
    fn test_missing_registration_is_malformed() {
        let result = serde_json::from_str::<VehicleRecord>(r#"{"make": "FORD"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_unknown_modification_is_malformed() {
        let result =
            serde_json::from_str::<VehicleRecord>(r#"{"registration": "X", "modification": "MOVED"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_csv_row_counts_and_serializes_history() {
        let mut record: VehicleRecord = serde_json::from_str(SAMPLE).unwrap();
        record.date = Some("04-01-2026".to_string());

        let row = record.csv_row();
        assert_eq!(row.len(), CSV_FIELDS.len());
        assert_eq!(row[0], "04-01-2026");
        assert_eq!(row[1], "AB12CDE");
        assert_eq!(row[12], "UPDATED");
        assert_eq!(row[13], "1");
        assert!(row[14].contains("PASSED"));
    }

    #[test]
    fn test_csv_row_empty_history() {
        let record: VehicleRecord =
            serde_json::from_str(r#"{"registration": "X"}"#).unwrap();
        let row = record.csv_row();
        assert_eq!(row[13], "0");
        assert_eq!(row[14], "[]");
    }
}
