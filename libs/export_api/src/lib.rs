//! The export HTTP contract shared by the gateway and the export service:
//! request validation rules, response headers and the health payload.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// MIME type of an Office Open XML spreadsheet.
pub const XLSX_CONTENT_TYPE: &str =
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";

/// Rows exported when the request does not say otherwise.
pub const DEFAULT_ROW_COUNT: i64 = 30_000;

/// Upper bound on rows per export; matches the worksheet row capacity.
pub const MAX_ROW_COUNT: i64 = 1_048_576;

/// Longest accepted download-name prefix.
pub const MAX_FILENAME_PREFIX_LEN: usize = 50;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("rowCount must be an integer between 1 and {MAX_ROW_COUNT}, got {0}")]
pub struct RowCountOutOfRange(pub i64);

/// Applies the default and the accepted range. Non-integer input never gets
/// here; it fails at query-parameter parsing.
pub fn validate_row_count(requested: Option<i64>) -> Result<i64, RowCountOutOfRange> {
    let rows = requested.unwrap_or(DEFAULT_ROW_COUNT);
    if (1..=MAX_ROW_COUNT).contains(&rows) {
        Ok(rows)
    } else {
        Err(RowCountOutOfRange(rows))
    }
}

/// Download name `<prefix>-YYYY-MM-DD-HHMMSS.xlsx`. The prefix is reduced to
/// `[A-Za-z0-9_-]`, truncated to [`MAX_FILENAME_PREFIX_LEN`] and falls back
/// to `report` when nothing survives sanitization.
pub fn export_filename(prefix: &str, now: DateTime<Utc>) -> String {
    let mut clean: String = prefix
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .take(MAX_FILENAME_PREFIX_LEN)
        .collect();
    if clean.is_empty() {
        clean.push_str("report");
    }
    format!("{}-{}.xlsx", clean, now.format("%Y-%m-%d-%H%M%S"))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub timestamp: String,
}

impl HealthStatus {
    pub fn ok() -> Self {
        HealthStatus {
            status: "ok".to_string(),
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn row_count_range() {
        assert_eq!(validate_row_count(None), Ok(DEFAULT_ROW_COUNT));
        assert_eq!(validate_row_count(Some(1)), Ok(1));
        assert_eq!(validate_row_count(Some(MAX_ROW_COUNT)), Ok(MAX_ROW_COUNT));
        assert_eq!(validate_row_count(Some(0)), Err(RowCountOutOfRange(0)));
        assert_eq!(validate_row_count(Some(-5)), Err(RowCountOutOfRange(-5)));
        assert_eq!(
            validate_row_count(Some(MAX_ROW_COUNT + 1)),
            Err(RowCountOutOfRange(MAX_ROW_COUNT + 1))
        );
    }

    #[test]
    fn filename_is_sanitized_and_stamped() {
        let now = Utc.with_ymd_and_hms(2024, 3, 7, 9, 30, 5).unwrap();
        assert_eq!(export_filename("report", now), "report-2024-03-07-093005.xlsx");
        assert_eq!(
            export_filename("../etc/passwd", now),
            "etcpasswd-2024-03-07-093005.xlsx"
        );
        assert_eq!(export_filename("##!!", now), "report-2024-03-07-093005.xlsx");
        let long = "x".repeat(80);
        let name = export_filename(&long, now);
        assert!(name.starts_with(&"x".repeat(MAX_FILENAME_PREFIX_LEN)));
        assert!(!name.starts_with(&"x".repeat(MAX_FILENAME_PREFIX_LEN + 1)));
    }
}
