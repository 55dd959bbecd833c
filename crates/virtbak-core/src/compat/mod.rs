//! Forward-only migration of versioned records.
//!
//! Converters form an ordered chain; each applies when the record's version
//! falls inside its range. Versions newer than every converter pass through
//! untouched, so records from future releases load as-is.

pub mod config;
pub mod definition;
pub mod pending_info;

use semver::Version;
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// Parse the `version` field of a record.
pub(crate) fn record_version(record: &Map<String, Value>) -> Result<Version> {
    let raw = record
        .get("version")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::InvalidMetadata("record has no version field".to_string()))?;
    parse_version(raw)
}

/// Lenient semver parse: early records used two-part versions like "0.1".
pub(crate) fn parse_version(raw: &str) -> Result<Version> {
    let padded = match raw.matches('.').count() {
        0 => format!("{raw}.0.0"),
        1 => format!("{raw}.0"),
        _ => raw.to_string(),
    };
    Version::parse(&padded)
        .map_err(|e| Error::InvalidMetadata(format!("bad record version {raw:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_version_pads_short_forms() {
        assert_eq!(parse_version("0.1").unwrap(), Version::new(0, 1, 0));
        assert_eq!(parse_version("0.4.0").unwrap(), Version::new(0, 4, 0));
    }

    #[test]
    fn test_parse_version_rejects_garbage() {
        assert!(parse_version("not-a-version").is_err());
    }
}
