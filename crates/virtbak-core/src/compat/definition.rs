//! Definition record migration.

use regex::Regex;
use semver::Version;
use serde_json::{Map, Value, json};

use super::record_version;
use crate::error::{Error, Result};
use crate::naming;

/// Run the converter chain over a raw definition record.
pub fn convert(definition: &mut Map<String, Value>) -> Result<()> {
    let version = record_version(definition)?;
    if Version::new(0, 1, 0) <= version && version < Version::new(0, 4, 0) {
        tracing::debug!(
            record = %record_label(definition),
            "migrating definition to v0.4.0"
        );
        to_v0_4(definition)?;
    }
    Ok(())
}

fn record_label(record: &Map<String, Value>) -> String {
    record
        .get("name")
        .or_else(|| record.get("domain_name"))
        .and_then(Value::as_str)
        .unwrap_or("<unnamed>")
        .to_string()
}

/// v0.1 -> v0.4: `compression`/`compression_lvl` become a `packager` section
/// and the backup gains an explicit `name`.
pub(crate) fn to_v0_4(record: &mut Map<String, Value>) -> Result<()> {
    convert_compression(record);
    convert_name(record)?;
    record.insert("version".to_string(), Value::from("0.4.0"));
    Ok(())
}

fn convert_compression(record: &mut Map<String, Value>) {
    if let Some(old) = record.remove("compression") {
        let mut opts = Map::new();
        let kind = match old.as_str() {
            // a null compression meant plain files in a directory
            None => "directory",
            Some("tar") => "tar",
            Some(other) => {
                opts.insert("compression".to_string(), Value::from(other));
                "tar"
            }
        };
        record.insert(
            "packager".to_string(),
            json!({"type": kind, "opts": opts}),
        );
    } else if !record.contains_key("packager") {
        record.insert(
            "packager".to_string(),
            json!({"type": "directory", "opts": {}}),
        );
    }

    if let Some(lvl) = record.remove("compression_lvl") {
        if let Some(opts) = record
            .get_mut("packager")
            .and_then(Value::as_object_mut)
            .and_then(|p| p.get_mut("opts"))
            .and_then(Value::as_object_mut)
        {
            opts.insert("compression_lvl".to_string(), lvl);
        }
    }
}

fn convert_name(record: &mut Map<String, Value>) -> Result<()> {
    if let Some(tar) = record.remove("tar") {
        let archive = tar.as_str().unwrap_or_default().to_string();
        let stripped = Regex::new(r"^(.*)\.tar(\..*)?$")
            .map_err(|e| Error::InvalidMetadata(e.to_string()))?
            .captures(&archive)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
            .unwrap_or(archive);
        record.insert("name".to_string(), Value::from(stripped));
    }

    if !record.contains_key("name") {
        let date = record
            .get("date")
            .and_then(Value::as_i64)
            .ok_or_else(|| Error::InvalidMetadata("record has no date field".to_string()))?;
        let domain_id = record
            .get("domain_id")
            .and_then(Value::as_i64)
            .ok_or_else(|| Error::InvalidMetadata("record has no domain_id field".to_string()))?;
        let domain_name = record
            .get("domain_name")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::InvalidMetadata("record has no domain_name field".to_string()))?;
        let name = naming::backup_name_from_timestamp(date, domain_id, domain_name)?;
        record.insert("name".to_string(), Value::from(name));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn as_map(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn test_convert_v0_1_with_tar_archive() {
        let mut record = as_map(json!({
            "compression": "gz",
            "compression_lvl": 6,
            "domain_id": 3,
            "domain_name": "test-domain",
            "version": "0.1.0",
            "date": 1569890041,
            "tar": "20191001-003401_3_test-domain.tar.gz",
        }));
        convert(&mut record).unwrap();

        let expected = as_map(json!({
            "name": "20191001-003401_3_test-domain",
            "domain_id": 3,
            "domain_name": "test-domain",
            "version": "0.4.0",
            "date": 1569890041,
            "packager": {"type": "tar", "opts": {"compression": "gz", "compression_lvl": 6}},
        }));
        assert_eq!(record, expected);
    }

    #[test]
    fn test_convert_null_compression_means_directory() {
        let mut record = as_map(json!({
            "compression": null,
            "domain_id": 1,
            "domain_name": "test",
            "version": "0.1.0",
            "date": 1569890041,
        }));
        convert(&mut record).unwrap();

        assert_eq!(record["packager"], json!({"type": "directory", "opts": {}}));
    }

    #[test]
    fn test_convert_absent_packager_defaults_to_directory() {
        let mut record = as_map(json!({
            "domain_id": 1,
            "domain_name": "test",
            "version": "0.1.0",
            "date": 1569890041,
        }));
        convert(&mut record).unwrap();

        assert_eq!(record["packager"], json!({"type": "directory", "opts": {}}));
        // name derived from the date, rendered in local time
        let expected_name = naming::backup_name_from_timestamp(1569890041, 1, "test").unwrap();
        assert_eq!(record["name"], Value::from(expected_name));
        assert_eq!(record["version"], Value::from("0.4.0"));
    }

    #[test]
    fn test_tar_compression_value_means_uncompressed_tar() {
        let mut record = as_map(json!({
            "compression": "tar",
            "domain_id": 1,
            "domain_name": "test",
            "version": "0.1.0",
            "date": 1569890041,
        }));
        convert(&mut record).unwrap();

        assert_eq!(record["packager"], json!({"type": "tar", "opts": {}}));
    }

    #[test]
    fn test_future_versions_pass_through() {
        let original = as_map(json!({
            "version": "9.9.9",
            "domain_id": 1,
            "domain_name": "test",
            "date": 1569890041,
            "name": "x",
            "packager": {"type": "zstd", "opts": {}},
        }));
        let mut record = original.clone();
        convert(&mut record).unwrap();
        assert_eq!(record, original);
    }
}
