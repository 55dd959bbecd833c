//! Pending-info record migration.
//!
//! Shares the v0.1 -> v0.4 step with definitions, then fills the per-disk
//! image format from the stored domain XML for records older than v0.5.2.

use semver::Version;
use serde_json::{Map, Value};

use super::{definition, record_version};
use crate::domain_xml;
use crate::error::{Error, Result};

/// Run the converter chain over a raw pending-info record.
pub fn convert(pending_info: &mut Map<String, Value>) -> Result<()> {
    let version = record_version(pending_info)?;
    if Version::new(0, 1, 0) <= version && version < Version::new(0, 4, 0) {
        definition::to_v0_4(pending_info)?;
    }

    let version = record_version(pending_info)?;
    if Version::new(0, 4, 0) <= version && version < Version::new(0, 5, 2) {
        to_v0_5_2(pending_info)?;
    }

    Ok(())
}

/// v0.4 -> v0.5.2: every per-disk entry gains a `type` field.
fn to_v0_5_2(record: &mut Map<String, Value>) -> Result<()> {
    record.insert("version".to_string(), Value::from("0.5.2"));

    let all_typed = record
        .get("disks")
        .and_then(Value::as_object)
        .is_none_or(|disks| disks.values().all(|d| d.get("type").is_some()));
    if all_typed {
        return Ok(());
    }

    let dom_xml = record
        .get("domain_xml")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::InvalidMetadata("pending info has no domain_xml".to_string()))?
        .to_string();

    if let Some(disks) = record.get_mut("disks").and_then(Value::as_object_mut) {
        for (dev, prop) in disks.iter_mut() {
            let Some(prop) = prop.as_object_mut() else {
                continue;
            };
            if prop.contains_key("type") {
                continue;
            }
            let format = domain_xml::disk_driver_type_of(&dom_xml, dev)?;
            prop.insert("type".to_string(), Value::from(format));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const DOM_XML: &str = r#"
<domain type="kvm" id="1">
  <name>test</name>
  <devices>
    <disk type="file" device="disk">
      <driver name="qemu" type="qcow2"/>
      <source file="/var/lib/libvirt/images/test-disk-1.qcow2"/>
      <target dev="vda" bus="virtio"/>
    </disk>
  </devices>
</domain>
"#;

    fn as_map(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn test_fill_disk_type_from_domain_xml() {
        let mut record = as_map(json!({
            "version": "0.4.0",
            "name": "20191001-003401_1_test",
            "domain_id": 1,
            "domain_name": "test",
            "domain_xml": DOM_XML,
            "date": 1569890041,
            "packager": {"type": "directory", "opts": {}},
            "disks": {
                "vda": {
                    "src": "/var/lib/libvirt/images/test-disk-1.qcow2",
                    "snapshot": "/var/lib/libvirt/images/test-disk-1.snap0",
                },
            },
        }));
        convert(&mut record).unwrap();

        assert_eq!(record["version"], Value::from("0.5.2"));
        assert_eq!(record["disks"]["vda"]["type"], Value::from("qcow2"));
    }

    #[test]
    fn test_typed_disks_are_left_alone() {
        let mut record = as_map(json!({
            "version": "0.4.0",
            "name": "20191001-003401_1_test",
            "domain_id": 1,
            "domain_name": "test",
            "date": 1569890041,
            "packager": {"type": "directory", "opts": {}},
            "disks": {
                "vda": {"src": "/a", "snapshot": "/b", "type": "raw"},
            },
        }));
        convert(&mut record).unwrap();

        assert_eq!(record["version"], Value::from("0.5.2"));
        assert_eq!(record["disks"]["vda"]["type"], Value::from("raw"));
    }

    #[test]
    fn test_v0_1_record_runs_both_converters() {
        let mut record = as_map(json!({
            "version": "0.1.0",
            "compression": null,
            "domain_id": 1,
            "domain_name": "test",
            "domain_xml": DOM_XML,
            "date": 1569890041,
            "disks": {
                "vda": {
                    "src": "/var/lib/libvirt/images/test-disk-1.qcow2",
                    "snapshot": "/var/lib/libvirt/images/test-disk-1.snap0",
                },
            },
        }));
        convert(&mut record).unwrap();

        assert_eq!(record["version"], Value::from("0.5.2"));
        assert_eq!(record["packager"]["type"], Value::from("directory"));
        assert_eq!(record["disks"]["vda"]["type"], Value::from("qcow2"));
    }
}
