//! Helpers over a domain's XML definition.
//!
//! All functions take the XML as text and return either extracted values or a
//! re-serialized tree; nothing here talks to the hypervisor. The parser does
//! not resolve external entities.

use std::collections::BTreeMap;

use xmltree::{Element, EmitterConfig, XMLNode};

use crate::error::{Error, Result};

/// One file-backed disk of a domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainDisk {
    /// Backing file path as referenced by the domain.
    pub src: String,
    /// Image format from the disk's driver element (qcow2, raw, ...).
    pub format: String,
}

pub fn parse(xml: &str) -> Result<Element> {
    Element::parse(xml.as_bytes()).map_err(|e| Error::InvalidXml(e.to_string()))
}

pub fn element_to_string(el: &Element) -> Result<String> {
    let mut buf = Vec::new();
    let config = EmitterConfig::new()
        .perform_indent(true)
        .write_document_declaration(false);
    el.write_with_config(&mut buf, config)
        .map_err(|e| Error::InvalidXml(e.to_string()))?;
    String::from_utf8(buf).map_err(|e| Error::InvalidXml(e.to_string()))
}

fn child_elements(el: &Element) -> impl Iterator<Item = &Element> {
    el.children.iter().filter_map(|node| match node {
        XMLNode::Element(e) => Some(e),
        _ => None,
    })
}

fn disk_elements(root: &Element) -> Vec<&Element> {
    root.get_child("devices")
        .map(|devices| {
            child_elements(devices)
                .filter(|e| e.name == "disk")
                .collect()
        })
        .unwrap_or_default()
}

fn attr<'a>(el: &'a Element, name: &str) -> Option<&'a str> {
    el.attributes.get(name).map(String::as_str)
}

fn target_dev(disk: &Element) -> Option<&str> {
    disk.get_child("target").and_then(|t| attr(t, "dev"))
}

/// Extract the file-backed disks of a domain.
///
/// With a non-empty `filter`, only the named devices are returned and every
/// missing name fails with [`Error::DiskNotFound`]. Non-file disks are never
/// returned; see [`incompatible_disks_of`].
pub fn domain_disks_of(xml: &str, filter: &[&str]) -> Result<BTreeMap<String, DomainDisk>> {
    let root = parse(xml)?;
    let mut disks = BTreeMap::new();

    for disk in disk_elements(&root) {
        if attr(disk, "device") != Some("disk") {
            continue;
        }
        let Some(dev) = target_dev(disk) else {
            continue;
        };
        if attr(disk, "type") != Some("file") {
            tracing::debug!(dev, "disk is not file-backed, skipping");
            continue;
        }
        if !filter.is_empty() && !filter.contains(&dev) {
            continue;
        }
        let (Some(src), Some(format)) = (
            disk.get_child("source").and_then(|s| attr(s, "file")),
            disk.get_child("driver").and_then(|d| attr(d, "type")),
        ) else {
            continue;
        };

        disks.insert(
            dev.to_string(),
            DomainDisk {
                src: src.to_string(),
                format: format.to_string(),
            },
        );
    }

    for dev in filter {
        if !disks.contains_key(*dev) {
            return Err(Error::DiskNotFound(dev.to_string()));
        }
    }

    Ok(disks)
}

/// Device names of disks that cannot be snapshot (everything not file-backed).
pub fn incompatible_disks_of(xml: &str) -> Result<Vec<String>> {
    let root = parse(xml)?;
    let mut devs: Vec<String> = disk_elements(&root)
        .into_iter()
        .filter(|disk| attr(disk, "device") == Some("disk") && attr(disk, "type") != Some("file"))
        .filter_map(|disk| target_dev(disk).map(str::to_string))
        .collect();
    devs.sort();
    Ok(devs)
}

/// The full `<disk>` element for a device, regardless of its backing type.
pub fn disk_block_of(xml: &str, dev: &str) -> Result<Element> {
    let root = parse(xml)?;
    disk_elements(&root)
        .into_iter()
        .find(|disk| attr(disk, "device") == Some("disk") && target_dev(disk) == Some(dev))
        .cloned()
        .ok_or_else(|| Error::DiskNotFound(dev.to_string()))
}

/// Serialized `<disk>` element, as fed to `updateDeviceFlags`.
pub fn disk_block_xml_of(xml: &str, dev: &str) -> Result<String> {
    element_to_string(&disk_block_of(xml, dev)?)
}

/// Driver type (image format) of a disk, looked up by device name.
pub fn disk_driver_type_of(xml: &str, dev: &str) -> Result<String> {
    let disk = disk_block_of(xml, dev)?;
    disk.get_child("driver")
        .and_then(|d| attr(d, "type"))
        .map(str::to_string)
        .ok_or_else(|| Error::InvalidXml(format!("disk {dev} has no driver type")))
}

/// Current backing file of a disk, as seen in the domain definition.
pub fn current_disk_source(xml: &str, dev: &str) -> Result<String> {
    let disk = disk_block_of(xml, dev)?;
    disk.get_child("source")
        .and_then(|s| attr(s, "file"))
        .map(str::to_string)
        .ok_or_else(|| Error::InvalidXml(format!("disk {dev} has no file source")))
}

fn find_disk_mut<'a>(root: &'a mut Element, dev: &str) -> Result<&'a mut Element> {
    let devices = root
        .get_mut_child("devices")
        .ok_or_else(|| Error::InvalidXml("domain has no devices element".to_string()))?;
    for node in devices.children.iter_mut() {
        if let XMLNode::Element(el) = node {
            if el.name == "disk"
                && attr(el, "device") == Some("disk")
                && el.get_child("target").and_then(|t| attr(t, "dev")) == Some(dev)
            {
                return Ok(el);
            }
        }
    }
    Err(Error::DiskNotFound(dev.to_string()))
}

/// Rewrite the backing file of one disk, returning the patched XML.
pub fn patch_disk_source(xml: &str, dev: &str, new_src: &str) -> Result<String> {
    let mut root = parse(xml)?;
    let disk = find_disk_mut(&mut root, dev)?;
    let source = disk
        .get_mut_child("source")
        .ok_or_else(|| Error::InvalidXml(format!("disk {dev} has no source element")))?;
    source
        .attributes
        .insert("file".to_string(), new_src.to_string());
    element_to_string(&root)
}

/// Copy the `<driver>` element of `stored_dev` in `stored_xml` onto
/// `target_dev` in `target_xml`, preserving the stored image format.
pub fn replace_disk_driver(
    target_xml: &str,
    target_dev: &str,
    stored_xml: &str,
    stored_dev: &str,
) -> Result<String> {
    let stored_disk = disk_block_of(stored_xml, stored_dev)?;
    let driver = stored_disk
        .get_child("driver")
        .cloned()
        .ok_or_else(|| Error::InvalidXml(format!("disk {stored_dev} has no driver element")))?;

    let mut root = parse(target_xml)?;
    let disk = find_disk_mut(&mut root, target_dev)?;
    let pos = disk
        .children
        .iter()
        .position(|n| matches!(n, XMLNode::Element(e) if e.name == "driver"))
        .ok_or_else(|| Error::InvalidXml(format!("disk {target_dev} has no driver element")))?;
    disk.children[pos] = XMLNode::Element(driver);
    element_to_string(&root)
}

/// Rewrite the domain's `id` attribute, returning the patched XML.
pub fn set_domain_id(xml: &str, id: i64) -> Result<String> {
    let mut root = parse(xml)?;
    root.attributes.insert("id".to_string(), id.to_string());
    element_to_string(&root)
}

/// The domain's name element.
pub fn domain_name_of(xml: &str) -> Result<String> {
    let root = parse(xml)?;
    root.get_child("name")
        .and_then(|n| n.get_text())
        .map(|t| t.trim().to_string())
        .ok_or_else(|| Error::InvalidXml("domain has no name element".to_string()))
}
