//! Configuration migration, warn-only.
//!
//! Old group configs used `compression`/`compression_lvl`. They are rewritten
//! in-memory to `packager`/`packager_opts` so the run still works, and a
//! warning tells the operator how to update the file.

use serde_yaml::{Mapping, Value};

/// Rewrite deprecated keys in place and return one warning per touched group.
pub fn convert_warn(root: &mut Value) -> Vec<String> {
    let mut warnings = Vec::new();
    let Some(groups) = root.get_mut("groups").and_then(Value::as_mapping_mut) else {
        return warnings;
    };

    for (name, group) in groups.iter_mut() {
        let Some(group) = group.as_mapping_mut() else {
            continue;
        };
        if let Some(changed) = convert_group(group) {
            let name = name.as_str().unwrap_or("<unnamed>");
            let dump = serde_yaml::to_string(&Value::Mapping(changed)).unwrap_or_default();
            warnings.push(format!(
                "group {name:?} uses the deprecated 'compression' and 'compression_lvl' \
                 options; adapt its config for:\n{dump}"
            ));
        }
    }

    warnings
}

/// Returns the replacement keys when the group needed rewriting.
fn convert_group(group: &mut Mapping) -> Option<Mapping> {
    if !group.contains_key("compression") && !group.contains_key("compression_lvl") {
        return None;
    }

    let mut changed = Mapping::new();

    if let Some(old) = group.remove("compression") {
        let (packager, compression) = match old.as_str() {
            None => ("directory", None),
            Some("tar") => ("tar", None),
            Some(other) => ("tar", Some(other.to_string())),
        };
        group.insert("packager".into(), packager.into());
        changed.insert("packager".into(), packager.into());
        if let Some(compression) = compression {
            let mut opts = Mapping::new();
            opts.insert("compression".into(), compression.into());
            group.insert("packager_opts".into(), Value::Mapping(opts.clone()));
            changed.insert("packager_opts".into(), Value::Mapping(opts));
        }
    }

    if let Some(lvl) = group.remove("compression_lvl") {
        for target in [&mut *group, &mut changed] {
            let opts = target
                .entry("packager_opts".into())
                .or_insert_with(|| Value::Mapping(Mapping::new()));
            if let Some(opts) = opts.as_mapping_mut() {
                opts.insert("compression_lvl".into(), lvl.clone());
            }
        }
    }

    Some(changed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compression_rewritten_to_packager() {
        let mut config: Value = serde_yaml::from_str(
            r#"
groups:
  test:
    target: /mnt/test
    compression: xz
    compression_lvl: 6
    hosts: ["vm1"]
"#,
        )
        .unwrap();

        let warnings = convert_warn(&mut config);
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("deprecated"));

        let group = &config["groups"]["test"];
        assert_eq!(group["packager"], Value::from("tar"));
        assert_eq!(group["packager_opts"]["compression"], Value::from("xz"));
        assert_eq!(group["packager_opts"]["compression_lvl"], Value::from(6));
        assert!(group.get("compression").is_none());
        assert!(group.get("compression_lvl").is_none());
    }

    #[test]
    fn test_null_compression_becomes_directory() {
        let mut config: Value = serde_yaml::from_str(
            r#"
groups:
  test:
    compression: ~
    hosts: []
"#,
        )
        .unwrap();

        convert_warn(&mut config);
        assert_eq!(config["groups"]["test"]["packager"], Value::from("directory"));
    }

    #[test]
    fn test_modern_config_is_untouched() {
        let mut config: Value = serde_yaml::from_str(
            r#"
groups:
  test:
    packager: zstd
    hosts: ["vm1"]
"#,
        )
        .unwrap();
        let before = config.clone();

        let warnings = convert_warn(&mut config);
        assert!(warnings.is_empty());
        assert_eq!(config, before);
    }
}
