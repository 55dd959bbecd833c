use chrono::{DateTime, Local, NaiveDateTime, TimeZone};

use crate::error::{Error, Result};

/// Date component of a backup name, in local time.
pub const NAME_DATE_FORMAT: &str = "%Y%m%d-%H%M%S";

/// Canonical backup name: `YYYYMMDD-HHMMSS_<domainId>_<domainName>`.
pub fn backup_name(date: DateTime<Local>, domain_id: i64, domain_name: &str) -> String {
    format!(
        "{}_{}_{}",
        date.format(NAME_DATE_FORMAT),
        domain_id,
        domain_name
    )
}

/// Backup name from a unix timestamp, rendered in local time.
pub fn backup_name_from_timestamp(ts: i64, domain_id: i64, domain_name: &str) -> Result<String> {
    Ok(backup_name(local_datetime(ts)?, domain_id, domain_name))
}

/// Artifact name for one disk of a backup: `<backup_name>_<dev>.<format>`.
pub fn disk_artifact_name(backup_name: &str, dev: &str, format: &str) -> String {
    format!("{backup_name}_{dev}.{format}")
}

/// Convert a stored unix timestamp to a local datetime.
pub fn local_datetime(ts: i64) -> Result<DateTime<Local>> {
    Local
        .timestamp_opt(ts, 0)
        .single()
        .ok_or_else(|| Error::InvalidMetadata(format!("timestamp {ts} out of range")))
}

/// Components parsed back out of a backup name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedBackupName {
    pub date: NaiveDateTime,
    pub domain_id: i64,
    pub domain_name: String,
}

/// Parse a `YYYYMMDD-HHMMSS_<id>_<name>` backup name. The domain name may
/// itself contain underscores; only the first two fields are structural.
pub fn parse_backup_name(name: &str) -> Result<ParsedBackupName> {
    let mut parts = name.splitn(3, '_');
    let (date, id, domain) = match (parts.next(), parts.next(), parts.next()) {
        (Some(date), Some(id), Some(domain)) if !domain.is_empty() => (date, id, domain),
        _ => {
            return Err(Error::InvalidMetadata(format!(
                "backup name {name:?} does not follow date_id_name"
            )));
        }
    };

    let date = NaiveDateTime::parse_from_str(date, NAME_DATE_FORMAT)
        .map_err(|e| Error::InvalidMetadata(format!("bad date in backup name {name:?}: {e}")))?;
    let domain_id = id
        .parse()
        .map_err(|_| Error::InvalidMetadata(format!("bad domain id in backup name {name:?}")))?;

    Ok(ParsedBackupName {
        date,
        domain_id,
        domain_name: domain.to_string(),
    })
}
