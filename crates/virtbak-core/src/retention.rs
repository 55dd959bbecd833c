//! Time-bucketed retention planning.
//!
//! Backups are grouped per calendar period (hour, day, week, month, year);
//! each period independently keeps the earliest backup of its last `n`
//! buckets, and the union of all kept sets survives.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Datelike, Local, Timelike};
use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

/// How many period buckets to keep: a cap, or `"*"` for all of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepCount {
    Count(u32),
    All,
}

impl Default for KeepCount {
    fn default() -> Self {
        KeepCount::Count(5)
    }
}

impl Serialize for KeepCount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            KeepCount::Count(n) => serializer.serialize_u32(*n),
            KeepCount::All => serializer.serialize_str("*"),
        }
    }
}

impl<'de> Deserialize<'de> for KeepCount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct Visitor;

        impl de::Visitor<'_> for Visitor {
            type Value = KeepCount;

            fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                f.write_str("a non-negative integer or \"*\"")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<KeepCount, E> {
                u32::try_from(v)
                    .map(KeepCount::Count)
                    .map_err(|_| E::custom("retention count out of range"))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<KeepCount, E> {
                u64::try_from(v)
                    .map_err(|_| E::custom("retention count must not be negative"))
                    .and_then(|v| self.visit_u64(v))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<KeepCount, E> {
                if v == "*" {
                    Ok(KeepCount::All)
                } else {
                    Err(E::custom(format!("expected \"*\", got {v:?}")))
                }
            }
        }

        deserializer.deserialize_any(Visitor)
    }
}

/// Per-period keep caps for one group.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionPolicy {
    pub hourly: KeepCount,
    pub daily: KeepCount,
    pub weekly: KeepCount,
    pub monthly: KeepCount,
    pub yearly: KeepCount,
}

#[derive(Debug, Clone, Copy)]
enum Period {
    Hour,
    Day,
    Week,
    Month,
    Year,
}

/// Calendar bucket key, truncated at the period's granularity. Fields run
/// from coarsest to finest: year, month, iso-week, day, hour.
fn bucket_key(date: DateTime<Local>, period: Period) -> Vec<i32> {
    let full = [
        date.year(),
        date.month() as i32,
        date.iso_week().week() as i32,
        date.day() as i32,
        date.hour() as i32,
    ];
    let depth = match period {
        Period::Year => 1,
        Period::Month => 2,
        Period::Week => 3,
        Period::Day => 4,
        Period::Hour => 5,
    };
    full[..depth].to_vec()
}

/// Compute the indexes (into `dates`) of the backups to keep.
pub fn plan_kept(dates: &[DateTime<Local>], policy: &RetentionPolicy) -> BTreeSet<usize> {
    let mut order: Vec<usize> = (0..dates.len()).collect();
    order.sort_by_key(|&i| (dates[i], i));

    let periods = [
        (Period::Hour, policy.hourly),
        (Period::Day, policy.daily),
        (Period::Week, policy.weekly),
        (Period::Month, policy.monthly),
        (Period::Year, policy.yearly),
    ];

    let mut kept = BTreeSet::new();
    for (period, count) in periods {
        let n = match count {
            KeepCount::Count(0) => continue,
            KeepCount::Count(n) => Some(n as usize),
            KeepCount::All => None,
        };

        // ascending insertion: the first index of each bucket is the earliest
        let mut buckets: BTreeMap<Vec<i32>, usize> = BTreeMap::new();
        for &i in &order {
            buckets.entry(bucket_key(dates[i], period)).or_insert(i);
        }

        let skip = n.map_or(0, |n| buckets.len().saturating_sub(n));
        kept.extend(buckets.values().skip(skip));
    }

    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn date(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    fn sample_dates() -> Vec<DateTime<Local>> {
        vec![
            date(2016, 7, 8, 19, 40),
            date(2016, 7, 8, 18, 40),
            date(2016, 7, 8, 18, 30),
            date(2016, 7, 8, 17, 40),
            date(2016, 7, 7, 19, 40),
            date(2016, 7, 7, 21, 40),
            date(2016, 7, 6, 20, 40),
            date(2016, 4, 8, 19, 40),
            date(2014, 5, 1, 0, 30),
            date(2016, 3, 8, 14, 28),
        ]
    }

    #[test]
    fn test_periodic_retention() {
        let dates = sample_dates();
        let policy = RetentionPolicy {
            hourly: KeepCount::Count(2),
            daily: KeepCount::Count(3),
            weekly: KeepCount::Count(1),
            monthly: KeepCount::Count(1),
            yearly: KeepCount::Count(2),
        };
        let kept = plan_kept(&dates, &policy);
        let mut kept_dates: Vec<_> = kept.iter().map(|&i| dates[i]).collect();
        kept_dates.sort();

        let mut expected = vec![
            date(2016, 7, 8, 19, 40),
            date(2016, 7, 8, 18, 30),
            date(2016, 7, 8, 17, 40),
            date(2016, 7, 7, 19, 40),
            date(2016, 7, 6, 20, 40),
            date(2016, 3, 8, 14, 28),
            date(2014, 5, 1, 0, 30),
        ];
        expected.sort();
        assert_eq!(kept_dates, expected);
    }

    #[test]
    fn test_zero_keeps_nothing() {
        let dates = sample_dates();
        let policy = RetentionPolicy {
            hourly: KeepCount::Count(0),
            daily: KeepCount::Count(0),
            weekly: KeepCount::Count(0),
            monthly: KeepCount::Count(0),
            yearly: KeepCount::Count(0),
        };
        assert!(plan_kept(&dates, &policy).is_empty());
    }

    #[test]
    fn test_star_keeps_one_per_bucket() {
        let dates = vec![
            date(2016, 7, 8, 19, 10),
            date(2016, 7, 8, 19, 40),
            date(2015, 2, 1, 10, 0),
        ];
        let policy = RetentionPolicy {
            hourly: KeepCount::Count(0),
            daily: KeepCount::Count(0),
            weekly: KeepCount::Count(0),
            monthly: KeepCount::Count(0),
            yearly: KeepCount::All,
        };
        let kept = plan_kept(&dates, &policy);
        // earliest of 2016 and the single 2015 backup
        assert_eq!(kept, BTreeSet::from([0, 2]));
    }

    #[test]
    fn test_keep_count_serde() {
        assert_eq!(
            serde_json::from_str::<KeepCount>("3").unwrap(),
            KeepCount::Count(3)
        );
        assert_eq!(
            serde_json::from_str::<KeepCount>("\"*\"").unwrap(),
            KeepCount::All
        );
        assert!(serde_json::from_str::<KeepCount>("-1").is_err());
        assert!(serde_json::from_str::<KeepCount>("\"all\"").is_err());
    }

    #[test]
    fn test_default_policy_keeps_five() {
        assert_eq!(RetentionPolicy::default().hourly, KeepCount::Count(5));
    }
}
