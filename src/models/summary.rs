//! Per-node summary: grouped byte/object/kilobyte accumulators and the
//! tab-separated artifact format they are stored in.

use chrono::NaiveDate;
use std::{collections::BTreeMap, fmt, str::FromStr};
use thiserror::Error;

pub const TOTALS_KEY: &str = "totals";
pub const TOMBSTONE_ACCOUNT: &str = "tombstone";
pub const TOMBSTONE_KEY_PREFIX: &str = "tombstone_";
pub const SUMMARY_HEADER: &str = "key\tbytes\tobjects\tavg_kb\tkilobytes";
pub const TOMBSTONE_DATE_FORMAT: &str = "%Y-%m-%d";

const MILLIS_PER_KB: u128 = 1000;

fn has_date_shape(s: &str) -> bool {
    s.len() == 10
        && s.bytes().enumerate().all(|(i, b)| match i {
            4 | 7 => b == b'-',
            _ => b.is_ascii_digit(),
        })
}

/// Whether a tombstone directory name is a zero-padded calendar date.
pub fn is_tombstone_date(segment: &str) -> bool {
    has_date_shape(segment) && NaiveDate::parse_from_str(segment, TOMBSTONE_DATE_FORMAT).is_ok()
}

/// The date part of a `tombstone_<YYYY-MM-DD>` row key, checked for shape
/// only. Keys that merely share the prefix, such as an account login
/// `tombstone_ops`, are not tombstone rows. Calendar validity is left to
/// the tombstone extractor, which reports bad dates.
pub fn tombstone_key_date(key: &str) -> Option<&str> {
    key.strip_prefix(TOMBSTONE_KEY_PREFIX)
        .filter(|date| has_date_shape(date))
}

/// Physical kilobytes as fixed-point thousandths.
///
/// Manifests for large nodes sum to values that no longer fit exactly in an
/// `f64`, so accumulation happens on integers and floats only appear when a
/// value is reported.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Kilobytes(u128);

impl Kilobytes {
    #[cfg(test)]
    pub fn from_whole(kb: u128) -> Self {
        Self(kb * MILLIS_PER_KB)
    }

    pub fn as_f64(self) -> f64 {
        self.0 as f64 / MILLIS_PER_KB as f64
    }

    /// Average kilobytes per object, 0 for an empty group.
    pub fn per_object(self, objects: u64) -> f64 {
        if objects == 0 {
            0.0
        } else {
            self.as_f64() / objects as f64
        }
    }
}

impl std::ops::AddAssign for Kilobytes {
    fn add_assign(&mut self, rhs: Self) {
        self.0 += rhs.0;
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid kilobyte value `{0}`")]
pub struct ParseKilobytesError(String);

impl FromStr for Kilobytes {
    type Err = ParseKilobytesError;

    /// Accepts `123` or `123.456`; digits past the third decimal are dropped.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseKilobytesError(s.to_string());
        let (whole, frac) = match s.split_once('.') {
            Some((w, f)) => (w, f),
            None => (s, ""),
        };
        if whole.is_empty() && frac.is_empty() {
            return Err(err());
        }
        if !whole.bytes().all(|b| b.is_ascii_digit()) || !frac.bytes().all(|b| b.is_ascii_digit()) {
            return Err(err());
        }

        let whole: u128 = if whole.is_empty() {
            0
        } else {
            whole.parse().map_err(|_| err())?
        };
        let mut millis = 0u128;
        for (i, digit) in frac.bytes().take(3).enumerate() {
            millis += u128::from(digit - b'0') * 10u128.pow(2 - i as u32);
        }

        whole
            .checked_mul(MILLIS_PER_KB)
            .and_then(|v| v.checked_add(millis))
            .map(Kilobytes)
            .ok_or_else(err)
    }
}

impl fmt::Display for Kilobytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let whole = self.0 / MILLIS_PER_KB;
        let frac = self.0 % MILLIS_PER_KB;
        if frac == 0 {
            write!(f, "{whole}")
        } else {
            let digits = format!("{frac:03}");
            write!(f, "{whole}.{}", digits.trim_end_matches('0'))
        }
    }
}

/// Accumulated statistics for one grouping key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupStats {
    pub bytes: u128,
    pub objects: u64,
    pub kilobytes: Kilobytes,
}

impl GroupStats {
    pub fn add(&mut self, bytes: u128, kilobytes: Kilobytes) {
        self.bytes += bytes;
        self.objects += 1;
        self.kilobytes += kilobytes;
    }

    pub fn avg_kb(&self) -> f64 {
        self.kilobytes.per_object(self.objects)
    }
}

/// One row of a summary artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SummaryRow {
    pub key: String,
    pub stats: GroupStats,
}

impl SummaryRow {
    pub fn new(key: impl Into<String>, stats: GroupStats) -> Self {
        Self {
            key: key.into(),
            stats,
        }
    }

    fn to_line(&self) -> String {
        format!(
            "{}\t{}\t{}\t{:.2}\t{}",
            self.key,
            self.stats.bytes,
            self.stats.objects,
            self.stats.avg_kb(),
            self.stats.kilobytes
        )
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SummaryParseError {
    #[error("line {line}: expected 5 tab-separated fields, found {found}")]
    FieldCount { line: usize, found: usize },
    #[error("line {line}: invalid `{field}` value `{value}`")]
    InvalidNumber {
        line: usize,
        field: &'static str,
        value: String,
    },
    #[error("line {line}: duplicate key `{key}`")]
    DuplicateKey { line: usize, key: String },
}

/// Per-node report: account rows, tombstone rows keyed `tombstone_<date>`,
/// and the node-wide totals.
///
/// `totals` is optional only because a pre-built artifact might lack the
/// row; summaries produced by the summarizer always carry it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeSummary {
    pub accounts: Vec<SummaryRow>,
    pub tombstones: Vec<SummaryRow>,
    pub totals: Option<GroupStats>,
}

impl NodeSummary {
    /// Build a summary from grouped accumulators. Tombstone keys are the bare
    /// dates and get their `tombstone_` prefix here.
    pub fn from_groups(
        accounts: BTreeMap<String, GroupStats>,
        tombstones: BTreeMap<String, GroupStats>,
        totals: GroupStats,
    ) -> Self {
        Self {
            accounts: accounts
                .into_iter()
                .map(|(key, stats)| SummaryRow::new(key, stats))
                .collect(),
            tombstones: tombstones
                .into_iter()
                .map(|(date, stats)| SummaryRow::new(format!("{TOMBSTONE_KEY_PREFIX}{date}"), stats))
                .collect(),
            totals: Some(totals),
        }
    }

    /// Serialize to the artifact format: header, accounts, tombstones, totals.
    pub fn to_tsv(&self) -> String {
        let mut out = String::from(SUMMARY_HEADER);
        out.push('\n');
        let totals = self
            .totals
            .clone()
            .map(|stats| SummaryRow::new(TOTALS_KEY, stats));
        for row in self.accounts.iter().chain(&self.tombstones).chain(totals.as_ref()) {
            out.push_str(&row.to_line());
            out.push('\n');
        }
        out
    }

    /// Parse an artifact. The `avg_kb` column is validated but not kept.
    pub fn parse_tsv(text: &str) -> Result<Self, SummaryParseError> {
        let mut summary = NodeSummary::default();
        let mut seen = std::collections::HashSet::new();

        for (idx, raw) in text.lines().enumerate() {
            let line = idx + 1;
            if raw.trim().is_empty() || (idx == 0 && raw.trim_end() == SUMMARY_HEADER) {
                continue;
            }
            let fields: Vec<&str> = raw.split('\t').collect();
            if fields.len() != 5 {
                return Err(SummaryParseError::FieldCount {
                    line,
                    found: fields.len(),
                });
            }
            let key = fields[0].to_string();
            let invalid = |field: &'static str, value: &str| SummaryParseError::InvalidNumber {
                line,
                field,
                value: value.to_string(),
            };
            let bytes: u128 = fields[1].parse().map_err(|_| invalid("bytes", fields[1]))?;
            let objects: u64 = fields[2].parse().map_err(|_| invalid("objects", fields[2]))?;
            fields[3]
                .parse::<f64>()
                .map_err(|_| invalid("avg_kb", fields[3]))?;
            let kilobytes: Kilobytes = fields[4]
                .parse()
                .map_err(|_| invalid("kilobytes", fields[4]))?;

            if !seen.insert(key.clone()) {
                return Err(SummaryParseError::DuplicateKey { line, key });
            }

            let stats = GroupStats {
                bytes,
                objects,
                kilobytes,
            };
            if key == TOTALS_KEY {
                summary.totals = Some(stats);
            } else if tombstone_key_date(&key).is_some() {
                summary.tombstones.push(SummaryRow::new(key, stats));
            } else {
                summary.accounts.push(SummaryRow::new(key, stats));
            }
        }

        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(bytes: u128, objects: u64, kb: u128) -> GroupStats {
        GroupStats {
            bytes,
            objects,
            kilobytes: Kilobytes::from_whole(kb),
        }
    }

    #[test]
    fn kilobytes_parse_fixed_point() {
        assert_eq!("50".parse::<Kilobytes>().unwrap(), Kilobytes::from_whole(50));
        assert_eq!("0.5".parse::<Kilobytes>().unwrap().to_string(), "0.5");
        assert_eq!("1.23456".parse::<Kilobytes>().unwrap().to_string(), "1.234");
        assert_eq!(".25".parse::<Kilobytes>().unwrap().to_string(), "0.25");
        assert!("-3".parse::<Kilobytes>().is_err());
        assert!("x".parse::<Kilobytes>().is_err());
        assert!(".".parse::<Kilobytes>().is_err());
    }

    #[test]
    fn kilobytes_sum_beyond_f64_integer_range() {
        let mut total = Kilobytes::from_whole(1u128 << 53);
        total += Kilobytes::from_whole(1);
        assert_eq!(total.to_string(), "9007199254740993");
    }

    #[test]
    fn average_is_zero_for_empty_group() {
        assert_eq!(GroupStats::default().avg_kb(), 0.0);
        assert_eq!(stats(10, 4, 10).avg_kb(), 2.5);
    }

    #[test]
    fn tsv_layout_and_reparse() {
        let mut accounts = BTreeMap::new();
        accounts.insert("acctA".to_string(), stats(300, 2, 125));
        let mut tombstones = BTreeMap::new();
        tombstones.insert("2020-01-01".to_string(), stats(10, 1, 5));
        let summary = NodeSummary::from_groups(accounts, tombstones, stats(310, 3, 130));

        let text = summary.to_tsv();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], SUMMARY_HEADER);
        assert_eq!(lines[1], "acctA\t300\t2\t62.50\t125");
        assert_eq!(lines[2], "tombstone_2020-01-01\t10\t1\t5.00\t5");
        assert_eq!(lines[3], "totals\t310\t3\t43.33\t130");

        assert_eq!(NodeSummary::parse_tsv(&text).unwrap(), summary);
    }

    #[test]
    fn prefixed_account_logins_stay_accounts() {
        let mut accounts = BTreeMap::new();
        accounts.insert("acctA".to_string(), stats(1, 1, 1));
        accounts.insert("tombstone_ops".to_string(), stats(10, 1, 5));
        let mut tombstones = BTreeMap::new();
        tombstones.insert("2020-01-01".to_string(), stats(3, 1, 1));
        let summary = NodeSummary::from_groups(accounts, tombstones, stats(11, 2, 6));

        let reparsed = NodeSummary::parse_tsv(&summary.to_tsv()).unwrap();
        assert_eq!(reparsed, summary);
        assert_eq!(reparsed.tombstones.len(), 1);
        assert!(reparsed.accounts.iter().any(|r| r.key == "tombstone_ops"));
    }

    #[test]
    fn tombstone_keys_need_a_date() {
        assert_eq!(tombstone_key_date("tombstone_2020-01-01"), Some("2020-01-01"));
        assert_eq!(tombstone_key_date("tombstone_ops"), None);
        assert_eq!(tombstone_key_date("tombstone_2020-13-01"), Some("2020-13-01"));
        assert_eq!(tombstone_key_date("tombstone_2020-1-1"), None);
        assert_eq!(tombstone_key_date("acctA"), None);

        assert!(is_tombstone_date("2020-01-01"));
        assert!(!is_tombstone_date("2020-1-1"));
        assert!(!is_tombstone_date("2020-02-30"));
        assert!(!is_tombstone_date("latest"));
    }

    #[test]
    fn parse_keeps_missing_totals_as_none() {
        let text = format!("{SUMMARY_HEADER}\nacctA\t1\t1\t1.00\t1\n");
        let summary = NodeSummary::parse_tsv(&text).unwrap();
        assert!(summary.totals.is_none());
        assert_eq!(summary.accounts.len(), 1);
    }

    #[test]
    fn parse_rejects_malformed_rows() {
        let short = "acctA\t1\t1\n";
        assert_eq!(
            NodeSummary::parse_tsv(short),
            Err(SummaryParseError::FieldCount { line: 1, found: 3 })
        );

        let bad_objects = format!("{SUMMARY_HEADER}\nacctA\t1\tmany\t1.00\t1\n");
        assert!(matches!(
            NodeSummary::parse_tsv(&bad_objects),
            Err(SummaryParseError::InvalidNumber { line: 2, field: "objects", .. })
        ));

        let dup = "a\t1\t1\t1\t1\na\t1\t1\t1\t1\n";
        assert!(matches!(
            NodeSummary::parse_tsv(dup),
            Err(SummaryParseError::DuplicateKey { line: 2, .. })
        ));
    }
}
