//! Per-invocation options shared by the commands.

use crate::compress::Method;
use crate::date;
use crate::error::{JarcError, Result};

/// `--until` cutoff: stop reading the journal at a version count or date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Until {
    #[default]
    None,
    /// Keep the first N snapshots.
    Version(u32),
    /// Keep snapshots dated at or before this decimal date.
    Date(u64),
}

impl Until {
    /// Parse a `--until` argument: a small number is a version count, a
    /// longer one a (possibly abbreviated) date that gets its time-of-day
    /// widened to the end of the period.
    pub fn parse(s: &str) -> Result<Until> {
        let v: u64 = s
            .parse()
            .map_err(|_| JarcError::BadOption(format!("bad --until value '{s}'")))?;
        if v <= 9_999_999 {
            return Ok(Until::Version(v as u32));
        }
        let widened = date::widen_until_date(v);
        if !(date::MIN_DATE..=date::MAX_DATE).contains(&widened) {
            return Err(JarcError::BadOption(format!(
                "--until date {v} must be between 19000101 and 29991231235959"
            )));
        }
        Ok(Until::Date(widened))
    }
}

/// Options for one command invocation.
#[derive(Debug, Clone)]
pub struct Options {
    /// Archive path, `.zpaq` suffix already applied.
    pub archive: String,
    /// Path arguments (archive-space names to select, and on add, scan).
    pub files: Vec<String>,
    /// Exclusion prefixes.
    pub not: Vec<String>,
    /// Rename prefixes for add (external source) and extract (output).
    pub to: Vec<String>,
    pub until: Until,
    pub force: bool,
    /// Listing size threshold: entries smaller than this are not shown.
    pub quiet: u64,
    pub threads: usize,
    pub fragile: bool,
    pub method: Method,
    /// First version to list, negative counts from the end.
    pub since: i64,
    /// Top-N size for summary listing.
    pub summary: Option<usize>,
    pub all: bool,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            archive: String::new(),
            files: Vec::new(),
            not: Vec::new(),
            to: Vec::new(),
            until: Until::None,
            force: false,
            quiet: 0,
            threads: 0,
            fragile: false,
            method: Method::default(),
            since: 0,
            summary: None,
            all: false,
        }
    }
}

impl Options {
    /// Worker thread count, detecting processors when unset.
    pub fn effective_threads(&self) -> usize {
        if self.threads > 0 {
            self.threads
        } else {
            crate::platform::detect_processors()
        }
    }
}

/// Append `.zpaq` unless the name already ends with it.
pub fn with_archive_suffix(name: &str) -> String {
    if name.to_ascii_lowercase().ends_with(".zpaq") {
        name.to_string()
    } else {
        format!("{name}.zpaq")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn until_version_vs_date() {
        assert_eq!(Until::parse("3").unwrap(), Until::Version(3));
        assert_eq!(Until::parse("9999999").unwrap(), Until::Version(9_999_999));
        assert_eq!(
            Until::parse("20250101").unwrap(),
            Until::Date(20250101235959)
        );
        assert_eq!(
            Until::parse("20250101123456").unwrap(),
            Until::Date(20250101123456)
        );
        assert!(Until::parse("99999999999999").is_err());
        assert!(Until::parse("x").is_err());
    }

    #[test]
    fn archive_suffix() {
        assert_eq!(with_archive_suffix("backup"), "backup.zpaq");
        assert_eq!(with_archive_suffix("backup.zpaq"), "backup.zpaq");
        assert_eq!(with_archive_suffix("a.ZPAQ"), "a.ZPAQ");
    }
}
