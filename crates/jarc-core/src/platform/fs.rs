//! External file observation and restoration.

use std::fs::Metadata;
use std::path::Path;

use tracing::warn;

use crate::date;
use crate::error::Result;
use crate::platform::paths;
use crate::snapshot::FileAttr;

/// One external file or directory observed while scanning inputs.
/// Directory names carry a trailing `/`.
#[derive(Debug, Clone)]
pub struct ScanEntry {
    pub name: String,
    pub date: u64,
    pub size: u64,
    pub attr: FileAttr,
}

/// Name mapping and exclusion rules applied during a scan.
pub struct ScanFilter<'a> {
    pub not: &'a [String],
    pub files: &'a [String],
    pub tofiles: &'a [String],
}

impl ScanFilter<'_> {
    fn excluded(&self, archive_name: &str) -> bool {
        self.not
            .iter()
            .any(|n| paths::is_path_match(n, archive_name))
    }
}

/// Recursively scan `external` (a path on disk), emitting one entry per
/// regular file and per directory under its archive-space name. Unreadable
/// entries are logged and skipped.
pub fn scan_into(external: &str, filter: &ScanFilter, out: &mut dyn FnMut(ScanEntry)) {
    let archive_name = paths::unrename(&paths::normalize(external), filter.files, filter.tofiles);
    if filter.excluded(&archive_name) {
        return;
    }

    let meta = match std::fs::symlink_metadata(external) {
        Ok(m) => m,
        Err(e) => {
            warn!(path = %external, error = %e, "skipping unreadable entry");
            return;
        }
    };

    if meta.is_file() {
        out(ScanEntry {
            name: archive_name,
            date: mtime_decimal(&meta),
            size: meta.len(),
            attr: capture_attr(&meta),
        });
    } else if meta.is_dir() {
        let dir_name = if archive_name.ends_with('/') {
            archive_name
        } else {
            format!("{archive_name}/")
        };
        out(ScanEntry {
            name: dir_name,
            date: mtime_decimal(&meta),
            size: 0,
            attr: capture_attr(&meta),
        });
        let entries = match std::fs::read_dir(external) {
            Ok(e) => e,
            Err(e) => {
                warn!(path = %external, error = %e, "skipping unreadable directory");
                return;
            }
        };
        for entry in entries {
            let Ok(entry) = entry else { continue };
            let Some(name) = entry.file_name().to_str().map(String::from) else {
                warn!(path = %external, "skipping non-UTF-8 name");
                continue;
            };
            let child = if external.ends_with('/') {
                format!("{external}{name}")
            } else {
                format!("{external}/{name}")
            };
            scan_into(&child, filter, out);
        }
    }
    // Symlinks and special files are not preserved.
}

pub fn mtime_decimal(meta: &Metadata) -> u64 {
    let secs = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    date::decimal_from_unix(secs)
}

#[cfg(unix)]
pub fn capture_attr(meta: &Metadata) -> FileAttr {
    use std::os::unix::fs::MetadataExt;
    FileAttr::Unix(meta.mode() & 0o177777)
}

#[cfg(windows)]
pub fn capture_attr(meta: &Metadata) -> FileAttr {
    use std::os::windows::fs::MetadataExt;
    FileAttr::Windows(meta.file_attributes())
}

#[cfg(not(any(unix, windows)))]
pub fn capture_attr(_meta: &Metadata) -> FileAttr {
    FileAttr::None
}

/// Create all missing parent directories of `path`.
pub fn make_parent_dirs(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

/// Apply a stored date and attribute word to an extracted file or directory.
/// Failures are logged, not fatal: a read-only target directory should not
/// abort the rest of an extraction.
pub fn apply_attrs(path: &Path, date_decimal: u64, attr: &FileAttr) {
    #[cfg(unix)]
    if let FileAttr::Unix(mode) = attr {
        use std::os::unix::fs::PermissionsExt;
        let perm = std::fs::Permissions::from_mode(mode & 0o7777);
        if let Err(e) = std::fs::set_permissions(path, perm) {
            warn!(path = %path.display(), error = %e, "failed to set mode");
        }
    }
    if date_decimal > 0 {
        if let Ok(secs) = date::unix_from_decimal(date_decimal) {
            let mtime = filetime::FileTime::from_unix_time(secs, 0);
            if let Err(e) = filetime::set_file_mtime(path, mtime) {
                warn!(path = %path.display(), error = %e, "failed to set mtime");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn scan_emits_files_and_dirs() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir(tmp.path().join("sub")).unwrap();
        let mut f = std::fs::File::create(tmp.path().join("sub/a.txt")).unwrap();
        f.write_all(b"hello").unwrap();
        drop(f);

        let root = tmp.path().to_str().unwrap().to_string();
        let filter = ScanFilter {
            not: &[],
            files: &[],
            tofiles: &[],
        };
        let mut seen = Vec::new();
        scan_into(&root, &filter, &mut |e| seen.push(e));

        assert!(seen.iter().any(|e| e.name.ends_with("sub/")));
        let file = seen
            .iter()
            .find(|e| e.name.ends_with("sub/a.txt"))
            .expect("file scanned");
        assert_eq!(file.size, 5);
        assert!(file.date > date::MIN_DATE);
    }

    #[test]
    fn scan_honors_not_prefixes() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir(tmp.path().join("keep")).unwrap();
        std::fs::create_dir(tmp.path().join("skip")).unwrap();
        std::fs::write(tmp.path().join("keep/a"), b"x").unwrap();
        std::fs::write(tmp.path().join("skip/b"), b"x").unwrap();

        let root = tmp.path().to_str().unwrap().to_string();
        let not = vec![format!("{root}/skip")];
        let filter = ScanFilter {
            not: &not,
            files: &[],
            tofiles: &[],
        };
        let mut seen = Vec::new();
        scan_into(&root, &filter, &mut |e| seen.push(e));

        assert!(seen.iter().any(|e| e.name.ends_with("keep/a")));
        assert!(!seen.iter().any(|e| e.name.contains("skip")));
    }
}
