//! Listing and query: per-version rows, the versions table, and the
//! summary aggregates (top-N paths/directories/extensions and the
//! fragment-share histogram). Everything is computed from the in-memory
//! state; the front end renders the report.

use std::collections::BTreeMap;
use std::path::Path;

use crate::config::Options;
use crate::error::Result;
use crate::index::Locator;
use crate::journal;
use crate::snapshot::{ArchiveState, FileAttr};

/// One file-version row of the ordinary listing.
#[derive(Debug)]
pub struct FileRow {
    pub version: usize,
    pub date: u64,
    pub attr: FileAttr,
    pub size: Option<u64>,
    pub path: String,
    pub deleted: bool,
}

/// One row of the versions table.
#[derive(Debug)]
pub struct VersionRow {
    pub index: usize,
    pub last_fragment: u32,
    pub date: u64,
    pub updates: u32,
    pub deletes: u32,
    pub data_size: u64,
    pub compressed_size: u64,
}

/// One top-N aggregate: a file, a directory prefix (trailing `/`), an
/// extension (leading `.`), or the grand total (empty name).
#[derive(Debug)]
pub struct TopRow {
    pub name: String,
    pub size: u64,
    pub count: u64,
}

/// One row of the fragment-share histogram. `shares` of `None` is the
/// total row; 10 aggregates everything shared ten or more times.
#[derive(Debug)]
pub struct ShareRow {
    pub shares: Option<u32>,
    pub fragments: u64,
    pub deduplicated_bytes: u64,
    pub extracted_bytes: u64,
}

#[derive(Debug, Default)]
pub struct SummaryReport {
    pub top: Vec<TopRow>,
    pub shares: Vec<ShareRow>,
    pub blocks_total: u64,
    pub blocks_used: u64,
    pub stored_bytes: u64,
    pub unknown_size_fragments: u64,
    pub unknown_size_refs: u64,
}

#[derive(Debug, Default)]
pub struct ListReport {
    pub rows: Vec<FileRow>,
    pub versions: Vec<VersionRow>,
    pub summary: Option<SummaryReport>,
    pub shown: u64,
    pub total_files: u64,
    pub shown_bytes: u64,
    pub archive_size: u64,
}

pub fn run(opts: &Options) -> Result<ListReport> {
    let read = journal::read_archive(Path::new(&opts.archive), opts.until, opts.fragile)?;
    let mut state = read.state;
    let archive_size = read.end_offset;

    let mut report = ListReport {
        archive_size,
        ..Default::default()
    };

    if let Some(top_n) = opts.summary {
        state.select(&opts.files, &opts.not, false);
        report.summary = Some(summarize(&state, top_n));
        report.versions = version_rows(&state, archive_size);
        return Ok(report);
    }

    state.select(&opts.files, &opts.not, true);

    let since = if opts.since < 0 {
        (opts.since + state.snapshots.len() as i64).max(0) as usize
    } else {
        opts.since as usize
    };

    for (path, entry) in &state.files {
        if entry.selected {
            for version in &entry.versions {
                let last = std::ptr::eq(version, entry.versions.last().unwrap());
                let visible = version.snapshot >= since
                    && version.size.unwrap_or(0) >= opts.quiet
                    && (opts.all || (last && !version.is_tombstone()));
                if visible {
                    if !version.is_tombstone() {
                        report.shown += 1;
                        report.shown_bytes += version.size.unwrap_or(0);
                    }
                    report.rows.push(FileRow {
                        version: version.snapshot,
                        date: version.date,
                        attr: version.attr,
                        size: version.size,
                        path: path.clone(),
                        deleted: version.is_tombstone(),
                    });
                }
            }
        }
        if entry.is_live() {
            report.total_files += 1;
        }
    }

    report.versions = version_rows(&state, archive_size);
    Ok(report)
}

fn version_rows(state: &ArchiveState, archive_size: u64) -> Vec<VersionRow> {
    let mut rows = Vec::new();
    for (i, ver) in state.snapshots.iter().enumerate() {
        if i == 0 && ver.updates == 0 && ver.deletes == 0 && ver.date == 0 && ver.data_size == 0 {
            continue;
        }
        let next_offset = state
            .snapshots
            .get(i + 1)
            .map(|v| v.offset)
            .unwrap_or(archive_size);
        let last_fragment = state
            .snapshots
            .get(i + 1)
            .map(|v| v.first_fragment - 1)
            .unwrap_or(state.fragments.len() - 1);
        rows.push(VersionRow {
            index: i,
            last_fragment,
            date: ver.date,
            updates: ver.updates,
            deletes: ver.deletes,
            data_size: ver.data_size,
            compressed_size: next_offset.saturating_sub(ver.offset),
        });
    }
    rows
}

fn summarize(state: &ArchiveState, top_n: usize) -> SummaryReport {
    let mut top: BTreeMap<String, (u64, u64)> = BTreeMap::new();
    let mut refs = vec![0u64; state.fragments.len() as usize];
    let mut unknown_size_refs = 0u64;

    let bump = |top: &mut BTreeMap<String, (u64, u64)>, key: String, size: u64| {
        let slot = top.entry(key).or_insert((0, 0));
        slot.0 += size;
        slot.1 += 1;
    };

    for (path, entry) in &state.files {
        let Some(version) = entry.latest().filter(|v| !v.is_tombstone()) else {
            continue;
        };
        if !entry.selected {
            continue;
        }
        let size = version.size.unwrap_or(0);
        bump(&mut top, String::new(), size);
        bump(&mut top, path.clone(), size);
        let mut ext_start = 0usize;
        for (i, c) in path.char_indices() {
            if c == '/' {
                bump(&mut top, path[..i + 1].to_string(), size);
                ext_start = 0;
            } else if c == '.' {
                ext_start = i;
            }
        }
        if ext_start > 0 {
            bump(&mut top, path[ext_start..].to_ascii_lowercase(), size);
        } else {
            bump(&mut top, ".".to_string(), size);
        }

        for &id in &version.fragments {
            if let Some(slot) = refs.get_mut(id as usize) {
                *slot += 1;
                if state.fragments.get(id).is_some_and(|e| e.size.is_none()) {
                    unknown_size_refs += 1;
                }
            }
        }
    }

    let stored_bytes = top.get("").map(|t| t.0).unwrap_or(0);

    // Rank by size, descending, and keep the top N.
    let mut ranked: Vec<TopRow> = top
        .into_iter()
        .map(|(name, (size, count))| TopRow { name, size, count })
        .collect();
    ranked.sort_by(|a, b| b.size.cmp(&a.size).then_with(|| a.name.cmp(&b.name)));
    ranked.truncate(top_n);

    // Fragment-share histogram.
    let mut unknown_size_fragments = 0u64;
    let mut hist: BTreeMap<u32, ShareRow> = BTreeMap::new();
    let mut total = ShareRow {
        shares: None,
        fragments: 0,
        deduplicated_bytes: 0,
        extracted_bytes: 0,
    };
    for (id, entry) in state.fragments.iter() {
        let count = refs[id as usize];
        let size = entry.size.unwrap_or(0) as u64;
        if entry.size.is_none() {
            unknown_size_fragments += 1;
        }
        let bucket = (count.min(10)) as u32;
        let row = hist.entry(bucket).or_insert(ShareRow {
            shares: Some(bucket),
            fragments: 0,
            deduplicated_bytes: 0,
            extracted_bytes: 0,
        });
        row.fragments += 1;
        row.deduplicated_bytes += size;
        row.extracted_bytes += size * count;
        total.fragments += 1;
        total.deduplicated_bytes += size;
        total.extracted_bytes += size * count;
    }
    let mut shares: Vec<ShareRow> = hist.into_values().collect();
    shares.push(total);

    // Blocks, and blocks holding at least one referenced fragment.
    let mut blocks_total = 0u64;
    let mut blocks_used = 0u64;
    let mut this_block_used = false;
    for (id, entry) in state.fragments.iter() {
        if matches!(entry.locator, Locator::Block(_)) {
            blocks_total += 1;
            blocks_used += u64::from(this_block_used);
            this_block_used = false;
        }
        this_block_used |= refs[id as usize] > 0;
    }
    blocks_used += u64::from(this_block_used);

    SummaryReport {
        top: ranked,
        shares,
        blocks_total,
        blocks_used,
        stored_bytes,
        unknown_size_fragments,
        unknown_size_refs,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::{FileEntry, FileVersion};

    fn state_with(files: &[(&str, u64)]) -> ArchiveState {
        let mut state = ArchiveState::new();
        for &(path, size) in files {
            let mut entry = FileEntry::default();
            entry.versions.push(FileVersion {
                date: 20240101000000,
                size: Some(size),
                ..Default::default()
            });
            entry.selected = true;
            state.files.insert(path.to_string(), entry);
        }
        state
    }

    #[test]
    fn summary_rolls_up_dirs_and_extensions() {
        let state = state_with(&[
            ("src/a.rs", 100),
            ("src/b.rs", 50),
            ("doc/readme.txt", 10),
        ]);
        let summary = summarize(&state, 100);
        let find = |name: &str| {
            summary
                .top
                .iter()
                .find(|t| t.name == name)
                .unwrap_or_else(|| panic!("missing {name}"))
        };
        assert_eq!(find("").size, 160);
        assert_eq!(find("").count, 3);
        assert_eq!(find("src/").size, 150);
        assert_eq!(find(".rs").size, 150);
        assert_eq!(find(".rs").count, 2);
        assert_eq!(find(".txt").size, 10);
        assert_eq!(find("src/a.rs").size, 100);
    }

    #[test]
    fn summary_total_ranks_first() {
        let state = state_with(&[("x.bin", 500)]);
        let summary = summarize(&state, 3);
        assert_eq!(summary.top[0].name, "");
        assert_eq!(summary.top.len(), 3);
    }

    #[test]
    fn extension_without_dot_counts_as_dotless() {
        let state = state_with(&[("noext", 7)]);
        let summary = summarize(&state, 10);
        assert!(summary.top.iter().any(|t| t.name == "." && t.size == 7));
    }

    #[test]
    fn share_histogram_has_total_row_last() {
        let state = state_with(&[("a", 1)]);
        let summary = summarize(&state, 1);
        assert!(summary.shares.last().unwrap().shares.is_none());
    }
}
