mod cli;

use clap::Parser;
use comfy_table::{presets::UTF8_FULL_CONDENSED, Table};

use jarc_core::commands::{add, extract, list, test};
use jarc_core::compress::Method;
use jarc_core::config::{self, Options, Until};
use jarc_core::date;
use jarc_core::error::Result;

use cli::{Cli, Commands, CommonOpts};

fn main() {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let start = std::time::Instant::now();
    let code = match dispatch(&cli.command) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e}");
            1
        }
    };
    eprintln!(
        "{:.3} seconds{}",
        start.elapsed().as_secs_f64(),
        if code != 0 { " (with errors)" } else { "" }
    );
    std::process::exit(code);
}

fn build_options(archive: &str, files: &[String], common: &CommonOpts) -> Result<Options> {
    Ok(Options {
        archive: config::with_archive_suffix(archive),
        files: files.to_vec(),
        not: common.not.clone(),
        to: common.to.clone(),
        until: match &common.until {
            Some(s) => Until::parse(s)?,
            None => Until::None,
        },
        force: common.force,
        quiet: common.quiet.unwrap_or(0),
        threads: common.threads.unwrap_or(0),
        fragile: common.fragile,
        ..Default::default()
    })
}

fn dispatch(command: &Commands) -> Result<i32> {
    match command {
        Commands::Add {
            archive,
            files,
            method,
            common,
        } => {
            let mut opts = build_options(archive, files, common)?;
            opts.method = Method::parse(method)?;
            let stats = add::run(&opts, add::UpdateMode::Add)?;
            print_add_stats(&stats);
            Ok(0)
        }

        Commands::Delete {
            archive,
            files,
            common,
        } => {
            let opts = build_options(archive, files, common)?;
            let stats = add::run(&opts, add::UpdateMode::Delete)?;
            print_add_stats(&stats);
            Ok(0)
        }

        Commands::Extract {
            archive,
            files,
            common,
        } => {
            let opts = build_options(archive, files, common)?;
            let stats = extract::run(&opts)?;
            println!(
                "Extracted {} files, {} directories ({} bytes)",
                stats.files, stats.dirs, stats.bytes_written
            );
            if !stats.ok() {
                eprintln!(
                    "{} damaged blocks, {} incomplete files",
                    stats.bad_blocks, stats.failed_files
                );
                return Ok(1);
            }
            Ok(0)
        }

        Commands::List {
            archive,
            files,
            since,
            summary,
            all,
            common,
        } => {
            let mut opts = build_options(archive, files, common)?;
            opts.since = *since;
            opts.summary = *summary;
            opts.all = *all;
            let report = list::run(&opts)?;
            print_list(&report);
            Ok(0)
        }

        Commands::Test {
            archive,
            files,
            common,
        } => {
            let opts = build_options(archive, files, common)?;
            let report = test::run(&opts)?;
            print_test(&report);
            Ok(if report.ok() { 0 } else { 1 })
        }
    }
}

fn print_add_stats(stats: &add::AddStats) {
    if !stats.updated {
        println!("Archive not updated: nothing to add or delete");
        return;
    }
    println!(
        "Added {} files ({} bytes) and deleted {}, {} new fragments in {} blocks",
        stats.added, stats.input_bytes, stats.deleted, stats.fragments_added, stats.blocks_written
    );
    println!(
        "{} + ({} -> {}) = {}",
        stats.start_offset,
        stats.input_bytes,
        stats.archive_end - stats.start_offset,
        stats.archive_end
    );
}

fn print_list(report: &list::ListReport) {
    if let Some(summary) = &report.summary {
        let mut table = Table::new();
        table.load_preset(UTF8_FULL_CONDENSED);
        table.set_header(vec!["Rank", "Size (MB)", "Files", "File, Directory/, or .Type"]);
        for (rank, row) in summary.top.iter().enumerate() {
            table.add_row(vec![
                (rank + 1).to_string(),
                format!("{:.6}", row.size as f64 / 1e6),
                row.count.to_string(),
                row.name.clone(),
            ]);
        }
        println!("{table}");

        let mut table = Table::new();
        table.load_preset(UTF8_FULL_CONDENSED);
        table.set_header(vec!["Shares", "Fragments", "Deduplicated MB", "Extracted MB"]);
        for row in &summary.shares {
            let shares = match row.shares {
                None => "Total".to_string(),
                Some(10) => "10+".to_string(),
                Some(n) => n.to_string(),
            };
            table.add_row(vec![
                shares,
                row.fragments.to_string(),
                format!("{:.6}", row.deduplicated_bytes as f64 / 1e6),
                format!("{:.6}", row.extracted_bytes as f64 / 1e6),
            ]);
        }
        println!("{table}");

        println!(
            "{} references to {} of {} fragments have unknown size.",
            summary.unknown_size_refs,
            summary.unknown_size_fragments,
            report
                .versions
                .last()
                .map(|v| v.last_fragment)
                .unwrap_or(0)
        );
        print!(
            "{} of {} blocks used.\nCompression {:.6} -> {:.6} MB",
            summary.blocks_used,
            summary.blocks_total,
            summary.stored_bytes as f64 / 1e6,
            report.archive_size as f64 / 1e6
        );
        if summary.stored_bytes > 0 {
            print!(
                " (ratio {:.3}%)",
                report.archive_size as f64 * 100.0 / summary.stored_bytes as f64
            );
        }
        println!();
    } else {
        for row in &report.rows {
            if row.deleted {
                println!("{:4} {:<40}{}", row.version, "Deleted", row.path);
            } else {
                println!(
                    "{:4} {} {} {:>12} {}",
                    row.version,
                    date::date_to_string(row.date),
                    row.attr.render(),
                    row.size.map(|s| s.to_string()).unwrap_or_else(|| "-".into()),
                    row.path
                );
            }
        }
        println!(
            "{} of {} files shown. {} -> {}",
            report.shown, report.total_files, report.shown_bytes, report.archive_size
        );
    }
    print_versions(&report.versions);
}

fn print_versions(rows: &[list::VersionRow]) {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL_CONDENSED);
    table.set_header(vec![
        "Ver",
        "Last frag",
        "Date (UT)",
        "Files",
        "Deleted",
        "Original MB",
        "Compressed MB",
    ]);
    for row in rows {
        table.add_row(vec![
            row.index.to_string(),
            row.last_fragment.to_string(),
            date::date_to_string(row.date),
            row.updates.to_string(),
            row.deletes.to_string(),
            format!("{:.6}", row.data_size as f64 / 1e6),
            format!("{:.6}", row.compressed_size as f64 / 1e6),
        ]);
    }
    println!("{table}");
}

fn print_test(report: &test::TestReport) {
    println!("{} bytes read from archive", report.archive_size);
    if report.index_errors > 0 {
        println!("{} errors found in index", report.index_errors);
    }
    if report.recovered {
        println!("fragment tables were recovered from data blocks");
    }

    println!("\n{} versions", report.versions);
    println!("{} file additions or updates", report.updates);
    println!("{} file deletions", report.deletes);
    println!("{} is the first version", date::date_to_string(report.earliest));
    println!("{} is the latest version", date::date_to_string(report.latest));
    println!("{} undated versions", report.undated_versions);
    println!("{} version dates are out of sequence", report.dates_out_of_order);

    println!("\n{} fragments", report.fragments);
    println!("{} blocks", report.blocks);
    println!("{} known uncompressed bytes", report.known_bytes);
    println!("{} is the largest fragment size", report.largest_fragment);
    println!("{} is the largest uncompressed block size", report.largest_block);
    println!("{} fragments of unknown size", report.unknown_size_fragments);
    println!("{} fragments without hashes", report.unhashed_fragments);
    println!("{} missing or misplaced fragments", report.bad_locators);

    println!("\n{} file versions", report.file_versions);
    println!("{} files in current version", report.current_files);
    println!("{} deleted files in current version", report.deleted_files);
    println!("{} references to fragments", report.fragment_refs);
    println!("{} known uncompressed bytes in all versions", report.referenced_bytes);
    println!("{} in current version", report.current_bytes);
    if let Some(ratio) = report.compression_ratio() {
        println!("{ratio:.3}% compression ratio");
    }
    println!("{} unreferenced fragments", report.unreferenced_fragments);
    println!("{} corrupt fragment references", report.corrupt_references);

    println!("\n{} data blocks bad", report.bad_blocks);
    println!(
        "{} of {} file versions damaged",
        report.damaged_files, report.tested_versions
    );
    if report.ok() {
        println!("Archive OK");
    } else {
        println!("Archive corrupted");
    }
}
