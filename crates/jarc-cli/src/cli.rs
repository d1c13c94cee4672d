use clap::{Args, Parser, Subcommand};

/// Options shared by every command, mirroring the engine's option set.
#[derive(Args, Debug, Default)]
pub(crate) struct CommonOpts {
    /// Exclude files and directories matching these prefixes
    #[arg(long, value_name = "PATH", num_args = 1..)]
    pub not: Vec<String>,

    /// Rename external paths by prefix substitution (pairs with the
    /// positional arguments), or prepend a single prefix
    #[arg(long, value_name = "PATH", num_args = 1..)]
    pub to: Vec<String>,

    /// Roll back to a version number or date YYYYMMDD[HH[MM[SS]]]
    #[arg(long, value_name = "N|DATE")]
    pub until: Option<String>,

    /// add: store files even if unchanged; extract: overwrite existing files
    #[arg(long)]
    pub force: bool,

    /// Hide entries smaller than N bytes (all of them without N)
    #[arg(long, value_name = "N", num_args = 0..=1, default_missing_value = "18446744073709551615")]
    pub quiet: Option<u64>,

    /// Worker threads (default: detected processor count)
    #[arg(long, value_name = "N")]
    pub threads: Option<usize>,

    /// Skip locator tags, checksums, and redundant trailers (faster,
    /// smaller, unrecoverable)
    #[arg(long)]
    pub fragile: bool,
}

#[derive(Parser)]
#[command(
    name = "jarc",
    version,
    about = "Journaling incremental deduplicating archiver",
    infer_subcommands = true,
    after_help = "\
Commands may be abbreviated to any prefix (or x for extract); long options
may be abbreviated to any unique prefix. An archive name without a .zpaq
suffix gets one appended."
)]
pub(crate) struct Cli {
    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Add changed files to the archive as a new snapshot
    #[command(infer_long_args = true)]
    Add {
        archive: String,

        /// Files and directories to add
        #[arg(required = true)]
        files: Vec<String>,

        /// Compression method: 0..6, x<bits>[,<level>], or s<bits>[,<level>]
        #[arg(long, short, default_value = "1")]
        method: String,

        #[command(flatten)]
        common: CommonOpts,
    },

    /// Extract the latest (or selected) versions of files
    #[command(visible_alias = "x", infer_long_args = true)]
    Extract {
        archive: String,

        /// Restrict extraction to these paths
        files: Vec<String>,

        #[command(flatten)]
        common: CommonOpts,
    },

    /// List archive contents
    #[command(infer_long_args = true)]
    List {
        archive: String,

        /// Restrict the listing to these paths
        files: Vec<String>,

        /// First version to show; negative counts back from the latest
        #[arg(long, value_name = "N", default_value_t = 0)]
        since: i64,

        /// Show top-N files, directories, and types instead of rows
        #[arg(long, value_name = "N", num_args = 0..=1, default_missing_value = "20")]
        summary: Option<usize>,

        /// Show every stored version, not just the latest
        #[arg(long)]
        all: bool,

        #[command(flatten)]
        common: CommonOpts,
    },

    /// Mark files as deleted in a new snapshot
    #[command(infer_long_args = true)]
    Delete {
        archive: String,

        /// Files and directories to delete
        #[arg(required = true)]
        files: Vec<String>,

        #[command(flatten)]
        common: CommonOpts,
    },

    /// Verify archive integrity
    #[command(infer_long_args = true)]
    Test {
        archive: String,

        /// Restrict reporting to these paths
        files: Vec<String>,

        #[command(flatten)]
        common: CommonOpts,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn commands_accept_first_letter() {
        for (argv, want_add) in [
            (vec!["jarc", "a", "arch", "dir"], true),
            (vec!["jarc", "add", "arch", "dir"], true),
            (vec!["jarc", "x", "arch"], false),
            (vec!["jarc", "e", "arch"], false),
        ] {
            let cli = Cli::try_parse_from(argv).unwrap();
            match cli.command {
                Commands::Add { .. } => assert!(want_add),
                Commands::Extract { .. } => assert!(!want_add),
                _ => panic!("unexpected command"),
            }
        }
        assert!(Cli::try_parse_from(["jarc", "l", "arch"]).is_ok());
        assert!(Cli::try_parse_from(["jarc", "t", "arch"]).is_ok());
        assert!(Cli::try_parse_from(["jarc", "d", "arch", "f"]).is_ok());
    }

    #[test]
    fn long_options_accept_unique_prefixes() {
        let cli = Cli::try_parse_from(["jarc", "add", "arch", "dir", "--meth", "3", "--fra"])
            .unwrap();
        let Commands::Add { method, common, .. } = cli.command else {
            panic!("expected add");
        };
        assert_eq!(method, "3");
        assert!(common.fragile);
    }

    #[test]
    fn quiet_and_summary_accept_optional_values() {
        let cli = Cli::try_parse_from(["jarc", "list", "arch", "--summary", "--quiet"]).unwrap();
        let Commands::List { summary, common, .. } = cli.command else {
            panic!("expected list");
        };
        assert_eq!(summary, Some(20));
        assert_eq!(common.quiet, Some(u64::MAX));

        let cli = Cli::try_parse_from(["jarc", "list", "arch", "--summary", "5"]).unwrap();
        let Commands::List { summary, .. } = cli.command else {
            panic!("expected list");
        };
        assert_eq!(summary, Some(5));
    }

    #[test]
    fn add_requires_files() {
        assert!(Cli::try_parse_from(["jarc", "add", "arch"]).is_err());
        assert!(Cli::try_parse_from(["jarc", "delete", "arch"]).is_err());
        assert!(Cli::try_parse_from(["jarc", "extract", "arch"]).is_ok());
    }
}
