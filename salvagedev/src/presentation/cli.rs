use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(author, version, about = "salvagedev CLI (alpha)", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List the snapshots of a backup
    Snapshots {
        /// Directory holding catalog.json and container files
        root: PathBuf,
        backup: String,
    },

    /// List the files of one snapshot
    Files {
        root: PathBuf,
        backup: String,

        /// 0 = earliest, -1 = latest, N = snapshot N
        #[arg(long, default_value_t = -1, allow_negative_numbers = true)]
        snapshot: i64,
    },

    /// Download and decrypt a snapshot into `dest`
    Restore {
        root: PathBuf,
        backup: String,
        dest: PathBuf,

        #[arg(long, default_value_t = -1, allow_negative_numbers = true)]
        snapshot: i64,

        /// JSON file with download options
        #[arg(long)]
        config: Option<PathBuf>,

        #[arg(long)]
        threads: Option<usize>,

        /// Extra rounds for signatures that failed
        #[arg(long)]
        retries: Option<u32>,

        /// Restrict to these domains (repeatable)
        #[arg(long = "domain")]
        domains: Vec<String>,

        /// Restrict to these file extensions (repeatable)
        #[arg(long = "ext")]
        extensions: Vec<String>,
    },
}
