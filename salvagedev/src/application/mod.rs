pub mod handlers;

use crate::presentation::cli::{Cli, Commands};
use clap::Parser;
use salvage_core::error::Result;

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Snapshots { root, backup } => handlers::handle_snapshots(root, &backup),
        Commands::Files {
            root,
            backup,
            snapshot,
        } => handlers::handle_files(root, &backup, snapshot),
        Commands::Restore {
            root,
            backup,
            dest,
            snapshot,
            config,
            threads,
            retries,
            domains,
            extensions,
        } => handlers::handle_restore(handlers::RestoreArgs {
            root,
            backup,
            dest,
            snapshot,
            config,
            threads,
            retries,
            domains,
            extensions,
        }),
    }
}
