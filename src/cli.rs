use std::path::PathBuf;

use clap::Parser;

/// StorageSage: keeps filesystem volumes from filling up.
#[derive(Debug, Parser)]
#[command(name = "storage-sage", version, about)]
pub struct Cli {
    /// Path to the YAML configuration file.
    #[arg(long)]
    pub config: PathBuf,

    /// Run exactly one cycle and exit; does not open the HTTP port.
    #[arg(long)]
    pub once: bool,

    /// Override `dry_run` from the config file.
    #[arg(long)]
    pub dry_run: bool,

    /// Recreate the audit store from scratch if it is found to be corrupt.
    #[arg(long)]
    pub reinitialize_audit_store: bool,
}
