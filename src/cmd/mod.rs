//! CLI command handlers (SPEC_FULL §A.4).

use clap::Subcommand;

pub mod diagnostics;
pub mod root;

#[derive(Subcommand)]
pub enum Commands {
    /// Fingerprint the engine once and print the result
    Diagnostics,
}
