//! Command-line arguments.

use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "kiln", version, about = "Continuous-integration scheduler core")]
pub struct Args {
    /// Path to the core configuration file.
    #[arg(short, long, env = "KILN_CONFIG", default_value = "core.json")]
    pub config: PathBuf,
}
