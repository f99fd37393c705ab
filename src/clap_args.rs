use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(version, about = "Compare container networking modes on throughput, latency and UDP quality", long_about = None)]
pub struct Args {
    /// Path to the experiment config
    #[arg(short, long, default_value = "netbench.toml")]
    pub file: PathBuf,

    /// Verbose mode (-v, --verbose)
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Write an example netbench.toml to the current directory
    Init,

    /// Provision the server endpoint for a mode and leave it running
    Serve {
        /// Name of the network mode to serve
        mode: String,
    },

    /// Benchmark a single network mode and merge it into the comparison
    Run {
        /// Name of the network mode to benchmark
        mode: String,
    },

    /// Render the comparison charts from the saved results
    Report,
}

pub fn parse() -> Args {
    Args::parse()
}
