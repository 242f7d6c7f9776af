use clap::{Parser, Subcommand};
use std::path::PathBuf;

use webmforge_engine::Backend;

#[derive(Parser)]
#[command(name = "webmforge")]
#[command(author, version, about = "WebM to MP4 conversion service")]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the HTTP server
    Start {
        /// Host to bind to (overrides config)
        #[arg(long)]
        host: Option<String>,

        /// Port to listen on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Convert a single WebM file to MP4
    Convert {
        /// WebM file to convert
        #[arg(required = true)]
        input: PathBuf,

        /// Output path (default: input with an .mp4 extension)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Execution backend: process or sandbox (overrides config)
        #[arg(long)]
        backend: Option<Backend>,
    },

    /// Reclaim expired and orphaned artifacts once
    Sweep,

    /// Check that required external tools are available
    CheckTools,

    /// Validate configuration file
    Validate {
        /// Config file to validate (uses default if not specified)
        config: Option<PathBuf>,
    },

    /// Display version information
    Version,
}
