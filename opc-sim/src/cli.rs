use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// OPC DA simulator: browse, read, write and watch subscriptions over a
/// simulated device.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Simulation file with [server] and [[tags]] tables; the demo plant is used without it
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Directory for the daily rolling log file
    #[arg(long, global = true, default_value = "logs")]
    pub log_dir: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// List branches and items of the address space
    Browse {
        /// Branch to list; the root when omitted
        #[arg(short, long, default_value = "")]
        position: String,

        /// Glob matched against element names
        #[arg(short, long, default_value = "")]
        filter: String,

        /// Print every item ID at any depth instead
        #[arg(long)]
        all: bool,

        /// Upper bound for --all
        #[arg(long, default_value_t = 10_000)]
        max: usize,
    },

    /// Read items once
    Read {
        #[arg(required = true)]
        items: Vec<String>,

        /// Read the cache after one poll period instead of the device
        #[arg(long)]
        cache: bool,
    },

    /// Write one value, converted to the item's type
    Write { item: String, value: String },

    /// Subscribe and print every delivery
    Watch {
        /// Items to subscribe to; every item when omitted
        #[arg(short, long, num_args = 1..)]
        items: Vec<String>,

        /// Requested update rate in milliseconds
        #[arg(short, long, default_value_t = 1000)]
        rate: u32,

        /// Percent deadband for analog items
        #[arg(short, long, default_value_t = 0.0)]
        deadband: f32,

        /// Stop after this many seconds; 0 runs until Ctrl-C
        #[arg(long, default_value_t = 0)]
        duration: u64,

        /// Restore groups from a saved configuration instead of creating one
        #[arg(long)]
        load: Option<PathBuf>,

        /// Save the group configuration here on exit
        #[arg(long)]
        save: Option<PathBuf>,
    },
}
