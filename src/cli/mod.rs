pub mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "wirefeed")]
#[command(about = "A live news feed client with session tracking", long_about = None)]
pub struct Cli {
    /// Backend endpoint (overrides the config file)
    #[arg(long, global = true)]
    pub endpoint: Option<String>,

    /// Path to the local database
    #[arg(long, global = true)]
    pub db: Option<PathBuf>,

    /// Path to the config file
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Sign in and follow the live feed until interrupted
    Run {
        /// User to sign in as
        #[arg(short, long)]
        user: String,

        /// Poll interval once push is abandoned (e.g., "30s", "2m")
        #[arg(short, long)]
        poll_interval: Option<String>,
    },
    /// Fetch the current articles once and list them
    Articles,
    /// Expire a user's sessions abandoned past the hard logout age
    Sweep {
        /// User whose sessions to sweep
        #[arg(short, long)]
        user: String,
    },
    /// Show the locally stored session
    Session,
    /// End the stored session and clear local state
    Logout,
}
