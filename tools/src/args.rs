use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(version)]
pub struct Args {
    /// Verbose logging
    #[arg(short, long, action(ArgAction::Count))]
    pub verbose: u8,
    /// Master control socket
    #[arg(long, default_value = "127.0.0.1:5559")]
    pub control_addr: String,
    /// Master status socket
    #[arg(long, default_value = "127.0.0.1:5558")]
    pub status_addr: String,
    /// Master import socket
    #[arg(long, default_value = "127.0.0.1:5560")]
    pub import_addr: String,
    /// Master file transfer socket
    #[arg(long, default_value = "127.0.0.1:5556")]
    pub file_addr: String,
    #[command(subcommand)]
    pub subcommand: SubCommand,
}

#[derive(Debug, Subcommand)]
pub enum SubCommand {
    /// Show current farm statistics and slaves
    Status,
    /// Follow the status feed
    Watch,
    /// Stop handing out new builds
    Pause,
    /// Resume handing out builds
    Resume,
    /// Disconnect a slave at its next message
    KillSlave {
        slave_id: u32,
    },
    /// Hide a package (or one version) from the build queue
    Skip {
        package: String,
        #[arg(long)]
        version: Option<String>,
        reason: String,
    },
    /// Make a skipped package (or version) buildable again
    Unskip {
        package: String,
        #[arg(long)]
        version: Option<String>,
    },
    /// Forget recorded builds so the queue picks them up again
    Rebuild {
        package: String,
        #[arg(long)]
        version: Option<String>,
    },
    /// Re-read the master configuration
    Reload,
    /// Register externally built wheels
    Import(ImportArgs),
}

#[derive(Debug, Parser)]
pub struct ImportArgs {
    /// Wheel files to register; package and version come from the filename
    pub wheels: Vec<PathBuf>,
    /// ABI the build is recorded under (defaults to the wheel's abi tag)
    #[arg(long)]
    pub abi: Option<String>,
    /// Attribution recorded as the builder
    #[arg(long, default_value = "import")]
    pub built_by: String,
}
