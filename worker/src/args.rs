use clap::{ArgAction, Parser};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(version)]
pub struct Args {
    /// Verbose logging
    #[arg(short, long, action(ArgAction::Count))]
    pub verbose: u8,
    /// Configuration file path
    #[arg(short, long)]
    pub config: Option<PathBuf>,
    /// Master dispatch address, overriding the config file
    #[arg(long)]
    pub master: Option<String>,
    /// Label reported to the master, overriding the config file
    #[arg(long)]
    pub label: Option<String>,
    /// Load and print the config
    #[arg(long)]
    pub check_config: bool,
}
