use clap::{ArgAction, Parser};
use env_logger::Env;
use std::path::PathBuf;
use std::process::exit;
use wheelhouse_common::errors::*;
use wheelhoused::config;

#[derive(Debug, Parser)]
#[command(version)]
struct Args {
    /// Verbose logging
    #[arg(short, long, action(ArgAction::Count))]
    verbose: u8,
    /// Load and print a config
    #[arg(long)]
    check_config: bool,
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let logging = match args.verbose {
        0 => "info",
        1 => "wheelhoused=debug,wheelhouse_common=debug,info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::init_from_env(Env::default().default_filter_or(logging));

    dotenv::dotenv().ok();
    let config = match config::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            error!("Configuration error: {:#}", err);
            exit(2);
        }
    };

    if args.check_config {
        println!("{:#?}", config);
        return;
    }

    if let Err(err) = wheelhoused::run(config, args.config).await {
        error!("Master failed: {:#}", err);
        exit(1);
    }
}
