use crate::args::{Args, ImportArgs, SubCommand};
use clap::Parser;
use colored::*;
use env_logger::Env;
use std::collections::HashMap;
use std::process::exit;
use tokio::io::BufStream;
use tokio::net::TcpStream;
use wheelhouse_common::api::{Client, SlavePhase, SlaveSummary, StatsSnapshot, StatusStream};
use wheelhouse_common::errors::*;
use wheelhouse_common::proto::control::{ControlReply, ControlRequest, StatusEvent};
use wheelhouse_common::proto::import::{ImportReply, ImportRequest};
use wheelhouse_common::proto::transfer::{upload_file, DoneCode};
use wheelhouse_common::proto;
use wheelhouse_common::utils::{file_sha256, human_size};
use wheelhouse_common::{PkgName, WheelFile, WheelTags};

mod args;

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let logging = match args.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::init_from_env(Env::default().default_filter_or(logging));
    dotenv::dotenv().ok();

    if let Err(err) = run(args).await {
        error!("{:#}", err);
        exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    match args.subcommand {
        SubCommand::Status => {
            let mut client = Client::connect(&args.control_addr).await?;
            match client.request(&ControlRequest::GetStatus).await? {
                ControlReply::Status {
                    stats,
                    slaves,
                    paused,
                } => {
                    if paused {
                        println!("{}", "dispatch is PAUSED".yellow().bold());
                    }
                    print_stats(&stats);
                    print_slaves(&slaves);
                }
                other => bail!("Unexpected reply: {:?}", other),
            }
        }
        SubCommand::Watch => {
            let mut stream = StatusStream::connect(&args.status_addr).await?;
            while let Some(event) = stream.next_event().await? {
                match event {
                    StatusEvent::Stats { stats } => print_stats(&stats),
                    StatusEvent::Slaves { slaves } => print_slaves(&slaves),
                    StatusEvent::Paused { paused } => {
                        if paused {
                            println!("{}", "dispatch is PAUSED".yellow().bold());
                        } else {
                            println!("{}", "dispatch resumed".green());
                        }
                    }
                }
            }
        }
        SubCommand::Pause => {
            simple_command(&args.control_addr, ControlRequest::Pause).await?;
            println!("{}", "paused".yellow());
        }
        SubCommand::Resume => {
            simple_command(&args.control_addr, ControlRequest::Resume).await?;
            println!("{}", "resumed".green());
        }
        SubCommand::KillSlave { slave_id } => {
            simple_command(&args.control_addr, ControlRequest::KillSlave { slave_id }).await?;
            println!("slave {} will be dismissed at its next message", slave_id);
        }
        SubCommand::Skip {
            package,
            version,
            reason,
        } => {
            simple_command(
                &args.control_addr,
                ControlRequest::Skip {
                    package,
                    version,
                    reason,
                },
            )
            .await?;
            println!("{}", "skipped".yellow());
        }
        SubCommand::Unskip { package, version } => {
            simple_command(
                &args.control_addr,
                ControlRequest::Unskip { package, version },
            )
            .await?;
            println!("{}", "unskipped".green());
        }
        SubCommand::Rebuild { package, version } => {
            simple_command(
                &args.control_addr,
                ControlRequest::Rebuild { package, version },
            )
            .await?;
            println!("{}", "builds forgotten, version queued again".green());
        }
        SubCommand::Reload => {
            let mut client = Client::connect(&args.control_addr).await?;
            match client.request(&ControlRequest::Reload).await? {
                ControlReply::Reloaded {
                    applied,
                    restart_required,
                } => {
                    for field in applied {
                        println!("{} {}", "applied:".green(), field);
                    }
                    for field in restart_required {
                        println!("{} {}", "needs restart:".yellow(), field);
                    }
                }
                other => bail!("Unexpected reply: {:?}", other),
            }
        }
        SubCommand::Import(import) => {
            run_import(&args.import_addr, &args.file_addr, import).await?;
        }
    }
    Ok(())
}

async fn simple_command(addr: &str, request: ControlRequest) -> Result<()> {
    let mut client = Client::connect(addr).await?;
    match client.request(&request).await? {
        ControlReply::Ok => Ok(()),
        other => bail!("Unexpected reply: {:?}", other),
    }
}

fn print_stats(stats: &StatsSnapshot) {
    println!(
        "{:-25} {} ({} skipped)",
        "packages".bold(),
        stats.packages_count,
        stats.packages_skipped
    );
    println!(
        "{:-25} {} ({} skipped)",
        "versions".bold(),
        stats.versions_count,
        stats.versions_skipped
    );
    println!(
        "{:-25} {} ({} ok, {} failed, {}s spent)",
        "build attempts".bold(),
        stats.builds_count,
        stats.builds_succeeded.to_string().green(),
        stats.builds_failed.to_string().red(),
        stats.build_ms_total / 1000
    );
    println!(
        "{:-25} {} ({})",
        "files".bold(),
        stats.files_count,
        human_size(stats.files_bytes.max(0) as u64)
    );
    println!(
        "{:-25} {} ({} in 30 days)",
        "downloads".bold(),
        stats.downloads_count,
        stats.downloads_last_month
    );
}

fn print_slaves(slaves: &[SlaveSummary]) {
    if slaves.is_empty() {
        println!("{}", "no slaves connected".yellow());
        return;
    }
    for slave in slaves {
        let label = format!("{} ({})", slave.label.green(), slave.abi_tag.yellow());
        let doing = match (&slave.phase, &slave.current_build) {
            (SlavePhase::Idle, _) => "idle".blue().to_string(),
            (SlavePhase::Building, Some((package, version))) => {
                format!("building {} {}", package.bold(), version)
            }
            (SlavePhase::Sending, Some((package, version))) => {
                format!("uploading {} {}", package.bold(), version)
            }
            (phase, None) => format!("{:?}", phase),
        };
        println!("{:3} {:-40} => {}", slave.slave_id, label, doing);
    }
}

async fn run_import(import_addr: &str, file_addr: &str, import: ImportArgs) -> Result<()> {
    if import.wheels.is_empty() {
        bail!("Nothing to import");
    }

    // All wheels on one command line are registered as one build, so they
    // must agree on package and version.
    let mut files = Vec::new();
    let mut paths = HashMap::new();
    let mut package_version: Option<(String, String)> = None;
    for path in &import.wheels {
        let filename = path
            .file_name()
            .ok_or_else(|| format_err!("Not a file: {:?}", path))?
            .to_string_lossy()
            .into_owned();
        let tags = WheelTags::from_filename(&filename)?;
        let package = tags.package_tag.parse::<PkgName>()?.into_string();
        let version = tags.package_version_tag.clone();
        match &package_version {
            None => package_version = Some((package, version)),
            Some((expected_package, expected_version)) => {
                if *expected_package != package || *expected_version != version {
                    bail!(
                        "All wheels must share one package and version, got {} {}",
                        package,
                        version
                    );
                }
            }
        }
        let (filesize, filehash) = file_sha256(path).await?;
        paths.insert(filename.clone(), path.clone());
        files.push(WheelFile {
            filename,
            filesize,
            filehash,
            tags,
            dependencies: Vec::new(),
        });
    }
    let (package, version) = package_version.expect("wheels checked non-empty");
    let abi_tag = import
        .abi
        .clone()
        .unwrap_or_else(|| files[0].tags.abi_tag.clone());

    let stream = TcpStream::connect(import_addr)
        .await
        .with_context(|| format!("Failed to connect to import socket: {:?}", import_addr))?;
    let mut stream = BufStream::new(stream);
    proto::send(
        &mut stream,
        &ImportRequest::Import {
            package: package.clone(),
            version: version.clone(),
            abi_tag,
            built_by: import.built_by.clone(),
            duration_ms: 0,
            output: "imported with wheelhousectl\n".to_string(),
            files,
        },
    )
    .await?;

    loop {
        let reply: ImportReply = proto::recv(&mut stream)
            .await?
            .ok_or_else(|| format_err!("Import connection closed early"))?;
        match reply {
            ImportReply::Send { slave_id, filename } => {
                let path = paths
                    .get(&filename)
                    .ok_or_else(|| format_err!("Master asked for unknown file: {}", filename))?;
                info!("uploading {}", filename);
                match upload_file(file_addr, slave_id, path).await? {
                    DoneCode::Ok => {}
                    code => warn!("upload of {} rejected: {:?}", filename, code),
                }
                proto::send(&mut stream, &ImportRequest::Sent).await?;
            }
            ImportReply::Done { build_id } => {
                println!(
                    "{} {} {} as build {}",
                    "imported".green(),
                    package.bold(),
                    version,
                    build_id
                );
                return Ok(());
            }
            ImportReply::Error { message } => bail!("Import refused: {}", message),
        }
    }
}
