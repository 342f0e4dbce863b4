use crate::config::Config;
use std::process::Stdio;
use std::time::Instant;
use tokio::process::Command;
use wheelhouse_common::errors::*;
use wheelhouse_common::utils::file_sha256;
use wheelhouse_common::{BuildStatus, WheelFile, WheelTags};

#[derive(Debug)]
pub struct BuildResult {
    pub status: BuildStatus,
    pub duration_ms: u64,
    pub output: String,
    pub files: Vec<WheelFile>,
    /// Scratch directory holding the wheels; dropped (and deleted) once the
    /// upload loop is done with them.
    pub scratch: Option<tempfile::TempDir>,
}

/// Builds one version with pip in a scratch directory and collects every
/// wheel it produced. A failed or timed-out build still yields a result so
/// the master can record the attempt.
pub async fn build(config: &Config, package: &str, version: &str) -> Result<BuildResult> {
    let scratch = tempfile::Builder::new()
        .prefix("wheelhouse-build-")
        .tempdir_in(&config.scratch_dir)
        .context("Failed to create build scratch directory")?;

    let started = Instant::now();
    let child = Command::new(&config.pip)
        .arg("wheel")
        .arg(format!("{}=={}", package, version))
        .arg("--wheel-dir")
        .arg(scratch.path())
        .arg("--no-deps")
        .arg("--no-cache-dir")
        .arg("--disable-pip-version-check")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("Failed to run {:?}", config.pip))?;

    let output = match tokio::time::timeout(config.build_timeout, child.wait_with_output()).await
    {
        Ok(output) => output.context("Failed to collect build output")?,
        Err(_) => {
            // kill_on_drop reaps the child once the future is dropped.
            return Ok(BuildResult {
                status: BuildStatus::Failure,
                duration_ms: started.elapsed().as_millis() as u64,
                output: format!(
                    "build timed out after {}s\n",
                    config.build_timeout.as_secs()
                ),
                files: Vec::new(),
                scratch: None,
            });
        }
    };
    let duration_ms = started.elapsed().as_millis() as u64;

    let mut log = String::new();
    log.push_str(&String::from_utf8_lossy(&output.stdout));
    log.push_str(&String::from_utf8_lossy(&output.stderr));
    if log.len() > config.output_limit {
        log.truncate(config.output_limit);
        log.push_str("\n[output truncated]\n");
    }

    if !output.status.success() {
        return Ok(BuildResult {
            status: BuildStatus::Failure,
            duration_ms,
            output: log,
            files: Vec::new(),
            scratch: None,
        });
    }

    let mut files = Vec::new();
    let mut entries = tokio::fs::read_dir(scratch.path()).await?;
    while let Some(entry) = entries.next_entry().await? {
        let filename = entry.file_name().to_string_lossy().into_owned();
        if !filename.ends_with(".whl") {
            continue;
        }
        let tags = WheelTags::from_filename(&filename)
            .with_context(|| format!("pip produced an odd wheel name: {:?}", filename))?;
        let (filesize, filehash) = file_sha256(&entry.path()).await?;
        files.push(WheelFile {
            filename,
            filesize,
            filehash,
            tags,
            dependencies: Vec::new(),
        });
    }
    files.sort_by(|a, b| a.filename.cmp(&b.filename));

    Ok(BuildResult {
        status: BuildStatus::Success,
        duration_ms,
        output: log,
        files,
        scratch: Some(scratch),
    })
}
