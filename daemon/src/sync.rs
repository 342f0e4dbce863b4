use crate::config::Config;
use crate::db::DbClient;
use crate::recorder::Event;
use chrono::{NaiveDateTime, Utc};
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use url::Url;
use wheelhouse_common::errors::*;
use wheelhouse_common::PkgName;

const SIMPLE_JSON: &str = "application/vnd.pypi.simple.v1+json";

#[derive(Debug, Deserialize)]
struct ProjectList {
    projects: Vec<ProjectEntry>,
}

#[derive(Debug, Deserialize)]
struct ProjectEntry {
    name: String,
}

#[derive(Debug, Deserialize)]
struct ProjectDetail {
    #[serde(default)]
    versions: Vec<String>,
    #[serde(default)]
    files: Vec<ProjectFile>,
}

#[derive(Debug, Deserialize)]
struct ProjectFile {
    filename: String,
    #[serde(rename = "upload-time")]
    upload_time: Option<String>,
}

/// Watches the upstream index: new projects and new releases become
/// registration events; projects that vanish upstream are skipped, never
/// deleted, so old builds stay attributable.
pub struct CloudGazer {
    config: Arc<Config>,
    db: DbClient,
    recorder: mpsc::Sender<Event>,
    client: reqwest::Client,
    base: Url,
    shutdown: CancellationToken,
    /// Rotating cursor over the known package list; each cycle refreshes the
    /// next `refresh_batch` packages for new releases.
    cursor: usize,
}

impl CloudGazer {
    pub fn spawn(
        config: Arc<Config>,
        db: DbClient,
        recorder: mpsc::Sender<Event>,
        shutdown: CancellationToken,
    ) -> Result<tokio::task::JoinHandle<()>> {
        let base = config
            .upstream
            .parse::<Url>()
            .with_context(|| format!("Invalid upstream url: {:?}", config.upstream))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .context("Failed to build upstream http client")?;
        let gazer = CloudGazer {
            config,
            db,
            recorder,
            client,
            base,
            shutdown,
            cursor: 0,
        };
        Ok(tokio::spawn(gazer.run()))
    }

    async fn run(mut self) {
        let mut poll = tokio::time::interval(self.config.sync_interval);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = poll.tick() => {
                    // Upstream failures only cost this cycle.
                    if let Err(err) = self.cycle().await {
                        warn!("upstream sync failed: {:#}", err);
                    }
                }
            }
        }
        debug!("upstream watcher exited");
    }

    async fn cycle(&mut self) -> Result<()> {
        let upstream = self.fetch_project_list().await?;
        let known: Vec<String> = self.db.get_all_packages().await?;
        let known_set: HashSet<&str> = known.iter().map(String::as_str).collect();
        let upstream_set: HashSet<&str> = upstream.iter().map(String::as_str).collect();

        let now = Utc::now().naive_utc();
        let mut discovered = 0usize;
        for package in &upstream {
            if known_set.contains(package.as_str()) {
                continue;
            }
            discovered += 1;
            self.send(Event::NewPackage {
                package: package.clone(),
                observed_at: now,
            })
            .await?;
            self.refresh_versions(package, None).await?;
        }

        for package in &known {
            if !upstream_set.contains(package.as_str()) {
                self.send(Event::SkippedUpstream {
                    package: package.clone(),
                    reason: "removed from upstream index".to_string(),
                })
                .await?;
            }
        }

        // Known packages get their release lists refreshed a window at a
        // time; the cursor wraps so every package is eventually revisited.
        if !known.is_empty() {
            let known_pairs: HashSet<(String, String)> = self
                .db
                .get_all_package_versions()
                .await?
                .into_iter()
                .collect();
            let batch = self.config.refresh_batch.min(known.len());
            for offset in 0..batch {
                let package = &known[(self.cursor + offset) % known.len()];
                if let Err(err) = self.refresh_versions(package, Some(&known_pairs)).await {
                    debug!("refresh of {} failed: {:#}", package, err);
                }
            }
            self.cursor = (self.cursor + batch) % known.len();
        }

        if discovered > 0 {
            info!("discovered {} new packages upstream", discovered);
        }
        Ok(())
    }

    /// Registers any release of `package` we have not seen. `known_pairs`
    /// is `None` for brand-new packages, where every release is new.
    async fn refresh_versions(
        &self,
        package: &str,
        known_pairs: Option<&HashSet<(String, String)>>,
    ) -> Result<()> {
        let detail = self.fetch_project_detail(package).await?;
        for version in &detail.versions {
            let seen = known_pairs
                .map(|pairs| pairs.contains(&(package.to_string(), version.clone())))
                .unwrap_or(false);
            if seen {
                continue;
            }
            let released_at = release_time(&detail.files, version)
                .unwrap_or_else(|| Utc::now().naive_utc());
            self.send(Event::NewVersion {
                package: package.to_string(),
                version: version.clone(),
                released_at,
            })
            .await?;
        }
        Ok(())
    }

    async fn send(&self, event: Event) -> Result<()> {
        self.recorder
            .send(event)
            .await
            .map_err(|_| format_err!("Recorder is gone"))
    }

    async fn fetch_project_list(&self) -> Result<Vec<String>> {
        let url = self.base.join("simple/")?;
        let list: ProjectList = self
            .client
            .get(url.clone())
            .header(reqwest::header::ACCEPT, SIMPLE_JSON)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
            .with_context(|| format!("Failed to parse project list from {}", url))?;
        let mut names = Vec::with_capacity(list.projects.len());
        for project in list.projects {
            match project.name.parse::<PkgName>() {
                Ok(name) => names.push(name.into_string()),
                Err(err) => debug!("ignoring upstream project: {:#}", err),
            }
        }
        Ok(names)
    }

    async fn fetch_project_detail(&self, package: &str) -> Result<ProjectDetail> {
        let url = self.base.join(&format!("simple/{}/", package))?;
        let detail = self
            .client
            .get(url.clone())
            .header(reqwest::header::ACCEPT, SIMPLE_JSON)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
            .with_context(|| format!("Failed to parse project detail from {}", url))?;
        Ok(detail)
    }
}

/// Earliest upload time among the files of one release. The index carries
/// times per file, not per release, so the release time is derived.
fn release_time(files: &[ProjectFile], version: &str) -> Option<NaiveDateTime> {
    let mid = format!("-{}-", version);
    let tail = format!("-{}.", version);
    files
        .iter()
        .filter(|file| file.filename.contains(&mid) || file.filename.contains(&tail))
        .filter_map(|file| file.upload_time.as_deref())
        .filter_map(|stamp| chrono::DateTime::parse_from_rfc3339(stamp).ok())
        .map(|stamp| stamp.naive_utc())
        .min()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(filename: &str, upload_time: Option<&str>) -> ProjectFile {
        ProjectFile {
            filename: filename.to_string(),
            upload_time: upload_time.map(String::from),
        }
    }

    #[test]
    fn release_time_takes_earliest_matching_file() {
        let files = vec![
            file("foo-1.0.tar.gz", Some("2024-03-01T10:00:00Z")),
            file(
                "foo-1.0-py3-none-any.whl",
                Some("2024-03-01T09:00:00+00:00"),
            ),
            file("foo-2.0.tar.gz", Some("2024-01-01T00:00:00Z")),
        ];
        let released = release_time(&files, "1.0").unwrap();
        assert_eq!(
            released,
            chrono::NaiveDate::from_ymd_opt(2024, 3, 1)
                .unwrap()
                .and_hms_opt(9, 0, 0)
                .unwrap()
        );
    }

    #[test]
    fn release_time_is_none_without_timestamps() {
        let files = vec![file("foo-1.0.tar.gz", None)];
        assert_eq!(release_time(&files, "1.0"), None);
        assert_eq!(release_time(&files, "3.0"), None);
    }

    #[test]
    fn project_list_parses_pep691_shape() {
        let list: ProjectList =
            serde_json::from_str(r#"{"meta":{},"projects":[{"name":"Foo_Bar"}]}"#).unwrap();
        assert_eq!(list.projects.len(), 1);
        assert_eq!(list.projects[0].name, "Foo_Bar");
    }
}
