use crate::config::Config;
use crate::db::{DbClient, ProjectData};
use crate::models::File;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use wheelhouse_common::api::StatsSnapshot;
use wheelhouse_common::errors::*;
use wheelhouse_common::utils::human_size;

/// One page (or page group) to rebuild. The inbound queue is a set keyed on
/// these, so a burst of identical requests collapses into a single write.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum IndexItem {
    /// Package file index plus its project page.
    Rewrite(String),
    /// Project page only (metadata changed, file set did not).
    RewriteProject(String),
    /// Root package list and packages.json.
    RewriteRoot,
}

#[derive(Debug)]
pub enum ScribeMsg {
    Item(IndexItem),
    Stats(StatsSnapshot),
}

pub struct Scribe {
    config: Arc<Config>,
    db: DbClient,
    rx: mpsc::Receiver<ScribeMsg>,
    shutdown: CancellationToken,
    pending: BTreeSet<IndexItem>,
    stats: Option<StatsSnapshot>,
}

impl Scribe {
    pub fn spawn(
        config: Arc<Config>,
        db: DbClient,
        shutdown: CancellationToken,
    ) -> Result<(mpsc::Sender<ScribeMsg>, tokio::task::JoinHandle<()>)> {
        fs::create_dir_all(config.simple_path())
            .context("Failed to create simple index directory")?;
        fs::create_dir_all(config.project_path())
            .context("Failed to create project index directory")?;

        let (tx, rx) = mpsc::channel(64);
        let scribe = Scribe {
            config,
            db,
            rx,
            shutdown,
            pending: BTreeSet::new(),
            stats: None,
        };
        let handle = tokio::spawn(scribe.run());
        Ok((tx, handle))
    }

    async fn run(mut self) {
        loop {
            let msg = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                msg = self.rx.recv() => match msg {
                    Some(msg) => msg,
                    None => break,
                },
            };
            self.absorb(msg);

            // Coalescing horizon: keep absorbing for one write cycle, then
            // drain the whole set at once.
            let deadline = tokio::time::sleep(self.config.write_cycle);
            tokio::pin!(deadline);
            loop {
                tokio::select! {
                    _ = &mut deadline => break,
                    _ = self.shutdown.cancelled() => break,
                    msg = self.rx.recv() => match msg {
                        Some(msg) => self.absorb(msg),
                        None => break,
                    },
                }
            }

            self.flush().await;

            if self.shutdown.is_cancelled() {
                break;
            }
        }

        // Flush whatever arrived before the end marker.
        while let Ok(msg) = self.rx.try_recv() {
            self.absorb(msg);
        }
        self.flush().await;
        debug!("index writer exited");
    }

    fn absorb(&mut self, msg: ScribeMsg) {
        match msg {
            ScribeMsg::Item(item) => {
                self.pending.insert(item);
            }
            ScribeMsg::Stats(stats) => self.stats = Some(stats),
        }
    }

    async fn flush(&mut self) {
        let items = std::mem::take(&mut self.pending);
        for item in items {
            if let Err(err) = self.write_item(&item).await {
                error!("Failed to write index for {:?}: {:#}", item, err);
            }
        }
        if let Some(stats) = self.stats.take() {
            if let Err(err) = self.write_stats(&stats) {
                error!("Failed to write stats page: {:#}", err);
            }
        }
    }

    async fn write_item(&self, item: &IndexItem) -> Result<()> {
        match item {
            IndexItem::Rewrite(package) => {
                let files = self.db.get_package_files(package).await?;
                let dir = self.config.simple_path().join(package);
                fs::create_dir_all(&dir)?;
                atomic_write(
                    &dir.join("index.html"),
                    render_package_index(package, &files).as_bytes(),
                )?;
                self.write_project(package).await?;
            }
            IndexItem::RewriteProject(package) => {
                self.write_project(package).await?;
            }
            IndexItem::RewriteRoot => {
                let packages = self.db.root_listing().await?;
                let body = render_root(&packages);
                let target = self.config.simple_path().join("index.html");
                if !body_changed(&target, body.as_bytes())? {
                    trace!("root index unchanged, skipping write");
                    return Ok(());
                }
                atomic_write(&target, body.as_bytes())?;
                atomic_write(
                    &self.config.output_path.join("packages.json"),
                    render_packages_json(&packages)?.as_bytes(),
                )?;
            }
        }
        Ok(())
    }

    async fn write_project(&self, package: &str) -> Result<()> {
        let project = match self.db.get_project(package).await? {
            Some(project) => project,
            None => return Ok(()),
        };
        let dir = self.config.project_path().join(package);
        fs::create_dir_all(&dir)?;
        atomic_write(
            &dir.join("index.html"),
            render_project(&project).as_bytes(),
        )?;
        Ok(())
    }

    fn write_stats(&self, stats: &StatsSnapshot) -> Result<()> {
        atomic_write(
            &self.config.output_path.join("stats.html"),
            render_stats(stats).as_bytes(),
        )
    }
}

/// Render into a temp file in the target directory, then rename over the
/// destination so readers never see a torn page.
fn atomic_write(target: &Path, body: &[u8]) -> Result<()> {
    let dir = target
        .parent()
        .ok_or_else(|| format_err!("Index target has no parent: {:?}", target))?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(body)?;
    tmp.as_file().sync_all()?;
    tmp.persist(target)
        .with_context(|| format!("Failed to rename index into place: {:?}", target))?;
    Ok(())
}

fn body_changed(target: &Path, body: &[u8]) -> Result<bool> {
    let on_disk = match fs::read(target) {
        Ok(on_disk) => on_disk,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(true),
        Err(err) => return Err(err.into()),
    };
    Ok(Sha256::digest(&on_disk) != Sha256::digest(body))
}

pub fn render_root(packages: &[String]) -> String {
    let mut page = String::new();
    page.push_str("<!DOCTYPE html>\n<html>\n<head><title>Package index</title></head>\n<body>\n");
    for package in packages {
        page.push_str(&format!("<a href=\"{0}/\">{0}</a><br/>\n", package));
    }
    page.push_str("</body>\n</html>\n");
    page
}

pub fn render_package_index(package: &str, files: &[File]) -> String {
    let mut page = String::new();
    page.push_str(&format!(
        "<!DOCTYPE html>\n<html>\n<head><title>Links for {0}</title></head>\n<body>\n<h1>Links for {0}</h1>\n",
        package
    ));
    for file in files {
        page.push_str(&format!(
            "<a href=\"{0}#sha256={1}\">{0}</a><br/>\n",
            file.filename, file.filehash
        ));
    }
    page.push_str("</body>\n</html>\n");
    page
}

pub fn render_project(project: &ProjectData) -> String {
    let mut page = String::new();
    page.push_str(&format!(
        "<!DOCTYPE html>\n<html>\n<head><title>{0}</title></head>\n<body>\n<h1>{0}</h1>\n",
        project.package
    ));
    if !project.skip.is_empty() {
        page.push_str(&format!(
            "<p>Builds disabled: {}</p>\n",
            project.skip
        ));
    }
    for version in &project.versions {
        page.push_str(&format!("<h2>{}</h2>\n", version.version));
        if !version.skip.is_empty() {
            page.push_str(&format!("<p>Skipped: {}</p>\n", version.skip));
        }
        if version.files.is_empty() {
            page.push_str("<p>No wheels built yet.</p>\n");
        } else {
            page.push_str("<ul>\n");
            for file in &version.files {
                page.push_str(&format!(
                    "<li><a href=\"../../simple/{0}/{1}\">{1}</a> ({2})</li>\n",
                    project.package,
                    file.filename,
                    human_size(file.filesize as u64)
                ));
            }
            page.push_str("</ul>\n");
        }
    }
    page.push_str("</body>\n</html>\n");
    page
}

pub fn render_packages_json(packages: &[String]) -> Result<String> {
    Ok(serde_json::to_string(packages)?)
}

pub fn render_stats(stats: &StatsSnapshot) -> String {
    let mut page = String::new();
    page.push_str("<!DOCTYPE html>\n<html>\n<head><title>Build farm statistics</title></head>\n<body>\n<table>\n");
    let rows = [
        ("Packages", stats.packages_count.to_string()),
        ("Packages skipped", stats.packages_skipped.to_string()),
        ("Versions", stats.versions_count.to_string()),
        ("Versions skipped", stats.versions_skipped.to_string()),
        ("Build attempts", stats.builds_count.to_string()),
        ("Successful builds", stats.builds_succeeded.to_string()),
        ("Failed builds", stats.builds_failed.to_string()),
        (
            "Total build time",
            format!("{}s", stats.build_ms_total / 1000),
        ),
        ("Files", stats.files_count.to_string()),
        ("Disk used", human_size(stats.files_bytes.max(0) as u64)),
        ("Downloads", stats.downloads_count.to_string()),
        (
            "Downloads (30 days)",
            stats.downloads_last_month.to_string(),
        ),
    ];
    for (label, value) in rows {
        page.push_str(&format!(
            "<tr><td>{}</td><td>{}</td></tr>\n",
            label, value
        ));
    }
    page.push_str("</table>\n</body>\n</html>\n");
    page
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(filename: &str, hash: &str) -> File {
        File {
            filename: filename.to_string(),
            build_id: 1,
            filesize: 42,
            filehash: hash.to_string(),
            package_tag: "foo".to_string(),
            package_version_tag: "1.0".to_string(),
            py_version_tag: "cp39".to_string(),
            abi_tag: "cp39".to_string(),
            platform_tag: "linux_armv7l".to_string(),
        }
    }

    #[test]
    fn package_index_links_files_with_hash_fragment() {
        let files = vec![file("foo-1.0-cp39-cp39-linux_armv7l.whl", "abc123")];
        let page = render_package_index("foo", &files);
        assert!(page.contains(
            "<a href=\"foo-1.0-cp39-cp39-linux_armv7l.whl#sha256=abc123\">"
        ));
    }

    #[test]
    fn root_index_is_deterministic() {
        let packages = vec!["bar".to_string(), "foo".to_string()];
        assert_eq!(render_root(&packages), render_root(&packages));
        assert!(render_root(&packages).contains("<a href=\"bar/\">bar</a>"));
    }

    #[test]
    fn atomic_write_replaces_content() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("index.html");
        atomic_write(&target, b"one").unwrap();
        atomic_write(&target, b"two").unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"two");
    }

    #[test]
    fn body_changed_detects_identical_content() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("index.html");
        assert!(body_changed(&target, b"page").unwrap());
        atomic_write(&target, b"page").unwrap();
        assert!(!body_changed(&target, b"page").unwrap());
        assert!(body_changed(&target, b"other").unwrap());
    }

    #[test]
    fn rewrite_requests_coalesce_per_target() {
        let mut pending = BTreeSet::new();
        for _ in 0..10 {
            pending.insert(IndexItem::Rewrite("foo".to_string()));
        }
        pending.insert(IndexItem::RewriteRoot);
        assert_eq!(pending.len(), 2);
    }
}
