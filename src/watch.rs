//! Development watcher: poll the source tree, rebuild what changed, and tell
//! connected browsers to reload.
//!
//! Change detection hashes file paths, sizes and modification times per
//! artifact kind; file contents are never read. Rebuilds for one kind are
//! serialized with a per-kind lock so two rebuilds never write the same
//! output path at once.

use crate::error::{MapError, MapResult};
use crate::pipeline::{source_files, ArtifactKind, BuildReport, Pipeline, Task};
use serde::Serialize;
use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, info, warn};

/// Notification pushed to browsers after a successful rebuild.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Reload {
    /// Stylesheets changed; swap them in place.
    Css,
    Full,
}

const KINDS: [ArtifactKind; 4] = [
    ArtifactKind::Style,
    ArtifactKind::Script,
    ArtifactKind::Markup,
    ArtifactKind::Asset,
];

/// Fingerprint of every artifact kind under `src_dir`.
pub fn snapshot(src_dir: &Path) -> MapResult<BTreeMap<ArtifactKind, u64>> {
    let files = source_files(src_dir)?;

    let mut by_kind: BTreeMap<ArtifactKind, Vec<(PathBuf, u64, u128)>> = BTreeMap::new();
    for path in files {
        let Some(kind) = ArtifactKind::of(src_dir, &path) else {
            continue;
        };
        let meta = std::fs::metadata(&path).map_err(|e| MapError::io(&path, e))?;
        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        by_kind.entry(kind).or_default().push((path, meta.len(), mtime));
    }

    Ok(KINDS
        .into_iter()
        .map(|kind| {
            let mut hasher = DefaultHasher::new();
            by_kind.get(&kind).map(Vec::as_slice).unwrap_or(&[]).hash(&mut hasher);
            (kind, hasher.finish())
        })
        .collect())
}

pub fn changed_kinds(
    before: &BTreeMap<ArtifactKind, u64>,
    after: &BTreeMap<ArtifactKind, u64>,
) -> Vec<ArtifactKind> {
    KINDS
        .into_iter()
        .filter(|kind| before.get(kind) != after.get(kind))
        .collect()
}

/// Task to rerun, the kinds whose outputs it writes, and the reload to send.
fn rebuild_plan(kind: ArtifactKind) -> (Task, &'static [ArtifactKind], Reload) {
    match kind {
        ArtifactKind::Style => (Task::Styles, &[ArtifactKind::Style], Reload::Css),
        ArtifactKind::Script => (Task::Scripts, &[ArtifactKind::Script], Reload::Full),
        ArtifactKind::Markup => (
            Task::Markup,
            &[ArtifactKind::Style, ArtifactKind::Script, ArtifactKind::Markup],
            Reload::Full,
        ),
        ArtifactKind::Asset => (Task::Copy, &[ArtifactKind::Asset], Reload::Full),
    }
}

#[derive(Clone)]
pub struct Rebuilder {
    pipeline: Arc<Pipeline>,
    reload: broadcast::Sender<Reload>,
    locks: Arc<BTreeMap<ArtifactKind, Arc<Mutex<()>>>>,
}

impl Rebuilder {
    pub fn new(pipeline: Arc<Pipeline>, reload: broadcast::Sender<Reload>) -> Self {
        let locks = KINDS
            .into_iter()
            .map(|kind| (kind, Arc::new(Mutex::new(()))))
            .collect();
        Self {
            pipeline,
            reload,
            locks: Arc::new(locks),
        }
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    /// Rebuild outputs for `kind`. Compile failures are logged and returned
    /// in the report; they never stop the watcher.
    pub async fn rebuild(&self, kind: ArtifactKind) -> MapResult<BuildReport> {
        let (task, guarded, reload) = rebuild_plan(kind);

        // Always acquired in KINDS order, so overlapping plans cannot deadlock.
        let mut guards = Vec::with_capacity(guarded.len());
        for k in KINDS.into_iter().filter(|k| guarded.contains(k)) {
            let lock = self.locks[&k].clone();
            guards.push(lock.lock_owned().await);
        }

        let pipeline = self.pipeline.clone();
        let report = tokio::task::spawn_blocking(move || pipeline.run(task))
            .await
            .map_err(|e| MapError::Other(anyhow::anyhow!("rebuild task panicked: {e}")))??;
        drop(guards);

        for failure in &report.failures {
            warn!(?kind, "rebuild failure: {failure}");
        }
        if !report.written.is_empty() {
            // No receivers just means no browser is connected.
            let _ = self.reload.send(reload);
            info!(?kind, ?reload, written = report.written.len(), "rebuilt");
        }
        Ok(report)
    }
}

/// Poll the source tree forever, spawning a rebuild for every changed kind.
pub async fn watch(rebuilder: Rebuilder, every: Duration) {
    let src = rebuilder.pipeline().config().src_dir.clone();
    let mut last = match snapshot(&src) {
        Ok(s) => s,
        Err(e) => {
            error!("initial scan of {:?} failed: {e}", src);
            BTreeMap::new()
        }
    };
    info!(dir = ?src, interval_ms = every.as_millis() as u64, "watching for changes");

    let mut ticker = tokio::time::interval(every);
    loop {
        ticker.tick().await;
        let current = match snapshot(&src) {
            Ok(s) => s,
            Err(e) => {
                warn!("scan failed: {e}");
                continue;
            }
        };
        for kind in changed_kinds(&last, &current) {
            debug!(?kind, "change detected");
            let rebuilder = rebuilder.clone();
            tokio::spawn(async move {
                if let Err(e) = rebuilder.rebuild(kind).await {
                    error!(?kind, "rebuild aborted: {e}");
                }
            });
        }
        last = current;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::tests::site;
    use std::fs;

    #[test]
    fn snapshot_detects_edits_per_kind() {
        let (_root, config) = site();
        let before = snapshot(&config.src_dir).unwrap();
        assert_eq!(before, snapshot(&config.src_dir).unwrap());

        fs::write(config.src_dir.join("index.scss"), "h2 { color: red; margin: 0 auto; }\n").unwrap();
        let after = snapshot(&config.src_dir).unwrap();
        assert_eq!(changed_kinds(&before, &after), vec![ArtifactKind::Style]);
    }

    #[test]
    fn snapshot_detects_new_and_removed_files() {
        let (_root, config) = site();
        let before = snapshot(&config.src_dir).unwrap();
        fs::write(config.src_dir.join("assets/extra.json"), "{}").unwrap();
        fs::remove_file(config.src_dir.join("other.js")).unwrap();
        let after = snapshot(&config.src_dir).unwrap();
        assert_eq!(
            changed_kinds(&before, &after),
            vec![ArtifactKind::Script, ArtifactKind::Asset]
        );
    }

    #[tokio::test]
    async fn style_rebuild_sends_css_reload() {
        let (_root, config) = site();
        let dist = config.dist_dir.clone();
        let (tx, mut rx) = broadcast::channel(8);
        let rebuilder = Rebuilder::new(Arc::new(Pipeline::new(config)), tx);

        let report = rebuilder.rebuild(ArtifactKind::Style).await.unwrap();
        assert!(report.is_success());
        assert!(dist.join("index.css").exists());
        assert!(!dist.join("index.html").exists());
        assert_eq!(rx.recv().await.unwrap(), Reload::Css);
    }

    #[tokio::test]
    async fn markup_rebuild_reruns_dependencies() {
        let (_root, config) = site();
        let dist = config.dist_dir.clone();
        let (tx, mut rx) = broadcast::channel(8);
        let rebuilder = Rebuilder::new(Arc::new(Pipeline::new(config)), tx);

        rebuilder.rebuild(ArtifactKind::Markup).await.unwrap();
        assert!(dist.join("index.html").exists());
        assert!(dist.join("index.css").exists());
        assert!(dist.join("index.js").exists());
        assert_eq!(rx.recv().await.unwrap(), Reload::Full);
    }

    #[tokio::test]
    async fn compile_error_is_reported_not_fatal() {
        let (_root, config) = site();
        fs::write(config.src_dir.join("index.scss"), "h2 {\n").unwrap();
        let (tx, _rx) = broadcast::channel(8);
        let rebuilder = Rebuilder::new(Arc::new(Pipeline::new(config.clone())), tx);

        let report = rebuilder.rebuild(ArtifactKind::Style).await.unwrap();
        assert_eq!(report.failures.len(), 1);

        fs::write(config.src_dir.join("index.scss"), "h2 { color: red; }\n").unwrap();
        let report = rebuilder.rebuild(ArtifactKind::Style).await.unwrap();
        assert!(report.is_success());
    }

    #[tokio::test]
    async fn concurrent_rebuilds_of_one_kind_are_serialized() {
        let (_root, config) = site();
        let dist = config.dist_dir.clone();
        let (tx, _rx) = broadcast::channel(16);
        let rebuilder = Rebuilder::new(Arc::new(Pipeline::new(config)), tx);

        let a = rebuilder.clone();
        let b = rebuilder.clone();
        let (ra, rb) = tokio::join!(a.rebuild(ArtifactKind::Style), b.rebuild(ArtifactKind::Markup));
        assert!(ra.unwrap().is_success());
        assert!(rb.unwrap().is_success());
        assert!(fs::read_to_string(dist.join("index.css")).unwrap().contains("text-align"));
    }

    #[tokio::test]
    async fn watcher_picks_up_changes() {
        let (_root, config) = site();
        let dist = config.dist_dir.clone();
        let src = config.src_dir.clone();
        let (tx, mut rx) = broadcast::channel(8);
        let rebuilder = Rebuilder::new(Arc::new(Pipeline::new(config)), tx);

        let handle = tokio::spawn(watch(rebuilder, Duration::from_millis(20)));
        tokio::time::sleep(Duration::from_millis(60)).await;
        fs::write(src.join("fresh.js"), "var fresh = true;\n").unwrap();

        let reload = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reload, Reload::Full);
        assert!(dist.join("fresh.js").exists());
        handle.abort();
    }
}
