//! Filesystem change detection feeding cache invalidation.

use anyhow::{Context, Result};
use log::{debug, info, warn};
use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::cache::QueryCache;
use crate::workspace::is_source_file;

/// Evicts cached answers as soon as a source file changes on disk.
pub struct CacheWatcher {
    _watcher: RecommendedWatcher,
    task: JoinHandle<()>,
}

impl CacheWatcher {
    pub fn spawn(root: &Path, cache: Arc<QueryCache>) -> Result<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut watcher: RecommendedWatcher = notify::recommended_watcher(move |res| {
            if tx.send(res).is_err() {
                debug!("watcher channel closed");
            }
        })
        .context("failed to create file watcher")?;
        watcher
            .watch(root, RecursiveMode::Recursive)
            .with_context(|| format!("failed to watch {}", root.display()))?;

        let root = root.to_path_buf();
        info!("Watching {} for source changes", root.display());
        let task = tokio::spawn(async move {
            while let Some(res) = rx.recv().await {
                match res {
                    Ok(event) => {
                        let evicted = handle_event(&root, &cache, event);
                        if evicted > 0 {
                            debug!("evicted {evicted} cached answers after file change");
                        }
                    }
                    Err(err) => warn!("watch error: {err}"),
                }
            }
        });
        Ok(Self {
            _watcher: watcher,
            task,
        })
    }
}

impl Drop for CacheWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Returns the number of evicted cache rows.
fn handle_event(root: &Path, cache: &QueryCache, event: Event) -> usize {
    match event.kind {
        EventKind::Modify(ModifyKind::Name(RenameMode::From))
        | EventKind::Modify(ModifyKind::Name(RenameMode::To))
        | EventKind::Remove(_)
        | EventKind::Create(_)
        | EventKind::Modify(_) => event
            .paths
            .into_iter()
            .map(|p| normalize_event_path(root, p))
            .filter(|p| is_source_file(p))
            .map(|p| cache.invalidate_file(&p))
            .sum(),
        _ => {
            debug!("ignoring event {:?}", event.kind);
            0
        }
    }
}

fn normalize_event_path(root: &Path, path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        path
    } else {
        root.join(path)
    }
}
