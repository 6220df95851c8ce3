use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use core_types::MacroVersion;
use lock_order::{LockLevel, LockOrderRegistry, OrderedMutex};
use tokio::task::JoinHandle;

use crate::registry::{MacroRegistry, ReloadError};

const EXTENSIONS: [&str; 2] = ["macro", "txt"];

#[derive(Debug)]
pub struct WatchOutcome {
    pub name: String,
    pub path: PathBuf,
    pub result: Result<MacroVersion, ReloadError>,
}

/// Polls a directory and reloads macro files whose modification time changed.
/// The file stem is the macro name.
pub struct MacroDirWatcher {
    dir: PathBuf,
    registry: Arc<MacroRegistry>,
    // Held for a whole pass so concurrent scans never reload the same file twice.
    seen: OrderedMutex<HashMap<PathBuf, SystemTime>>,
}

impl MacroDirWatcher {
    pub fn new(
        dir: impl Into<PathBuf>,
        registry: Arc<MacroRegistry>,
        locks: &LockOrderRegistry,
    ) -> Self {
        Self {
            dir: dir.into(),
            registry,
            seen: OrderedMutex::new(LockLevel::Auxiliary, "macro.watch_index", locks, HashMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// One pass over the directory. Blocking; reloads may wait behind running executions.
    pub fn scan(&self) -> Vec<WatchOutcome> {
        let mut seen = self.seen.lock();
        let read = match fs::read_dir(&self.dir) {
            Ok(read) => read,
            Err(err) => {
                tracing::warn!(dir = %self.dir.display(), error = %err, "macro dir unreadable");
                return Vec::new();
            }
        };

        let mut outcomes = Vec::new();
        for item in read.flatten() {
            let path = item.path();
            let Some(name) = macro_name(&path) else {
                continue;
            };
            let Ok(modified) = item.metadata().and_then(|m| m.modified()) else {
                continue;
            };
            if seen.get(&path) == Some(&modified) {
                continue;
            }
            let text = match fs::read_to_string(&path) {
                Ok(text) => text,
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "macro file unreadable");
                    continue;
                }
            };
            let result = self.registry.reload(&name, &text);
            // Syntax errors wait for the file to change; a reload that timed out behind
            // running executions is retried on the next pass.
            if !matches!(result, Err(ReloadError::TimedOut { .. })) {
                seen.insert(path.clone(), modified);
            }
            outcomes.push(WatchOutcome { name, path, result });
        }
        outcomes
    }

    /// Polls every `interval` on the blocking pool and hands each reload outcome to `on_outcome`.
    pub fn spawn<F>(self: Arc<Self>, interval: Duration, on_outcome: F) -> JoinHandle<()>
    where
        F: Fn(&WatchOutcome) + Send + Sync + 'static,
    {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let watcher = self.clone();
                match tokio::task::spawn_blocking(move || watcher.scan()).await {
                    Ok(outcomes) => outcomes.iter().for_each(&on_outcome),
                    Err(err) => {
                        tracing::error!(error = %err, "macro watcher pass panicked; stopping");
                        return;
                    }
                }
            }
        })
    }
}

fn macro_name(path: &Path) -> Option<String> {
    let ext = path.extension()?.to_str()?;
    if !EXTENSIONS.contains(&ext) {
        return None;
    }
    path.file_stem()?.to_str().map(str::to_string)
}
