use anyhow::{Context, Result};
use notify::event::ModifyKind;
use notify::{Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, Receiver};
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptChangeKind {
    Modified,
    Removed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptChange {
    pub path: PathBuf,
    pub kind: ScriptChangeKind,
}

/// Watches script roots on a background thread. Changes queue up in a
/// channel and are only read from the dispatch thread via `drain_changes`.
pub struct ScriptWatcher {
    watcher: RecommendedWatcher,
    rx: Receiver<notify::Result<Event>>,
    roots: Vec<PathBuf>,
}

impl ScriptWatcher {
    pub fn new(poll_interval: Duration) -> Result<Self> {
        let (tx, rx) = channel();
        let mut watcher = notify::recommended_watcher(move |res| {
            let _ = tx.send(res);
        })?;
        watcher
            .configure(NotifyConfig::default().with_compare_contents(false).with_poll_interval(poll_interval))
            .context("configure script watcher")?;
        Ok(Self { watcher, rx, roots: Vec::new() })
    }

    pub fn watch_root(&mut self, root: impl AsRef<Path>) -> Result<()> {
        let root = root.as_ref();
        if !root.exists() {
            anyhow::bail!("path '{}' does not exist", root.display());
        }
        let normalized = normalize_watch_path(root);
        if self.roots.contains(&normalized) {
            return Ok(());
        }
        let mode = if normalized.is_dir() { RecursiveMode::Recursive } else { RecursiveMode::NonRecursive };
        self.watcher.watch(&normalized, mode).with_context(|| format!("watch {}", normalized.display()))?;
        self.roots.push(normalized);
        Ok(())
    }

    /// Pending script changes, one entry per path in first-seen order; the
    /// latest kind wins when a path changed more than once.
    pub fn drain_changes(&mut self) -> Vec<ScriptChange> {
        let mut changes: Vec<ScriptChange> = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            let event = match event {
                Ok(event) => event,
                Err(err) => {
                    warn!("script watcher error: {err}");
                    continue;
                }
            };
            if !is_relevant(&event.kind) {
                continue;
            }
            for path in event.paths {
                if !is_script(&path) || !self.is_watched(&path) {
                    continue;
                }
                let kind = classify(&event.kind, &path);
                match changes.iter_mut().find(|change| change.path == path) {
                    Some(existing) => existing.kind = kind,
                    None => changes.push(ScriptChange { path, kind }),
                }
            }
        }
        changes
    }

    fn is_watched(&self, path: &Path) -> bool {
        let normalized = normalize_watch_path(path);
        self.roots.iter().any(|root| normalized.starts_with(root))
    }
}

fn is_script(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "rhai")
}

fn is_relevant(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Modify(ModifyKind::Data(_))
            | EventKind::Modify(ModifyKind::Name(_))
            | EventKind::Modify(ModifyKind::Any)
            | EventKind::Create(_)
            | EventKind::Remove(_)
    )
}

fn classify(kind: &EventKind, path: &Path) -> ScriptChangeKind {
    if matches!(kind, EventKind::Remove(_)) || !path.exists() {
        ScriptChangeKind::Removed
    } else {
        ScriptChangeKind::Modified
    }
}

/// Absolute, symlink-resolved form of `path`. A path that no longer exists
/// (a removed script) resolves through its parent directory instead.
pub(crate) fn normalize_watch_path(path: &Path) -> PathBuf {
    let absolute = match env::current_dir() {
        Ok(cwd) if path.is_relative() => cwd.join(path),
        _ => path.to_path_buf(),
    };
    if let Ok(canonical) = fs::canonicalize(&absolute) {
        return canonical;
    }
    let resolved_parent = absolute.parent().and_then(|parent| fs::canonicalize(parent).ok());
    match (resolved_parent, absolute.file_name()) {
        (Some(parent), Some(name)) => parent.join(name),
        (Some(parent), None) => parent,
        (None, _) => absolute,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, RemoveKind};

    #[test]
    fn only_rhai_files_count_as_scripts() {
        assert!(is_script(Path::new("mods/tick.rhai")));
        assert!(!is_script(Path::new("mods/tick.rhai.swp")));
        assert!(!is_script(Path::new("mods/readme.md")));
    }

    #[test]
    fn removal_events_classify_as_removed() {
        let path = Path::new("/definitely/not/here.rhai");
        assert_eq!(classify(&EventKind::Remove(RemoveKind::File), path), ScriptChangeKind::Removed);
        assert_eq!(classify(&EventKind::Create(CreateKind::File), path), ScriptChangeKind::Removed);
        assert!(!is_relevant(&EventKind::Access(notify::event::AccessKind::Any)));
    }

    #[test]
    fn missing_root_is_rejected() {
        let mut watcher = ScriptWatcher::new(Duration::from_millis(50)).expect("watcher");
        assert!(watcher.watch_root("/definitely/not/a/script/root").is_err());
    }
}
