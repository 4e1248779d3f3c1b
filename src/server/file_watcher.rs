//! Native file watcher feeding the reload broadcaster
//!
//! notify delivers raw events on its own thread; they are forwarded into a
//! single tokio task that filters, coalesces and hands each surviving change
//! to the `on_change` callback in arrival order.

use globset::{Glob, GlobSet, GlobSetBuilder};
use notify::event::{ModifyKind, RenameMode};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Window in which repeated events for one path collapse into one
const COALESCE_WINDOW: Duration = Duration::from_millis(100);

/// Decides which changed paths are worth a reload
#[derive(Debug, Clone)]
pub struct WatchFilter {
    root: PathBuf,
    canonical_root: Option<PathBuf>,
    include: Option<GlobSet>,
    exclude: GlobSet,
}

impl WatchFilter {
    pub fn new(
        root: &Path,
        watch_patterns: &[String],
        ignore_patterns: &[String],
    ) -> Result<Self, globset::Error> {
        let include = if watch_patterns.is_empty() {
            None
        } else {
            Some(build_glob_set(watch_patterns)?)
        };

        Ok(Self {
            root: root.to_path_buf(),
            canonical_root: root.canonicalize().ok(),
            include,
            exclude: build_glob_set(ignore_patterns)?,
        })
    }

    /// Path relative to the watched root, `/`-separated
    pub fn relative_path(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.root).ok().or_else(|| {
            self.canonical_root
                .as_ref()
                .and_then(|root| path.strip_prefix(root).ok())
        })?;

        let parts: Vec<String> = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        if parts.is_empty() {
            return None;
        }
        Some(parts.join("/"))
    }

    /// Whether a relative path passes the include and ignore sets
    pub fn allows(&self, relative: &str) -> bool {
        if self.exclude.is_match(relative) {
            return false;
        }
        match &self.include {
            Some(include) => include.is_match(relative),
            None => true,
        }
    }
}

/// A bare name like `node_modules` also covers everything beneath it, at any depth
fn build_glob_set(patterns: &[String]) -> Result<GlobSet, globset::Error> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let pattern = pattern.trim().trim_end_matches('/');
        if pattern.is_empty() {
            continue;
        }
        builder.add(Glob::new(pattern)?);
        builder.add(Glob::new(&format!("{}/**", pattern))?);
        if !pattern.contains('/') {
            builder.add(Glob::new(&format!("**/{}", pattern))?);
            builder.add(Glob::new(&format!("**/{}/**", pattern))?);
        }
    }
    builder.build()
}

/// What a raw notify event means for the reload pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChangeKind {
    Modified,
    Added,
    Removed,
    Other,
}

fn classify(kind: &EventKind) -> ChangeKind {
    match kind {
        EventKind::Modify(ModifyKind::Metadata(_)) => ChangeKind::Other,
        // Moved out of the tree or renamed away
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => ChangeKind::Removed,
        EventKind::Modify(_) => ChangeKind::Modified,
        EventKind::Create(_) => ChangeKind::Added,
        EventKind::Remove(_) => ChangeKind::Removed,
        _ => ChangeKind::Other,
    }
}

/// Running recursive watch over the project root
pub struct FileWatcher {
    root: PathBuf,
    watcher: RecommendedWatcher,
    task: JoinHandle<()>,
}

impl FileWatcher {
    /// Start watching `filter`'s root; `on_change` receives relative paths
    pub fn start<F>(filter: WatchFilter, on_change: F) -> Result<Self, notify::Error>
    where
        F: Fn(&str) + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<Event>();

        let mut watcher = RecommendedWatcher::new(
            move |res: Result<Event, notify::Error>| match res {
                Ok(event) => {
                    let _ = tx.send(event);
                }
                Err(e) => log::warn!("File watcher error: {}", e),
            },
            Config::default().with_poll_interval(Duration::from_millis(200)),
        )?;
        watcher.watch(&filter.root, RecursiveMode::Recursive)?;

        let root = filter.root.clone();
        log::info!("Watching {} for changes", root.display());

        let task = tokio::spawn(async move {
            let mut last_seen: HashMap<String, Instant> = HashMap::new();
            while let Some(event) = rx.recv().await {
                handle_event(&filter, &mut last_seen, event, &on_change);
            }
            log::debug!("File watcher task finished");
        });

        Ok(Self {
            root,
            watcher,
            task,
        })
    }

    /// Stop watching; pending events are discarded
    pub fn stop(mut self) {
        if let Err(e) = self.watcher.unwatch(&self.root) {
            log::debug!("Failed to unwatch root: {}", e);
        }
        self.task.abort();
        log::debug!("File watcher stopped");
    }
}

fn handle_event<F>(
    filter: &WatchFilter,
    last_seen: &mut HashMap<String, Instant>,
    event: Event,
    on_change: &F,
) where
    F: Fn(&str),
{
    let kind = classify(&event.kind);
    if kind == ChangeKind::Other {
        return;
    }

    // A completed rename carries [from, to]; only the destination has new content
    let paths = match event.kind {
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            event.paths.get(1..).unwrap_or(&[])
        }
        _ => &event.paths[..],
    };

    for path in paths {
        let Some(relative) = filter.relative_path(path) else {
            continue;
        };
        if !filter.allows(&relative) {
            log::trace!("Ignoring change to {}", relative);
            continue;
        }

        match kind {
            ChangeKind::Added => log::debug!("File added: {}", relative),
            ChangeKind::Removed => log::debug!("File removed: {}", relative),
            ChangeKind::Modified => {
                if path.is_dir() {
                    continue;
                }
                let now = Instant::now();
                if let Some(last) = last_seen.get(&relative) {
                    if now.duration_since(*last) < COALESCE_WINDOW {
                        log::trace!("Coalescing change to {}", relative);
                        continue;
                    }
                }
                last_seen.retain(|_, seen| now.duration_since(*seen) < COALESCE_WINDOW);
                last_seen.insert(relative.clone(), now);
                log::info!("File changed: {}", relative);
                on_change(&relative);
            }
            ChangeKind::Other => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, DataChange, MetadataKind, RemoveKind};
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    fn filter(root: &Path, watch: &[&str], ignore: &[&str]) -> WatchFilter {
        let watch: Vec<String> = watch.iter().map(|s| s.to_string()).collect();
        let ignore: Vec<String> = ignore.iter().map(|s| s.to_string()).collect();
        WatchFilter::new(root, &watch, &ignore).unwrap()
    }

    fn modify(path: PathBuf) -> Event {
        Event::new(EventKind::Modify(ModifyKind::Data(DataChange::Content))).add_path(path)
    }

    #[test]
    fn test_relative_path_uses_forward_slashes() {
        let f = filter(Path::new("/srv/site"), &[], &[]);
        assert_eq!(
            f.relative_path(Path::new("/srv/site/css/app.css")).as_deref(),
            Some("css/app.css")
        );
        assert_eq!(f.relative_path(Path::new("/elsewhere/a.css")), None);
        assert_eq!(f.relative_path(Path::new("/srv/site")), None);
    }

    #[test]
    fn test_ignore_patterns_cover_nested_directories() {
        let f = filter(Path::new("/srv"), &[], &["node_modules", ".git", "*.log"]);
        assert!(!f.allows("node_modules/react/index.js"));
        assert!(!f.allows("packages/ui/node_modules/x.js"));
        assert!(!f.allows(".git/HEAD"));
        assert!(!f.allows("debug.log"));
        assert!(f.allows("src/main.js"));
    }

    #[test]
    fn test_watch_patterns_restrict() {
        let f = filter(Path::new("/srv"), &["src", "*.html"], &["src/vendor"]);
        assert!(f.allows("src/app.js"));
        assert!(f.allows("index.html"));
        assert!(!f.allows("README.md"));
        assert!(!f.allows("src/vendor/lib.js"));
    }

    #[test]
    fn test_handle_event_coalesces_and_skips_add_remove() {
        let dir = TempDir::new().unwrap();
        let f = filter(dir.path(), &[], &["node_modules"]);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = {
            let seen = seen.clone();
            move |p: &str| seen.lock().unwrap().push(p.to_string())
        };
        let mut last_seen = HashMap::new();

        let file = dir.path().join("app.css");
        handle_event(&f, &mut last_seen, modify(file.clone()), &sink);
        handle_event(&f, &mut last_seen, modify(file.clone()), &sink);
        handle_event(
            &f,
            &mut last_seen,
            Event::new(EventKind::Create(CreateKind::File)).add_path(dir.path().join("new.js")),
            &sink,
        );
        handle_event(
            &f,
            &mut last_seen,
            Event::new(EventKind::Modify(ModifyKind::Metadata(MetadataKind::Any)))
                .add_path(dir.path().join("meta.js")),
            &sink,
        );
        handle_event(
            &f,
            &mut last_seen,
            modify(dir.path().join("node_modules/pkg/index.js")),
            &sink,
        );

        assert_eq!(*seen.lock().unwrap(), vec!["app.css".to_string()]);
    }

    #[test]
    fn test_handle_event_skips_removal_and_rename_away() {
        let dir = TempDir::new().unwrap();
        let f = filter(dir.path(), &[], &[]);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = {
            let seen = seen.clone();
            move |p: &str| seen.lock().unwrap().push(p.to_string())
        };
        let mut last_seen = HashMap::new();

        handle_event(
            &f,
            &mut last_seen,
            Event::new(EventKind::Remove(RemoveKind::File)).add_path(dir.path().join("old.js")),
            &sink,
        );
        handle_event(
            &f,
            &mut last_seen,
            Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::From)))
                .add_path(dir.path().join("gone.css")),
            &sink,
        );
        assert!(seen.lock().unwrap().is_empty());

        std::fs::write(dir.path().join("renamed.css"), "a{}").unwrap();
        handle_event(
            &f,
            &mut last_seen,
            Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Both)))
                .add_path(dir.path().join("draft.css"))
                .add_path(dir.path().join("renamed.css")),
            &sink,
        );
        assert_eq!(*seen.lock().unwrap(), vec!["renamed.css".to_string()]);
    }

    #[test]
    fn test_coalesce_history_is_pruned() {
        let dir = TempDir::new().unwrap();
        let f = filter(dir.path(), &[], &[]);
        let mut last_seen = HashMap::new();

        handle_event(&f, &mut last_seen, modify(dir.path().join("a.css")), &|_: &str| {});
        handle_event(&f, &mut last_seen, modify(dir.path().join("b.css")), &|_: &str| {});
        assert_eq!(last_seen.len(), 2);

        std::thread::sleep(COALESCE_WINDOW + Duration::from_millis(50));
        handle_event(&f, &mut last_seen, modify(dir.path().join("c.css")), &|_: &str| {});
        assert_eq!(last_seen.len(), 1);
        assert!(last_seen.contains_key("c.css"));
    }

    #[tokio::test]
    async fn test_watcher_reports_modification() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("style.css");
        std::fs::write(&file, "a{}").unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let watcher = FileWatcher::start(filter(dir.path(), &[], &[]), move |p| {
            let _ = tx.send(p.to_string());
        })
        .unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        std::fs::write(&file, "b{}").unwrap();

        let changed = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("change should be reported")
            .unwrap();
        assert_eq!(changed, "style.css");

        watcher.stop();
    }
}
