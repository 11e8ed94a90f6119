//! inotify-driven scans.
//!
//! Directories with the `inotify` option get a watcher on top of the
//! periodic scan. Events are reduced to the ID of the directory that
//! changed; the generator then scans that directory right away. Only
//! names accepted by the directory's filter file count, so files nobody
//! wants wait for the unknown-file sweep instead of triggering scans.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver};
use std::time::Duration;

use afd_catalog::{filters, first_matching_group, FileGroup};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc as tokio_mpsc;
use tracing::{debug, info, warn};

/// A directory to watch and where its filter file lives
#[derive(Debug, Clone)]
pub struct WatchedDir {
    pub dir_id: u32,
    pub path: PathBuf,
    pub filter_file: PathBuf,
}

struct Watched {
    dir_id: u32,
    /// `None` when the filter file could not be read: every name counts
    groups: Option<Vec<FileGroup>>,
}

pub struct DirWatch {
    #[allow(dead_code)]
    watcher: RecommendedWatcher,
    event_rx: Receiver<Result<Event, notify::Error>>,
    dirs: HashMap<PathBuf, Watched>,
}

impl DirWatch {
    /// Watch every directory; those that cannot be watched are left to
    /// the periodic scan
    pub fn new(dirs: &[WatchedDir]) -> notify::Result<Self> {
        let (tx, rx) = mpsc::channel();
        let mut watcher = RecommendedWatcher::new(
            move |res| {
                let _ = tx.send(res);
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )?;

        let mut watched = HashMap::new();
        for dir in dirs {
            if let Err(e) = watcher.watch(&dir.path, RecursiveMode::NonRecursive) {
                warn!(path = %dir.path.display(), error = %e, "Cannot watch directory");
                continue;
            }
            let groups = match filters::read(&dir.filter_file) {
                Ok(groups) => Some(groups),
                Err(e) => {
                    warn!(filter = %dir.filter_file.display(), error = %e, "No filter file, every name triggers a scan");
                    None
                }
            };
            watched.insert(
                dir.path.clone(),
                Watched {
                    dir_id: dir.dir_id,
                    groups,
                },
            );
        }
        info!(dirs = watched.len(), "Directory watch started");

        Ok(Self {
            watcher,
            event_rx: rx,
            dirs: watched,
        })
    }

    fn dir_of(&self, path: &Path) -> Option<u32> {
        let parent = path.parent()?;
        let name = path.file_name()?.to_string_lossy();
        if name.starts_with('.') {
            return None;
        }
        let dir = self.dirs.get(parent)?;
        match &dir.groups {
            Some(groups) if first_matching_group(groups, &name).is_none() => None,
            _ => Some(dir.dir_id),
        }
    }

    /// Directories with new files since the last call (non-blocking)
    pub fn poll(&self) -> HashSet<u32> {
        let mut changed = HashSet::new();
        while let Ok(result) = self.event_rx.try_recv() {
            match result {
                Ok(event) => {
                    let relevant = matches!(
                        event.kind,
                        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Access(_)
                    );
                    if !relevant {
                        continue;
                    }
                    debug!(?event, "Watch event");
                    changed.extend(event.paths.iter().filter_map(|p| self.dir_of(p)));
                }
                Err(e) => warn!(error = %e, "Directory watch error"),
            }
        }
        changed
    }
}

/// Spawn a task forwarding the IDs of changed directories
pub fn spawn_watch_task(dirs: Vec<WatchedDir>, tx: tokio_mpsc::Sender<u32>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let watch = match DirWatch::new(&dirs) {
            Ok(w) => w,
            Err(e) => {
                warn!(error = %e, "Failed to start directory watch");
                return;
            }
        };

        loop {
            for dir_id in watch.poll() {
                if tx.send(dir_id).await.is_err() {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn watched(dir_id: u32, path: &Path, masks: Option<&[&str]>) -> WatchedDir {
        let filter_file = path.with_extension("filter");
        if let Some(masks) = masks {
            let group = FileGroup::new("g", masks.iter().map(|m| m.to_string()).collect());
            filters::write(&filter_file, &[group]).unwrap();
        }
        WatchedDir {
            dir_id,
            path: path.to_path_buf(),
            filter_file,
        }
    }

    #[tokio::test]
    async fn test_new_file_reports_directory() {
        let temp = tempfile::tempdir().unwrap();
        let dir = temp.path().join("in");
        std::fs::create_dir(&dir).unwrap();
        let (tx, mut rx) = tokio_mpsc::channel(16);
        let handle = spawn_watch_task(vec![watched(0x42, &dir, Some(&["*.bin"]))], tx);
        tokio::time::sleep(Duration::from_millis(200)).await;

        std::fs::write(dir.join("a.bin"), b"data").unwrap();
        let got = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap();
        assert_eq!(got, Some(0x42));
        handle.abort();
    }

    #[test]
    fn test_names_are_checked_against_filter_file() {
        let temp = tempfile::tempdir().unwrap();
        let (a, b) = (temp.path().join("a"), temp.path().join("b"));
        std::fs::create_dir(&a).unwrap();
        std::fs::create_dir(&b).unwrap();
        let watch = DirWatch::new(&[watched(7, &a, Some(&["*.bin", "!x*"])), watched(8, &b, None)]).unwrap();

        assert_eq!(watch.dir_of(&a.join("data.bin")), Some(7));
        assert_eq!(watch.dir_of(&a.join("notes.txt")), None);
        assert_eq!(watch.dir_of(&a.join(".h1")), None);
        // no filter file: every visible name counts
        assert_eq!(watch.dir_of(&b.join("notes.txt")), Some(8));
        assert_eq!(watch.dir_of(Path::new("/elsewhere/x")), None);
    }
}
