use crate::sync::signal::{Receiver, Sender, signal};
use notify::{Event, EventHandler, RecommendedWatcher, RecursiveMode, Watcher};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

struct GenerationEventHandler {
    tx: Sender<u64>,
    file_name: Option<OsString>,
    generation: AtomicU64,
}

impl GenerationEventHandler {
    fn matches(&self, event: &Event) -> bool {
        match &self.file_name {
            None => true,
            Some(file_name) => event
                .paths
                .iter()
                .any(|path| path.file_name() == Some(file_name.as_os_str())),
        }
    }
}

impl EventHandler for GenerationEventHandler {
    fn handle_event(&mut self, event: notify::Result<Event>) {
        if let Ok(event) = event {
            debug!("File watcher event: {:?}", event);
            let relevant = event.kind.is_modify() || event.kind.is_create() || event.kind.is_remove();
            if relevant && self.matches(&event) {
                let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
                self.tx.set(generation);
            }
        }
    }
}

/// Keeps the underlying watcher alive. Dropping it stops the notifications.
#[derive(Debug)]
pub struct FileWatcher {
    _watcher: RecommendedWatcher,
    path: PathBuf,
    rx: Receiver<u64>,
}

impl FileWatcher {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn receiver(&self) -> Receiver<u64> {
        self.rx.clone()
    }
}

/// Watches `dir` (non recursively). When `file_name` is given, only events
/// touching that file bump the generation counter.
pub fn spawn_file_watcher<P: AsRef<Path>>(
    dir: P,
    file_name: Option<&str>,
) -> notify::Result<FileWatcher> {
    let (tx, rx) = signal("file_watcher");
    let handler = GenerationEventHandler {
        tx,
        file_name: file_name.map(OsString::from),
        generation: AtomicU64::new(0),
    };

    let mut watcher = notify::recommended_watcher(handler)?;
    watcher.watch(dir.as_ref(), RecursiveMode::NonRecursive)?;

    info!("Started file watcher for: {:?}", dir.as_ref());

    Ok(FileWatcher {
        _watcher: watcher,
        path: dir.as_ref().to_path_buf(),
        rx,
    })
}
