//! Map files consumed by `map_str`, `map_beg`, `map_end` and `map_reg`
//! lookups in the generated configuration.

use crate::instance::Instance;
use crate::runtime::{BUFFER_SIZE, RuntimeClient, RuntimeError};
use haproxy_ingress_core::io::atomic_write;
use haproxy_ingress_core::utils::content_hash;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, error};

pub const MAP_HOST: &str = "host";
pub const MAP_HOST_END: &str = "host-end";
pub const MAP_PATH_EXACT: &str = "path-exact";
pub const MAP_PATH_PREFIX: &str = "path-prefix";
pub const MAP_PATH_REGEX: &str = "path-reg";
pub const MAP_SNI: &str = "sni";

/// Maps referenced by base rules, kept on disk even when empty.
pub const PERSISTENT_MAPS: [&str; 6] = [
    MAP_HOST,
    MAP_HOST_END,
    MAP_PATH_EXACT,
    MAP_PATH_PREFIX,
    MAP_PATH_REGEX,
    MAP_SNI,
];

/// Formats a map row; HAProxy splits key and value on whitespace.
pub fn row(key: &str, value: &str) -> String {
    format!("{key}\t\t\t{value}")
}

#[derive(Default, Debug)]
struct MapFile {
    rows: Vec<String>,
    hash: Option<String>,
    persistent: bool,
}

impl MapFile {
    /// Sorted content split in chunks below the runtime buffer size.
    fn content(&mut self) -> (Vec<String>, String) {
        self.rows.sort();
        self.rows.dedup();
        let mut chunks = Vec::new();
        let mut chunk = String::new();
        for row in &self.rows {
            if chunk.len() + row.len() >= BUFFER_SIZE {
                chunks.push(std::mem::take(&mut chunk));
            }
            chunk.push_str(row);
            chunk.push('\n');
        }
        if !chunk.is_empty() {
            chunks.push(chunk);
        }
        let hash = content_hash(chunks.concat());
        (chunks, hash)
    }
}

#[derive(Debug)]
pub struct Maps {
    dir: PathBuf,
    files: BTreeMap<String, MapFile>,
}

impl Maps {
    pub fn new(dir: impl Into<PathBuf>, persistent: &[&str]) -> Self {
        let files = persistent
            .iter()
            .map(|name| {
                (
                    (*name).to_string(),
                    MapFile {
                        persistent: true,
                        ..MapFile::default()
                    },
                )
            })
            .collect();
        Self {
            dir: dir.into(),
            files,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.map"))
    }

    pub fn append(&mut self, name: &str, row: String) {
        if row.is_empty() {
            return;
        }
        self.files.entry(name.to_string()).or_default().rows.push(row);
    }

    /// True when the map exists and has at least one row.
    pub fn exists(&self, name: &str) -> bool {
        self.files.get(name).is_some_and(|file| !file.rows.is_empty())
    }

    pub fn rows(&self, name: &str) -> &[String] {
        self.files.get(name).map_or(&[], |file| file.rows.as_slice())
    }

    /// Empties every map ahead of a new pass.
    pub fn clean(&mut self) {
        for file in self.files.values_mut() {
            file.rows.clear();
        }
    }

    /// Writes changed maps and pushes them through the runtime. A map HAProxy
    /// has not loaded yet, or a failed runtime update, requires a reload.
    pub async fn refresh(&mut self, runtime: &RuntimeClient, instance: &mut Instance) {
        let dir = self.dir.clone();
        let mut removed = Vec::new();
        for (name, file) in &mut self.files {
            let (chunks, hash) = file.content();
            if file.hash.as_deref() == Some(hash.as_str()) {
                continue;
            }
            let path = dir.join(format!("{name}.map"));
            if chunks.is_empty() && !file.persistent {
                if let Err(err) = std::fs::remove_file(&path) {
                    error!("unable to remove map file {}: {err}", path.display());
                }
                removed.push(name.clone());
                continue;
            }
            if let Err(err) = atomic_write(&path, chunks.concat().as_bytes()) {
                error!("unable to write map file {}: {err}", path.display());
                continue;
            }
            file.hash = Some(hash);
            let path = path.to_string_lossy();
            match runtime.set_map_content(&path, &chunks).await {
                Ok(()) => debug!(map = %name, "Map updated through runtime"),
                Err(RuntimeError::MapNotFound(_)) => {
                    instance.reload(format!("Map file {name} created"));
                }
                Err(err) => {
                    instance.reload(format!("Runtime update of map file '{name}' failed : {err}"));
                }
            }
        }
        for name in removed {
            self.files.remove(&name);
        }
    }
}
