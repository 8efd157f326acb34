use haproxy_ingress_core::io::write_if_changed;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::{debug, error, warn};

/// A directory whose files mirror the entries of a config map.
#[derive(Debug)]
pub(crate) struct ManagedFiles {
    kind: &'static str,
    dir: PathBuf,
    names: BTreeSet<String>,
}

fn valid_name(name: &str) -> bool {
    !name.is_empty() && !name.contains('/') && name != "." && name != ".."
}

impl ManagedFiles {
    pub fn new(kind: &'static str, dir: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            dir: dir.into(),
            names: BTreeSet::new(),
        }
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn names(&self) -> &BTreeSet<String> {
        &self.names
    }

    /// Writes every entry and removes the files of entries that are gone.
    /// Returns true when a file was created, modified or deleted.
    pub fn sync<'a>(&mut self, entries: impl IntoIterator<Item = (&'a str, &'a str)>) -> bool {
        let mut changed = false;
        let mut seen = BTreeSet::new();
        for (name, content) in entries {
            if !valid_name(name) {
                warn!("ignoring {} '{name}': invalid file name", self.kind);
                continue;
            }
            let path = self.dir.join(name);
            match write_if_changed(&path, content.as_bytes()) {
                Ok(true) => {
                    debug!("{} '{name}' updated", self.kind);
                    changed = true;
                }
                Ok(false) => {}
                Err(err) => {
                    error!("unable to write {} {}: {err}", self.kind, path.display());
                    continue;
                }
            }
            seen.insert(name.to_string());
        }

        for stale in self.names.difference(&seen) {
            let path = self.dir.join(stale);
            match std::fs::remove_file(&path) {
                Ok(()) => {
                    debug!("{} '{stale}' deleted", self.kind);
                    changed = true;
                }
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => changed = true,
                Err(err) => error!("unable to remove {} {}: {err}", self.kind, path.display()),
            }
        }
        self.names = seen;
        changed
    }
}

/// Borrowed `(name, content)` view of config map data.
pub(crate) fn entries(data: &BTreeMap<String, String>) -> impl Iterator<Item = (&str, &str)> {
    data.iter().map(|(name, content)| (name.as_str(), content.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assertables::{assert_ok, assert_ok_eq_x};
    use rstest::rstest;
    use tempfile::tempdir;

    #[test]
    fn test_sync_tracks_changes() {
        let dir = assert_ok!(tempdir());
        let mut files = ManagedFiles::new("pattern file", dir.path());

        assert!(files.sync([("ips", "10.0.0.0/8\n"), ("hosts", "example.com\n")]));
        assert_ok_eq_x!(&std::fs::read_to_string(files.path("ips")), "10.0.0.0/8\n");
        assert!(!files.sync([("ips", "10.0.0.0/8\n"), ("hosts", "example.com\n")]));

        assert!(files.sync([("ips", "192.168.0.0/16\n")]));
        assert!(!files.path("hosts").exists());
        assert_eq!(files.names().iter().collect::<Vec<_>>(), ["ips"]);

        assert!(files.sync([]));
        assert!(!files.path("ips").exists());
        assert!(!files.sync([]));
    }

    #[rstest]
    #[case("ok", true)]
    #[case("", false)]
    #[case("..", false)]
    #[case("../etc/passwd", false)]
    #[case("a/b", false)]
    fn test_file_names(#[case] name: &str, #[case] valid: bool) {
        assert_eq!(valid_name(name), valid);
    }

    #[test]
    fn test_invalid_names_are_skipped() {
        let dir = assert_ok!(tempdir());
        let mut files = ManagedFiles::new("error file", dir.path().join("errorfiles"));
        assert_ok!(std::fs::create_dir_all(files.dir()));
        assert!(!files.sync([("../escape", "x")]));
        assert!(files.names().is_empty());
        assert!(!dir.path().join("escape").exists());
    }
}
