use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tracing::{debug, info};

/// What a change of the auxiliary configuration file requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuxChange {
    None,
    Reload,
    Restart,
}

/// Tracks the modification time of the auxiliary configuration file. A
/// missing file counts as mtime 0.
#[derive(Debug)]
pub struct AuxConfig {
    path: PathBuf,
    mtime: u128,
}

impl AuxConfig {
    /// Starts from an absent file so that a file present at startup is
    /// picked up by the first check.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            mtime: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn in_use(&self) -> bool {
        self.mtime != 0
    }

    /// Compares the file with the last observation. Appearing and
    /// disappearing change the HAProxy command line, so they restart.
    pub fn check(&mut self) -> AuxChange {
        let mtime = modified(&self.path);
        if mtime == self.mtime {
            return AuxChange::None;
        }
        let previous = std::mem::replace(&mut self.mtime, mtime);
        if previous == 0 {
            info!("Auxiliary configuration '{}' detected", self.path.display());
            AuxChange::Restart
        } else if mtime == 0 {
            info!("Auxiliary configuration '{}' removed", self.path.display());
            AuxChange::Restart
        } else {
            debug!("Auxiliary configuration '{}' modified", self.path.display());
            AuxChange::Reload
        }
    }
}

fn modified(path: &Path) -> u128 {
    std::fs::metadata(path)
        .and_then(|metadata| metadata.modified())
        .ok()
        .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
        .map_or(0, |since| since.as_nanos().max(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assertables::assert_ok;
    use std::fs::File;
    use std::time::{Duration, SystemTime};
    use tempfile::tempdir;

    fn touch(path: &Path, seconds: u64) {
        assert_ok!(std::fs::write(path, "global\n"));
        let file = assert_ok!(File::options().write(true).open(path));
        assert_ok!(file.set_modified(SystemTime::UNIX_EPOCH + Duration::from_secs(seconds)));
    }

    #[test]
    fn test_transitions() {
        let dir = assert_ok!(tempdir());
        let path = dir.path().join("aux.cfg");
        let mut aux = AuxConfig::new(&path);

        assert_eq!(aux.check(), AuxChange::None);
        assert!(!aux.in_use());

        touch(&path, 1000);
        assert_eq!(aux.check(), AuxChange::Restart);
        assert!(aux.in_use());
        assert_eq!(aux.check(), AuxChange::None);

        touch(&path, 2000);
        assert_eq!(aux.check(), AuxChange::Reload);
        assert_eq!(aux.check(), AuxChange::None);

        assert_ok!(std::fs::remove_file(&path));
        assert_eq!(aux.check(), AuxChange::Restart);
        assert!(!aux.in_use());
        assert_eq!(aux.check(), AuxChange::None);
    }
}
