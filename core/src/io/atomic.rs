use std::fs;
use std::io::{self, Write};
use std::path::Path;
use tempfile::NamedTempFile;
use tracing::trace;

/// Writes `contents` to `path` through a sibling temporary file and a rename,
/// so readers never observe a partially written file.
pub fn atomic_write<P: AsRef<Path>>(path: P, contents: &[u8]) -> io::Result<()> {
    let path = path.as_ref();
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir)?;

    let mut file = NamedTempFile::new_in(dir)?;
    file.write_all(contents)?;
    file.as_file().sync_all()?;
    file.persist(path).map_err(|err| err.error)?;

    trace!(path = %path.display(), bytes = contents.len(), "Atomically wrote file");
    Ok(())
}

/// Like [`atomic_write`], but skips the write when the file already holds
/// `contents`. Returns whether the file changed.
pub fn write_if_changed<P: AsRef<Path>>(path: P, contents: &[u8]) -> io::Result<bool> {
    let path = path.as_ref();
    match fs::read(path) {
        Ok(existing) if existing == contents => Ok(false),
        Ok(_) => atomic_write(path, contents).map(|()| true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            atomic_write(path, contents).map(|()| true)
        }
        Err(err) => Err(err),
    }
}
