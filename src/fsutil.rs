// ABOUTME: Atomic file replacement
//
// Writes go to a temporary file in the destination directory, are flushed and
// synced, then renamed over the target. If anything fails the temporary file is
// removed when it drops, and the previous contents of the target stay intact.

use std::io::{self, Write};
use std::path::Path;
use tempfile::NamedTempFile;
use tracing::trace;

/// Atomically replace `path` with `contents`.
pub fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;

    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(contents)?;
    tmp.flush()?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;

    trace!(path = %path.display(), bytes = contents.len(), "Atomic write complete");
    Ok(())
}
