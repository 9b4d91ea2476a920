//! Filesystem primitives for durable state files.
//!
//! Status and result files are read by other processes while being
//! rewritten, so every full-document write goes through a temp file in the
//! same directory followed by a rename. Appends to the event log are single
//! small writes, atomic enough on every platform we target.

use serde::Serialize;
use std::fs;
use std::fs::OpenOptions;
use std::io;
use std::io::Write;
use std::path::Path;
use tracing::warn;

/// Serialize `value` as pretty JSON and atomically replace `path` with it.
///
/// The temp file lives next to the destination so the rename never crosses
/// a filesystem boundary.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> io::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no parent"))?;
    let json = serde_json::to_vec_pretty(value)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("state.json");
    let tmp = parent.join(format!(".{file_name}.tmp"));
    fs::write(&tmp, &json)?;
    match fs::rename(&tmp, path) {
        Ok(()) => Ok(()),
        Err(e) => {
            let _ = fs::remove_file(&tmp);
            Err(e)
        }
    }
}

/// Append one JSON line to `path`, creating the file if needed.
pub fn append_jsonl_line<T: Serialize>(path: &Path, value: &T) -> io::Result<()> {
    let mut line = serde_json::to_vec(value)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    line.push(b'\n');
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(&line)
}

/// Create `dir` (and parents) and verify it is actually readable and
/// writable. Broken ACLs can leave a directory that exists but rejects
/// writes; in that case the directory is removed and created once more
/// before giving up.
pub fn ensure_accessible_dir(dir: &Path) -> io::Result<()> {
    fs::create_dir_all(dir)?;
    match probe_dir(dir) {
        Ok(()) => Ok(()),
        Err(first) => {
            warn!(dir = %dir.display(), error = %first, "directory not accessible, recreating");
            let _ = fs::remove_dir_all(dir);
            fs::create_dir_all(dir)?;
            probe_dir(dir)
        }
    }
}

fn probe_dir(dir: &Path) -> io::Result<()> {
    fs::read_dir(dir)?;
    let probe = dir.join(".overseer-probe");
    fs::write(&probe, b"ok")?;
    fs::remove_file(&probe)
}
