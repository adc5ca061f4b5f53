use std::fs::create_dir_all;
use std::fs::File;
use std::fs::OpenOptions;
use std::io::Read;
use std::io::Seek;
use std::io::SeekFrom;
use std::path::Path;
use std::path::PathBuf;

use tokio::io::AsyncWriteExt;
use tracing::debug;
use tracing::error;

use crate::errors::path_error;
use crate::Result;

const TAIL_CHUNK: u64 = 4096;

pub fn create_parent_dir_if_not_exist(path: &Path) -> Result<()> {
    if let Some(parent_dir) = path.parent() {
        if !parent_dir.exists() {
            if let Err(e) = create_dir_all(parent_dir) {
                error!("Failed to create directory {:?}: {:?}", parent_dir, e);
                return Err(path_error(parent_dir, e));
            }
        }
    }
    Ok(())
}

pub fn open_file_for_append(path: PathBuf) -> Result<File> {
    create_parent_dir_if_not_exist(&path)?;
    OpenOptions::new()
        .append(true)
        .create(true)
        .open(&path)
        .map_err(|e| path_error(path, e))
}

pub async fn append_into_file(
    path: &Path,
    buf: &[u8],
) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(|e| path_error(parent, e))?;
    }

    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(|e| path_error(path, e))?;
    file.write_all(buf).await.map_err(|e| path_error(path, e))?;
    file.flush().await.map_err(|e| path_error(path, e))?;
    Ok(())
}

/// Last `lines` lines of a text file, read backwards in chunks so large
/// server logs are not loaded whole.
pub fn file_tail(
    path: &Path,
    lines: usize,
) -> Result<Vec<String>> {
    if lines == 0 {
        return Ok(Vec::new());
    }

    let mut file = File::open(path).map_err(|e| path_error(path, e))?;
    let len = file.metadata().map_err(|e| path_error(path, e))?.len();

    let mut pos = len;
    let mut buf: Vec<u8> = Vec::new();
    loop {
        let read = TAIL_CHUNK.min(pos);
        pos -= read;
        file.seek(SeekFrom::Start(pos)).map_err(|e| path_error(path, e))?;
        let mut chunk = vec![0; read as usize];
        file.read_exact(&mut chunk).map_err(|e| path_error(path, e))?;
        chunk.extend_from_slice(&buf);
        buf = chunk;

        // one extra newline guarantees the first kept line is complete
        let newlines = buf.iter().filter(|b| **b == b'\n').count();
        if pos == 0 || newlines > lines {
            break;
        }
    }

    let text = String::from_utf8_lossy(&buf);
    let all: Vec<&str> = text.lines().collect();
    let start = all.len().saturating_sub(lines);
    Ok(all[start..].iter().map(|l| l.to_string()).collect())
}

/// Recursive copy keeping file modes and symlinks.
pub fn copy_dir_all(
    from: &Path,
    to: &Path,
) -> std::io::Result<()> {
    create_dir_all(to)?;
    std::fs::set_permissions(to, std::fs::metadata(from)?.permissions())?;

    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let target = to.join(entry.file_name());
        if file_type.is_dir() {
            copy_dir_all(&entry.path(), &target)?;
        } else if file_type.is_symlink() {
            std::os::unix::fs::symlink(std::fs::read_link(entry.path())?, &target)?;
        } else if file_type.is_file() {
            std::fs::copy(entry.path(), &target)?;
        } else {
            debug!("skipping special file {:?}", entry.path());
        }
    }
    Ok(())
}

pub fn remove_dir_if_exists(path: &Path) -> Result<()> {
    match std::fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(path_error(path, e)),
    }
}
