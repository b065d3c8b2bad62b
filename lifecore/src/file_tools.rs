//! Reading resource files into memory.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use tracing::{debug, error, trace};

use crate::errors::{FileToolsError, FileToolsResult};

/// Read a whole file, or only its first `read_first_bytes` bytes.
///
/// An empty file is an error: no resource is ever zero bytes long.
pub fn read_file_to_buffer(path: &Path, read_first_bytes: Option<u64>) -> FileToolsResult<Vec<u8>> {
    let io_error = |source| FileToolsError::Io {
        path: path.to_path_buf(),
        source,
    };

    let file = File::open(path).map_err(|e| {
        debug!(path = %path.display(), error = %e, "Could not open file");
        io_error(e)
    })?;
    let total = file.metadata().map_err(io_error)?.len();
    if total == 0 {
        error!(path = %path.display(), "Empty file");
        return Err(FileToolsError::Empty(path.to_path_buf()));
    }

    let size = read_first_bytes.map_or(total, |first| first.min(total));
    trace!(path = %path.display(), size, total, "Reading file");

    let mut buffer = Vec::with_capacity(usize::try_from(size).unwrap_or(0));
    file.take(size).read_to_end(&mut buffer).map_err(io_error)?;
    Ok(buffer)
}

/// [`read_file_to_buffer`] on tokio's blocking pool.
pub async fn read_file_to_buffer_async(
    path: PathBuf,
    read_first_bytes: Option<u64>,
) -> FileToolsResult<Vec<u8>> {
    let task_path = path.clone();
    tokio::task::spawn_blocking(move || read_file_to_buffer(&task_path, read_first_bytes))
        .await
        .map_err(|e| FileToolsError::TaskFailed {
            path,
            reason: e.to_string(),
        })?
}
