//! File-backed resources.
//!
//! [`FileBackend`] opens a resource by reading its file into memory and
//! hands the bytes to a [`FileLoader`] to load. Closing drops the buffer.
//! Streamed files are closed together with the unload, since their buffer
//! is only needed while streaming users exist.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::backend::ResourceBackend;
use crate::file_tools::read_file_to_buffer_async;
use crate::resource::{CloseCompletion, LoadCompletion, OpenCompletion, UnloadCompletion};

/// Consumer of file contents, such as an engine taking ownership of a bank.
#[async_trait]
pub trait FileLoader: Send + Sync + 'static {
    /// Load the contents of resource `short_id`.
    async fn load(
        &self,
        short_id: u32,
        data: Arc<[u8]>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;

    /// Unload resource `short_id`. `false` means it is still in use and
    /// the unload should be deferred.
    async fn unload(&self, short_id: u32) -> bool;
}

/// Resource whose open step reads a file from disk.
pub struct FileBackend<L: FileLoader> {
    managing_type: &'static str,
    short_id: u32,
    path: PathBuf,
    read_first_bytes: Option<u64>,
    streamed: bool,
    loader: Arc<L>,
    buffer: Mutex<Option<Arc<[u8]>>>,
}

impl<L: FileLoader> FileBackend<L> {
    /// Back resource `short_id` with the file at `path`.
    pub fn new(managing_type: &'static str, short_id: u32, path: PathBuf, loader: Arc<L>) -> Self {
        Self {
            managing_type,
            short_id,
            path,
            read_first_bytes: None,
            streamed: false,
            loader,
            buffer: Mutex::new(None),
        }
    }

    /// Read only the first `bytes` bytes of the file, as for a streamed
    /// media prefetch.
    #[must_use]
    pub const fn with_read_first_bytes(mut self, bytes: u64) -> Self {
        self.read_first_bytes = Some(bytes);
        self
    }

    /// Mark the resource as streamed.
    #[must_use]
    pub const fn streamed(mut self) -> Self {
        self.streamed = true;
        self
    }

    /// Whether the file contents are currently held in memory.
    pub fn is_buffered(&self) -> bool {
        self.buffer.lock().is_some()
    }
}

impl<L: FileLoader> ResourceBackend for FileBackend<L> {
    fn managing_type_name(&self) -> &'static str {
        self.managing_type
    }

    fn short_id(&self) -> u32 {
        self.short_id
    }

    fn is_streamed(&self) -> bool {
        self.streamed
    }

    fn open(self: Arc<Self>, completion: OpenCompletion) {
        tokio::spawn(async move {
            match read_file_to_buffer_async(self.path.clone(), self.read_first_bytes).await {
                Ok(buffer) => {
                    debug!(
                        resource_type = self.managing_type,
                        short_id = self.short_id,
                        size = buffer.len(),
                        "File opened"
                    );
                    *self.buffer.lock() = Some(Arc::from(buffer));
                    completion.succeeded();
                }
                Err(e) => {
                    warn!(
                        resource_type = self.managing_type,
                        short_id = self.short_id,
                        error = %e,
                        "Could not open file"
                    );
                    completion.failed();
                }
            }
        });
    }

    fn load(self: Arc<Self>, completion: LoadCompletion) {
        let Some(data) = self.buffer.lock().clone() else {
            warn!(
                resource_type = self.managing_type,
                short_id = self.short_id,
                "Loading a file that is not open"
            );
            completion.failed();
            return;
        };

        tokio::spawn(async move {
            match self.loader.load(self.short_id, data).await {
                Ok(()) => completion.succeeded(),
                Err(e) => {
                    warn!(
                        resource_type = self.managing_type,
                        short_id = self.short_id,
                        error = %e,
                        "Loader rejected file"
                    );
                    completion.failed();
                }
            }
        });
    }

    fn unload(self: Arc<Self>, completion: UnloadCompletion) {
        tokio::spawn(async move {
            if !self.loader.unload(self.short_id).await {
                completion.defer();
            } else if self.streamed {
                self.buffer.lock().take();
                completion.done_and_closed();
            } else {
                completion.done();
            }
        });
    }

    fn close(self: Arc<Self>, completion: CloseCompletion) {
        self.buffer.lock().take();
        completion.done();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{LifecycleState, OperationOrigin, ReleaseOutcome, ResourceState};
    use std::io::Write;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    struct RecordingLoader {
        loaded: Mutex<Vec<(u32, Vec<u8>)>>,
        unloads: AtomicU32,
        busy_unloads: AtomicU32,
    }

    #[async_trait]
    impl FileLoader for RecordingLoader {
        async fn load(
            &self,
            short_id: u32,
            data: Arc<[u8]>,
        ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
            self.loaded.lock().push((short_id, data.to_vec()));
            Ok(())
        }

        async fn unload(&self, _short_id: u32) -> bool {
            self.unloads.fetch_add(1, Ordering::SeqCst);
            self.busy_unloads
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_err()
        }
    }

    fn bank_file(contents: &[u8]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents).unwrap();
        file.flush().unwrap();
        file
    }

    #[tokio::test]
    async fn test_file_backed_cycle() {
        let file = bank_file(b"soundbank");
        let loader = Arc::new(RecordingLoader::default());
        let backend = Arc::new(FileBackend::new(
            "SoundBank",
            7,
            file.path().to_path_buf(),
            Arc::clone(&loader),
        ));
        let state = ResourceState::new(Arc::clone(&backend));

        assert!(state.acquire(OperationOrigin::Normal).await);
        assert!(backend.is_buffered());
        assert_eq!(*loader.loaded.lock(), vec![(7, b"soundbank".to_vec())]);

        assert_eq!(
            state.release(OperationOrigin::Normal).await,
            ReleaseOutcome::Deleted
        );
        assert!(!backend.is_buffered());
        assert_eq!(loader.unloads.load(Ordering::SeqCst), 1);
        state.term().await;
    }

    #[tokio::test]
    async fn test_missing_file_fails_acquire() {
        let dir = tempfile::tempdir().unwrap();
        let loader = Arc::new(RecordingLoader::default());
        let backend = Arc::new(FileBackend::new(
            "SoundBank",
            8,
            dir.path().join("missing.bnk"),
            loader,
        ));
        let state = ResourceState::new(backend);

        assert!(!state.acquire(OperationOrigin::Normal).await);
        assert_eq!(
            state.snapshot().await.unwrap().state,
            LifecycleState::Closed
        );
        state.release(OperationOrigin::Normal).await;
        state.term().await;
    }

    #[tokio::test]
    async fn test_streamed_prefetch_unloads_to_closed() {
        let file = bank_file(b"0123456789abcdef");
        let loader = Arc::new(RecordingLoader::default());
        let backend = Arc::new(
            FileBackend::new("Media", 9, file.path().to_path_buf(), Arc::clone(&loader))
                .with_read_first_bytes(4)
                .streamed(),
        );
        let state = ResourceState::new(Arc::clone(&backend));

        assert!(state.acquire(OperationOrigin::Streaming).await);
        assert_eq!(*loader.loaded.lock(), vec![(9, b"0123".to_vec())]);

        assert_eq!(
            state.release(OperationOrigin::Streaming).await,
            ReleaseOutcome::Deleted
        );
        assert!(!backend.is_buffered());
        state.term().await;
    }

    #[tokio::test]
    async fn test_busy_loader_defers_unload() {
        let file = bank_file(b"soundbank");
        let loader = Arc::new(RecordingLoader::default());
        loader.busy_unloads.store(2, Ordering::SeqCst);
        let backend = Arc::new(FileBackend::new(
            "SoundBank",
            10,
            file.path().to_path_buf(),
            Arc::clone(&loader),
        ));
        let state = ResourceState::new(backend);

        assert!(state.acquire(OperationOrigin::Normal).await);
        assert_eq!(
            state.release(OperationOrigin::Normal).await,
            ReleaseOutcome::Deleted
        );
        assert_eq!(loader.unloads.load(Ordering::SeqCst), 3);
        state.term().await;
    }
}
