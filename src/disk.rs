use std::fs;
use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use anyhow::bail;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;
use crate::config::DiskOffloadConfig;
use crate::session_id::SessionId;

/// A region in one of the session data files
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct DiskSlice {
    pub file_index: u64,
    pub path: Arc<PathBuf>,
    pub offset: u64,
    pub len: u64,
}

impl DiskSlice {
    pub fn sub_slice(&self, offset: u64, len: u64) -> DiskSlice {
        debug_assert!(offset + len <= self.len);
        DiskSlice {
            file_index: self.file_index,
            path: self.path.clone(),
            offset: self.offset + offset,
            len,
        }
    }
}

struct DataFile {
    path: Arc<PathBuf>,
    num_references: usize,
}

struct CurrentFile {
    index: u64,
    started: Instant,
    next_offset: u64,
}

/// Bookkeeping for session data that lives on disk while a session is active.
///
/// Data goes to a sequence of files `ltp_000000000.bin`, `ltp_000000001.bin`, ... in a directory
///  unique to this engine instance. Regions are appended to the current file, and a new file is
///  started once the current one is older than the configured duration. A file is deleted when it
///  is no longer current and no live session references it.
///
/// Actual I/O is not done here: the engine turns allocations into [DiskOperation]s that are
///  executed asynchronously.
pub struct SessionDataStore {
    directory: PathBuf,
    new_file_duration: Duration,
    current: Option<CurrentFile>,
    files: FxHashMap<u64, DataFile>,
    next_file_index: u64,
    files_to_delete: Vec<Arc<PathBuf>>,
}

impl SessionDataStore {
    pub fn new(config: &DiskOffloadConfig) -> anyhow::Result<SessionDataStore> {
        let directory = config.directory.join(Uuid::new_v4().to_string());
        fs::create_dir_all(&directory)?;
        info!("storing active session data in {:?}", directory);

        Ok(SessionDataStore {
            directory,
            new_file_duration: config.new_file_duration,
            current: None,
            files: FxHashMap::default(),
            next_file_index: 0,
            files_to_delete: Vec::new(),
        })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn file_path(&self, index: u64) -> PathBuf {
        self.directory.join(format!("ltp_{:09}.bin", index))
    }

    /// Reserves a region of `len` bytes. Regions are not written here, and files may be sparse.
    pub fn allocate(&mut self, len: u64, now: Instant) -> DiskSlice {
        let needs_new_file = match &self.current {
            Some(current) => now.duration_since(current.started) >= self.new_file_duration,
            None => true,
        };
        if needs_new_file {
            self.start_new_file(now);
        }

        let current = self.current.as_mut()
            .expect("this is a bug: a current file was just started");
        let index = current.index;
        let offset = current.next_offset;
        current.next_offset += len;

        let file = self.files.get_mut(&index)
            .expect("this is a bug: the current file is always registered");
        file.num_references += 1;
        let path = file.path.clone();

        DiskSlice { file_index: index, path, offset, len }
    }

    fn start_new_file(&mut self, now: Instant) {
        if let Some(previous) = self.current.take() {
            self.delete_if_unreferenced(previous.index);
        }

        let index = self.next_file_index;
        self.next_file_index += 1;
        let path = Arc::new(self.file_path(index));
        debug!("starting session data file {:?}", path);

        self.files.insert(index, DataFile { path, num_references: 0 });
        self.current = Some(CurrentFile { index, started: now, next_offset: 0 });
    }

    /// Adds a reference to the file of a slice that is referenced already
    pub fn retain(&mut self, slice: &DiskSlice) {
        if let Some(file) = self.files.get_mut(&slice.file_index) {
            file.num_references += 1;
        }
    }

    pub fn release(&mut self, slice: &DiskSlice) {
        if let Some(file) = self.files.get_mut(&slice.file_index) {
            file.num_references = file.num_references.saturating_sub(1);
        }
        let is_current = self.current.as_ref().map(|c| c.index) == Some(slice.file_index);
        if !is_current {
            self.delete_if_unreferenced(slice.file_index);
        }
    }

    fn delete_if_unreferenced(&mut self, index: u64) {
        if self.files.get(&index).map(|f| f.num_references) == Some(0) {
            if let Some(file) = self.files.remove(&index) {
                self.files_to_delete.push(file.path);
            }
        }
    }

    /// files that were fully released, to be deleted asynchronously
    pub fn take_files_to_delete(&mut self) -> Vec<Arc<PathBuf>> {
        std::mem::take(&mut self.files_to_delete)
    }

    pub fn num_files(&self) -> usize {
        self.files.len()
    }
}

/// correlates the completion of a disk operation with the session that requested it
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum DiskOperationToken {
    SenderBlockWrite(u64),
    ReceiverSegmentWrite(SessionId),
    ReceiverRedPartRead(SessionId),
    FileDelete,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum DiskOperationKind {
    Write(Bytes),
    Read(u64),
    Delete,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct DiskOperation {
    pub token: DiskOperationToken,
    pub path: Arc<PathBuf>,
    pub offset: u64,
    pub kind: DiskOperationKind,
}

impl DiskOperation {
    pub fn write(token: DiskOperationToken, slice: &DiskSlice, data: Bytes) -> DiskOperation {
        DiskOperation { token, path: slice.path.clone(), offset: slice.offset, kind: DiskOperationKind::Write(data) }
    }

    pub fn read(token: DiskOperationToken, slice: &DiskSlice) -> DiskOperation {
        DiskOperation { token, path: slice.path.clone(), offset: slice.offset, kind: DiskOperationKind::Read(slice.len) }
    }

    pub fn delete(path: Arc<PathBuf>) -> DiskOperation {
        DiskOperation { token: DiskOperationToken::FileDelete, path, offset: 0, kind: DiskOperationKind::Delete }
    }

    /// Reads return the data, writes and deletes `None`
    pub async fn execute(self) -> anyhow::Result<Option<Bytes>> {
        match self.kind {
            DiskOperationKind::Write(data) => {
                write_at(self.path, self.offset, data).await?;
                Ok(None)
            }
            DiskOperationKind::Read(len) => {
                Ok(Some(read_at(self.path, self.offset, len).await?))
            }
            DiskOperationKind::Delete => {
                delete_file(self.path).await?;
                Ok(None)
            }
        }
    }
}

pub async fn write_at(path: Arc<PathBuf>, offset: u64, data: Bytes) -> anyhow::Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path.as_path())
        .await?;
    file.seek(SeekFrom::Start(offset)).await?;
    file.write_all(&data).await?;
    file.flush().await?;
    Ok(())
}

pub async fn read_at(path: Arc<PathBuf>, offset: u64, len: u64) -> anyhow::Result<Bytes> {
    let Ok(len) = usize::try_from(len) else {
        bail!("read of {} bytes exceeds the address space", len);
    };
    let mut file = OpenOptions::new()
        .read(true)
        .open(path.as_path())
        .await?;
    file.seek(SeekFrom::Start(offset)).await?;
    let mut buf = vec![0u8; len];
    file.read_exact(&mut buf).await?;
    Ok(Bytes::from(buf))
}

pub async fn delete_file(path: Arc<PathBuf>) -> anyhow::Result<()> {
    match tokio::fs::remove_file(path.as_path()).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;
    use bytes::Bytes;
    use tokio::time::Instant;
    use crate::config::DiskOffloadConfig;
    use super::*;

    fn store(dir: &tempfile::TempDir) -> SessionDataStore {
        SessionDataStore::new(&DiskOffloadConfig {
            directory: dir.path().to_path_buf(),
            new_file_duration: Duration::from_secs(10),
            threshold_bytes: 0,
        }).unwrap()
    }

    #[test]
    fn test_allocate_appends_to_current_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store(&dir);
        assert!(store.directory().starts_with(dir.path()));
        assert!(store.directory().is_dir());

        let now = Instant::now();
        let a = store.allocate(100, now);
        let b = store.allocate(50, now + Duration::from_secs(1));
        assert_eq!(a.file_index, 0);
        assert_eq!(a.offset, 0);
        assert_eq!(b.file_index, 0);
        assert_eq!(b.offset, 100);
        assert!(a.path.ends_with("ltp_000000000.bin"));
        assert_eq!(store.num_files(), 1);
    }

    #[test]
    fn test_rotation_and_release() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store(&dir);
        let now = Instant::now();

        let a = store.allocate(100, now);
        let b = store.allocate(100, now + Duration::from_secs(10));
        assert_eq!(b.file_index, 1);
        assert_eq!(b.offset, 0);
        assert_eq!(store.num_files(), 2);

        // the old file is deleted once its last region is released
        assert!(store.take_files_to_delete().is_empty());
        store.release(&a);
        assert_eq!(store.take_files_to_delete(), vec![a.path.clone()]);

        // the current file is kept even without references
        store.release(&b);
        assert!(store.take_files_to_delete().is_empty());

        // ... until a new file is started
        let _c = store.allocate(10, now + Duration::from_secs(20));
        assert_eq!(store.take_files_to_delete(), vec![b.path.clone()]);
        assert_eq!(store.num_files(), 1);
    }

    #[test]
    fn test_retained_file_outlives_its_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store(&dir);
        let now = Instant::now();

        let a = store.allocate(100, now);
        let packet_data = a.sub_slice(0, 10);
        store.retain(&packet_data);
        store.release(&a);
        let _b = store.allocate(100, now + Duration::from_secs(10));
        assert!(store.take_files_to_delete().is_empty());

        store.release(&packet_data);
        assert_eq!(store.take_files_to_delete(), vec![a.path.clone()]);
    }

    #[tokio::test]
    async fn test_deleting_a_missing_file_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        assert!(delete_file(Arc::new(dir.path().join("missing.bin"))).await.is_ok());
    }

    #[test]
    fn test_sub_slice() {
        let slice = DiskSlice { file_index: 3, path: Arc::new("x".into()), offset: 100, len: 50 };
        let sub = slice.sub_slice(10, 20);
        assert_eq!(sub.offset, 110);
        assert_eq!(sub.len, 20);
        assert_eq!(sub.file_index, 3);
    }

    #[tokio::test]
    async fn test_write_read_delete() {
        let dir = tempfile::tempdir().unwrap();
        let path = Arc::new(dir.path().join("data.bin"));

        write_at(path.clone(), 10, Bytes::from_static(b"world")).await.unwrap();
        write_at(path.clone(), 0, Bytes::from_static(b"hello")).await.unwrap();
        assert_eq!(read_at(path.clone(), 10, 5).await.unwrap().as_ref(), b"world");
        assert_eq!(read_at(path.clone(), 0, 5).await.unwrap().as_ref(), b"hello");
        assert!(read_at(path.clone(), 12, 10).await.is_err());

        let op = DiskOperation::delete(path.clone());
        assert_eq!(op.execute().await.unwrap(), None);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_execute_read_and_write() {
        let dir = tempfile::tempdir().unwrap();
        let slice = DiskSlice { file_index: 0, path: Arc::new(dir.path().join("x.bin")), offset: 7, len: 3 };

        let write = DiskOperation::write(DiskOperationToken::SenderBlockWrite(1), &slice, Bytes::from_static(b"abc"));
        assert_eq!(write.execute().await.unwrap(), None);
        let read = DiskOperation::read(DiskOperationToken::FileDelete, &slice);
        assert_eq!(read.execute().await.unwrap(), Some(Bytes::from_static(b"abc")));
    }
}
