//! Disk-backed key→blob cache with asynchronous write-back.
//!
//! Writes are registered in an in-memory staging overlay and applied by a
//! single writer task, so `get` observes a `put` immediately while the file
//! write happens in the background. A periodic sweep enforces the size and
//! count limits, evicting from the least recently used end.
//!
//! The on-disk layout is one regular file per entry, named by the SHA-1 hex
//! of the key. File modification time is the recency signal; there is no
//! index, no sidecars and no format promise beyond opaque blobs.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use bytes::Bytes;
use sha1::{Digest, Sha1};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::cache::DataCaching;

pub type FilenameGenerator = Box<dyn Fn(&str) -> String + Send + Sync>;

/// Limits and policy for a [`DiskCache`].
pub struct DiskCacheConfig {
    pub path: PathBuf,
    pub size_limit: u64,
    pub count_limit: usize,
    /// Fraction of each limit the sweep trims down to (and the threshold at
    /// which it starts working).
    pub trim_ratio: f64,
    pub sweep_interval: Duration,
    pub filename_generator: FilenameGenerator,
}

impl DiskCacheConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            size_limit: 100 * 1024 * 1024,
            count_limit: 1000,
            trim_ratio: 0.7,
            sweep_interval: Duration::from_secs(30),
            filename_generator: Box::new(sha1_filename),
        }
    }
}

fn sha1_filename(key: &str) -> String {
    hex::encode(Sha1::digest(key.as_bytes()))
}

#[derive(Clone)]
enum StagedKind {
    Add(Bytes),
    Remove,
}

struct StagedChange {
    id: u64,
    kind: StagedKind,
}

#[derive(Default)]
struct Staging {
    changes: HashMap<String, StagedChange>,
    remove_all_id: Option<u64>,
    next_id: u64,
}

impl Staging {
    fn next_change_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

enum WriteOp {
    Store {
        key: String,
        filename: String,
        data: Bytes,
        change_id: u64,
    },
    Remove {
        key: String,
        filename: String,
        change_id: u64,
    },
    RemoveAll {
        change_id: u64,
    },
    Flush(oneshot::Sender<()>),
    Sweep,
}

/// Asynchronous write-back blob store. Construct inside a tokio runtime.
pub struct DiskCache {
    path: PathBuf,
    filename_generator: FilenameGenerator,
    staging: Arc<Mutex<Staging>>,
    /// Serializes raw file reads with the writer to prevent torn reads.
    io_lock: Arc<Mutex<()>>,
    writer: mpsc::UnboundedSender<WriteOp>,
    sweep_task: tokio::task::JoinHandle<()>,
}

impl DiskCache {
    pub fn new(config: DiskCacheConfig) -> std::io::Result<Self> {
        fs::create_dir_all(&config.path)?;

        let staging = Arc::new(Mutex::new(Staging::default()));
        let io_lock = Arc::new(Mutex::new(()));
        let (writer, rx) = mpsc::unbounded_channel();

        tokio::spawn(writer_loop(
            rx,
            config.path.clone(),
            Arc::clone(&staging),
            Arc::clone(&io_lock),
            SweepPolicy {
                size_limit: config.size_limit,
                count_limit: config.count_limit,
                trim_ratio: config.trim_ratio,
            },
        ));

        // First sweep right away, then on the configured period.
        let ticker_writer = writer.clone();
        let interval = config.sweep_interval;
        let sweep_task = tokio::spawn(async move {
            loop {
                if ticker_writer.send(WriteOp::Sweep).is_err() {
                    break;
                }
                tokio::time::sleep(interval).await;
            }
        });

        Ok(Self {
            path: config.path,
            filename_generator: config.filename_generator,
            staging,
            io_lock,
            writer,
            sweep_task,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Synchronous read. Staged writes are visible immediately; otherwise
    /// the entry is read from disk and its recency refreshed.
    pub fn get(&self, key: &str) -> Option<Bytes> {
        {
            let staging = self.staging.lock().unwrap();
            if let Some(change) = staging.changes.get(key) {
                return match &change.kind {
                    StagedKind::Add(data) => Some(data.clone()),
                    StagedKind::Remove => None,
                };
            }
            if staging.remove_all_id.is_some() {
                return None;
            }
        }

        let file_path = self.file_path(key);
        let _io = self.io_lock.lock().unwrap();
        let data = fs::read(&file_path).ok()?;
        touch(&file_path);
        Some(Bytes::from(data))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Registers the write in staging and returns; the file is written by
    /// the writer task.
    pub fn put(&self, key: &str, data: Bytes) {
        let change_id = {
            let mut staging = self.staging.lock().unwrap();
            let id = staging.next_change_id();
            staging.changes.insert(
                key.to_string(),
                StagedChange {
                    id,
                    kind: StagedKind::Add(data.clone()),
                },
            );
            id
        };
        let _ = self.writer.send(WriteOp::Store {
            key: key.to_string(),
            filename: (self.filename_generator)(key),
            data,
            change_id,
        });
    }

    pub fn remove(&self, key: &str) {
        let change_id = {
            let mut staging = self.staging.lock().unwrap();
            let id = staging.next_change_id();
            staging.changes.insert(
                key.to_string(),
                StagedChange {
                    id,
                    kind: StagedKind::Remove,
                },
            );
            id
        };
        let _ = self.writer.send(WriteOp::Remove {
            key: key.to_string(),
            filename: (self.filename_generator)(key),
            change_id,
        });
    }

    pub fn remove_all(&self) {
        let change_id = {
            let mut staging = self.staging.lock().unwrap();
            let id = staging.next_change_id();
            staging.changes.clear();
            staging.remove_all_id = Some(id);
            id
        };
        let _ = self.writer.send(WriteOp::RemoveAll { change_id });
    }

    /// Waits until every write registered before this call has reached disk.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.writer.send(WriteOp::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    /// Total size and entry count currently on disk (staged writes not
    /// included).
    pub fn disk_contents(&self) -> (u64, usize) {
        let _io = self.io_lock.lock().unwrap();
        let mut size = 0;
        let mut count = 0;
        if let Ok(entries) = fs::read_dir(&self.path) {
            for entry in entries.flatten() {
                if let Ok(metadata) = entry.metadata() {
                    if metadata.is_file() {
                        size += metadata.len();
                        count += 1;
                    }
                }
            }
        }
        (size, count)
    }

    fn file_path(&self, key: &str) -> PathBuf {
        self.path.join((self.filename_generator)(key))
    }
}

impl Drop for DiskCache {
    fn drop(&mut self) {
        self.sweep_task.abort();
    }
}

#[async_trait]
impl DataCaching for DiskCache {
    async fn cached_data(&self, key: &str) -> Option<Bytes> {
        self.get(key)
    }

    fn store_data(&self, key: &str, data: Bytes) {
        self.put(key, data);
    }

    fn remove_data(&self, key: &str) {
        self.remove(key);
    }
}

struct SweepPolicy {
    size_limit: u64,
    count_limit: usize,
    trim_ratio: f64,
}

async fn writer_loop(
    mut rx: mpsc::UnboundedReceiver<WriteOp>,
    path: PathBuf,
    staging: Arc<Mutex<Staging>>,
    io_lock: Arc<Mutex<()>>,
    policy: SweepPolicy,
) {
    while let Some(op) = rx.recv().await {
        match op {
            WriteOp::Store {
                key,
                filename,
                data,
                change_id,
            } => {
                {
                    let _io = io_lock.lock().unwrap();
                    if let Err(err) = fs::write(path.join(&filename), &data) {
                        warn!(key = %key, error = %err, "disk cache write failed");
                    }
                }
                unstage(&staging, &key, change_id);
            }
            WriteOp::Remove {
                key,
                filename,
                change_id,
            } => {
                {
                    let _io = io_lock.lock().unwrap();
                    let _ = fs::remove_file(path.join(&filename));
                }
                unstage(&staging, &key, change_id);
            }
            WriteOp::RemoveAll { change_id } => {
                {
                    let _io = io_lock.lock().unwrap();
                    let _ = fs::remove_dir_all(&path);
                    let _ = fs::create_dir_all(&path);
                }
                let mut staging = staging.lock().unwrap();
                if staging.remove_all_id == Some(change_id) {
                    staging.remove_all_id = None;
                }
            }
            WriteOp::Flush(done) => {
                let _ = done.send(());
            }
            WriteOp::Sweep => {
                let _io = io_lock.lock().unwrap();
                sweep(&path, &policy);
            }
        }
    }
}

/// Removes the staged change unless a newer change superseded it.
fn unstage(staging: &Mutex<Staging>, key: &str, change_id: u64) {
    let mut staging = staging.lock().unwrap();
    if staging
        .changes
        .get(key)
        .is_some_and(|change| change.id == change_id)
    {
        staging.changes.remove(key);
    }
}

fn sweep(path: &Path, policy: &SweepPolicy) {
    let Ok(dir) = fs::read_dir(path) else {
        return;
    };

    let mut entries: Vec<(PathBuf, u64, SystemTime)> = Vec::new();
    let mut total_size = 0u64;
    for entry in dir.flatten() {
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        if !metadata.is_file() {
            continue;
        }
        let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        total_size += metadata.len();
        entries.push((entry.path(), metadata.len(), modified));
    }

    let target_size = (policy.size_limit as f64 * policy.trim_ratio) as u64;
    let target_count = (policy.count_limit as f64 * policy.trim_ratio) as usize;
    if total_size <= target_size && entries.len() <= target_count {
        return;
    }

    // MRU first, then delete from the tail until both targets hold.
    entries.sort_by(|a, b| b.2.cmp(&a.2));
    let mut kept_size = 0u64;
    let mut kept_count = 0usize;
    let mut removed = 0usize;
    for (file, size, _) in &entries {
        if kept_size + size <= target_size && kept_count + 1 <= target_count {
            kept_size += size;
            kept_count += 1;
        } else if fs::remove_file(file).is_ok() {
            removed += 1;
        }
    }
    debug!(removed, kept_count, kept_size, "disk cache sweep");
}

fn touch(path: &Path) {
    if let Ok(file) = fs::OpenOptions::new().write(true).open(path) {
        let _ = file.set_modified(SystemTime::now());
    }
}
