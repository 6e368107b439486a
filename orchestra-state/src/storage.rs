//! Backing stores for the deployment state document.
//!
//! A [`StateStorage`] only moves whole documents; versioning and locking of
//! sections happen in [`crate::DeploymentStateStore`].

use std::{
    fs::OpenOptions,
    io::{self, BufWriter, Write as _},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;
use serde_json::{Map, Value};
use sha2::{Digest as _, Sha256};
use tracing::{debug, info};

use crate::StateError;

/// Loads and saves the persisted form of the state document.
#[async_trait]
pub trait StateStorage: Send + Sync {
    /// Load the persisted document. A store that has never been written to
    /// yields an empty map.
    async fn load(&self) -> Result<Map<String, Value>, StateError>;

    /// Replace the persisted document.
    async fn save(&self, document: &Map<String, Value>) -> Result<(), StateError>;

    /// Where the state lives, for humans.
    fn describe(&self) -> String;
}

/// A stable identifier for an application, derived from its path.
pub fn storage_key(app_path: &str) -> String {
    let digest = Sha256::digest(app_path.as_bytes());
    let mut out = String::with_capacity(digest.len() * 2);
    for b in digest {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

/// In-process storage. Clones share the same document, so stores created from
/// clones of one `MemoryStateStorage` observe each other's saves.
#[derive(Clone, Default)]
pub struct MemoryStateStorage {
    document: Arc<Mutex<Map<String, Value>>>,
}

impl MemoryStateStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Storage that already holds `document`, in either persisted form.
    pub fn with_document(document: Map<String, Value>) -> Self {
        MemoryStateStorage {
            document: Arc::new(Mutex::new(document)),
        }
    }

    /// A copy of what was last saved.
    pub fn persisted(&self) -> Map<String, Value> {
        self.document.lock().expect("mutex poisoned").clone()
    }
}

#[async_trait]
impl StateStorage for MemoryStateStorage {
    async fn load(&self) -> Result<Map<String, Value>, StateError> {
        Ok(self.persisted())
    }

    async fn save(&self, document: &Map<String, Value>) -> Result<(), StateError> {
        *self.document.lock().expect("mutex poisoned") = document.clone();
        Ok(())
    }

    fn describe(&self) -> String {
        "in-memory".to_owned()
    }
}

/// A JSON file on the local file system.
///
/// Writes go to a temporary file that is renamed over the state file, while an
/// exclusive lock is held on a sibling `.lock` file. Readers therefore see
/// either the old or the new document, never a partial one.
#[derive(Debug, Clone)]
pub struct FileStateStorage {
    path: PathBuf,
}

impl FileStateStorage {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        FileStateStorage {
            path: path.as_ref().to_owned(),
        }
    }

    /// The state file for `app_path` in `environment`:
    /// `<base>/deployments/<storage_key(app_path)>/<environment>.json`.
    ///
    /// `base_dir` defaults to `~/.orchestra`.
    pub fn for_application(
        base_dir: Option<&Path>,
        app_path: &str,
        environment: &str,
    ) -> Result<Self, StateError> {
        if environment.is_empty()
            || environment.contains(['/', '\\'])
            || environment == "."
            || environment == ".."
        {
            return Err(StateError::Storage(format!(
                "invalid environment name '{}'",
                environment
            )));
        }
        let base = match base_dir {
            Some(dir) => dir.to_owned(),
            None => dirs::home_dir()
                .ok_or_else(|| {
                    StateError::Storage("cannot determine the home directory".to_owned())
                })?
                .join(".orchestra"),
        };
        Ok(Self::new(
            base.join("deployments")
                .join(storage_key(app_path))
                .join(format!("{}.json", environment)),
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".lock");
        self.path.with_file_name(name)
    }

    fn io_error(&self, source: io::Error) -> StateError {
        StateError::Io {
            path: self.path.display().to_string(),
            source,
        }
    }

    fn load_blocking(&self) -> Result<Map<String, Value>, StateError> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no state file yet");
                return Ok(Map::new());
            }
            Err(e) => return Err(self.io_error(e)),
        };
        if contents.trim().is_empty() {
            return Ok(Map::new());
        }
        serde_json::from_str(&contents).map_err(|source| StateError::Json {
            path: self.path.display().to_string(),
            source,
        })
    }

    fn save_blocking(&self, document: &Map<String, Value>) -> Result<(), StateError> {
        let dir = self
            .path
            .parent()
            .ok_or_else(|| StateError::Storage("state file has no parent directory".to_owned()))?;
        std::fs::create_dir_all(dir).map_err(|e| self.io_error(e))?;

        let lock_file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(self.lock_path())
            .map_err(|e| self.io_error(e))?;
        let mut locking = fd_lock::RwLock::new(lock_file);
        let lock_wait_mon = WaitMonitor::new(format!(
            "Waiting for write lock on {}",
            self.path.display()
        ));
        let lock_guard = locking.write().map_err(|e| self.io_error(e))?;
        lock_wait_mon.done();

        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| self.io_error(e))?;
        {
            let mut writer = BufWriter::new(tmp.as_file_mut());
            // Pretty, because people do read and occasionally fix these by hand.
            serde_json::to_writer_pretty(&mut writer, document).map_err(|source| {
                StateError::Json {
                    path: self.path.display().to_string(),
                    source,
                }
            })?;
            writer.write_all(b"\n").map_err(|e| self.io_error(e))?;
            writer.flush().map_err(|e| self.io_error(e))?;
        }
        tmp.as_file().sync_all().map_err(|e| self.io_error(e))?;
        tmp.persist(&self.path).map_err(|e| self.io_error(e.error))?;

        drop(lock_guard);
        debug!(path = %self.path.display(), entries = document.len(), "state file written");
        Ok(())
    }
}

#[async_trait]
impl StateStorage for FileStateStorage {
    async fn load(&self) -> Result<Map<String, Value>, StateError> {
        let this = self.clone();
        tokio::task::spawn_blocking(move || this.load_blocking())
            .await
            .map_err(|e| StateError::Storage(format!("state loader panicked: {}", e)))?
    }

    async fn save(&self, document: &Map<String, Value>) -> Result<(), StateError> {
        let this = self.clone();
        let document = document.clone();
        tokio::task::spawn_blocking(move || this.save_blocking(&document))
            .await
            .map_err(|e| StateError::Storage(format!("state writer panicked: {}", e)))?
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// Monitor a wait which may take a long time, and log about it as needed.
/// After SILENT_INTERVAL: log the activity
/// After every LOG_INTERVAL: log the activity and duration
pub(crate) struct WaitMonitor {
    done: Arc<AtomicBool>,
}
impl WaitMonitor {
    const SILENT_INTERVAL: Duration = Duration::from_millis(500);
    const LOG_INTERVAL: Duration = Duration::from_secs(5);

    pub(crate) fn new(activity: String) -> WaitMonitor {
        let done = Arc::new(AtomicBool::new(false));
        let r = WaitMonitor { done: done.clone() };
        std::thread::spawn(move || {
            WaitMonitor::run(done, activity);
        });
        r
    }
    fn run(done: Arc<AtomicBool>, activity: String) {
        let start = Instant::now();
        let mut next_log = start + Self::SILENT_INTERVAL;
        loop {
            std::thread::sleep(next_log.saturating_duration_since(Instant::now()));
            if done.load(Ordering::Relaxed) {
                break;
            }
            let waited = next_log.duration_since(start);
            if waited <= Self::SILENT_INTERVAL {
                info!("{}", activity);
            } else {
                info!(seconds = waited.as_secs(), "{}", activity);
            }
            next_log += Self::LOG_INTERVAL;
        }
    }
    pub(crate) fn done(&self) {
        self.done.store(true, Ordering::Relaxed);
    }
}
impl Drop for WaitMonitor {
    fn drop(&mut self) {
        self.done()
    }
}
