use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex as StdMutex,
    },
};

use serde_json::{Map, Value};
use tokio::sync::{Mutex, MutexGuard, OwnedMutexGuard};
use tracing::trace;

use crate::SectionPath;

/// A future that borrows the section data, as accepted by
/// [`VersionedSection::with_data_async`].
pub type DataFuture<'a, R> = Pin<Box<dyn Future<Output = R> + Send + 'a>>;

/// One named slice of the deployment state, checked out of a
/// [`crate::DeploymentStateStore`].
///
/// A section obtained from
/// [`acquire_section`](crate::DeploymentStateStore::acquire_section) holds
/// the lock for its path until it is released, either explicitly with
/// [`release`](Self::release) or by dropping it.
///
/// The version is local to the store instance that handed out the section;
/// it is not persisted.
pub struct VersionedSection {
    name: SectionPath,
    data: Mutex<Map<String, Value>>,
    version: AtomicU64,
    /// The store's change sequence this section's data is known to reflect.
    synced_at: AtomicU64,
    path_lock: StdMutex<Option<OwnedMutexGuard<()>>>,
    live: bool,
}

impl VersionedSection {
    pub(crate) fn acquired(
        name: SectionPath,
        data: Map<String, Value>,
        version: u64,
        synced_at: u64,
        path_lock: OwnedMutexGuard<()>,
    ) -> Self {
        VersionedSection {
            name,
            data: Mutex::new(data),
            version: AtomicU64::new(version),
            synced_at: AtomicU64::new(synced_at),
            path_lock: StdMutex::new(Some(path_lock)),
            live: true,
        }
    }

    /// A section that is not tied to any store: it holds no lock, and saving
    /// it does not update its version.
    ///
    /// Mostly useful to replay a stale copy of a section. It counts as
    /// having seen none of the store's changes, so any save of an overlapping
    /// path and any clear make it stale.
    pub fn detached(name: SectionPath, data: Map<String, Value>, version: u64) -> Self {
        VersionedSection {
            name,
            data: Mutex::new(data),
            version: AtomicU64::new(version),
            synced_at: AtomicU64::new(0),
            path_lock: StdMutex::new(None),
            live: false,
        }
    }

    pub fn name(&self) -> &SectionPath {
        &self.name
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    pub(crate) fn synced_at(&self) -> u64 {
        self.synced_at.load(Ordering::SeqCst)
    }

    /// Record a successful commit of this section.
    pub(crate) fn set_committed(&self, version: u64, sequence: u64) {
        if self.live {
            self.version.store(version, Ordering::SeqCst);
            self.synced_at.store(sequence, Ordering::SeqCst);
        }
    }

    pub fn is_detached(&self) -> bool {
        !self.live
    }

    /// Direct access to the data. Holding the guard excludes every other
    /// accessor of this section instance.
    pub async fn data(&self) -> MutexGuard<'_, Map<String, Value>> {
        self.data.lock().await
    }

    /// A copy of the current data.
    pub async fn snapshot(&self) -> Map<String, Value> {
        self.data.lock().await.clone()
    }

    /// Run `f` with exclusive access to the data.
    pub async fn with_data<R>(&self, f: impl FnOnce(&mut Map<String, Value>) -> R) -> R {
        let mut data = self.data.lock().await;
        f(&mut data)
    }

    /// Run an asynchronous mutation with exclusive access to the data. The
    /// lock is held until the returned future completes.
    ///
    /// ```ignore
    /// section
    ///     .with_data_async(|data| {
    ///         Box::pin(async move {
    ///             let value = fetch().await;
    ///             data.insert("key".to_owned(), value);
    ///         })
    ///     })
    ///     .await;
    /// ```
    pub async fn with_data_async<R, F>(&self, f: F) -> R
    where
        F: for<'a> FnOnce(&'a mut Map<String, Value>) -> DataFuture<'a, R>,
    {
        let mut data = self.data.lock().await;
        f(&mut data).await
    }

    /// Release the path lock. Further calls, and the eventual drop, do nothing.
    pub fn release(&self) {
        let guard = self
            .path_lock
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if guard.is_some() {
            trace!(section = %self.name, "releasing section");
        }
    }

    pub fn is_released(&self) -> bool {
        self.path_lock
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_none()
    }
}

impl Drop for VersionedSection {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for VersionedSection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VersionedSection")
            .field("name", &self.name)
            .field("version", &self.version())
            .field("live", &self.live)
            .finish_non_exhaustive()
    }
}
