use std::{
    collections::HashMap,
    future::Future,
    sync::{Arc, Mutex as StdMutex},
};

use serde_json::{Map, Value};
use tokio::sync::{Mutex, OnceCell};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, warn, Instrument as _};

use crate::{SectionPath, StateDocument, StateError, StateStorage, VersionedSection};

/// The mutable state behind the store-wide lock.
struct Committed {
    document: StateDocument,
    /// Authoritative version per section path, local to this store instance.
    versions: HashMap<SectionPath, u64>,
    /// Counts every commit and clear.
    sequence: u64,
    /// Sequence number of the latest commit per path since the last clear.
    changed_at: HashMap<SectionPath, u64>,
    cleared_at: u64,
}

impl Committed {
    /// Reject a write of `section` if the document changed underneath it.
    fn check_current(&self, section: &VersionedSection) -> Result<(), StateError> {
        let path = section.name();
        let actual = self.versions.get(path).copied().unwrap_or(0);
        let expected = section.version();
        if expected != actual {
            warn!(expected, actual, "rejecting stale section");
            return Err(StateError::Conflict {
                section: path.to_string(),
                expected,
                actual,
            });
        }
        let synced_at = section.synced_at();
        if self.cleared_at > synced_at {
            warn!(expected, "rejecting section acquired before clear");
            return Err(StateError::ClearedConflict {
                section: path.to_string(),
                expected,
            });
        }
        let changed = self
            .changed_at
            .iter()
            .filter(|(other, at)| **at > synced_at && *other != path && other.overlaps(path))
            .map(|(other, _)| other)
            .min();
        if let Some(changed) = changed {
            warn!(expected, changed = %changed, "rejecting section overlapped by a newer write");
            return Err(StateError::OverlapConflict {
                section: path.to_string(),
                expected,
                changed: changed.to_string(),
            });
        }
        Ok(())
    }
}

/// Versioned, path-addressed access to the deployment state.
///
/// Sections are checked out with [`acquire_section`](Self::acquire_section),
/// which serializes all users of one path until the section is released.
/// Writes go through [`save_section`](Self::save_section), which rejects the
/// write if the section's version is not the store's current version for that
/// path.
///
/// Paths nest, so `Parent` and `Parent:Child` can be checked out at the same
/// time. A write is also rejected when an overlapping path was written, or all
/// state was cleared, after the section was acquired. Overlapping writes never
/// silently replace each other.
pub struct DeploymentStateStore {
    storage: Arc<dyn StateStorage>,
    committed: OnceCell<Mutex<Committed>>,
    path_locks: StdMutex<HashMap<SectionPath, Arc<Mutex<()>>>>,
}

impl DeploymentStateStore {
    pub fn new(storage: Arc<dyn StateStorage>) -> Self {
        DeploymentStateStore {
            storage,
            committed: OnceCell::new(),
            path_locks: StdMutex::new(HashMap::new()),
        }
    }

    /// Where the backing state lives.
    pub fn describe(&self) -> String {
        self.storage.describe()
    }

    async fn committed(&self) -> Result<&Mutex<Committed>, StateError> {
        self.committed
            .get_or_try_init(|| async {
                let persisted = self.storage.load().await?;
                debug!(
                    storage = %self.storage.describe(),
                    entries = persisted.len(),
                    "loaded deployment state"
                );
                Ok::<_, StateError>(Mutex::new(Committed {
                    document: StateDocument::from_persisted(persisted),
                    versions: HashMap::new(),
                    sequence: 0,
                    changed_at: HashMap::new(),
                    cleared_at: 0,
                }))
            })
            .await
    }

    fn path_lock(&self, path: &SectionPath) -> Arc<Mutex<()>> {
        self.path_locks
            .lock()
            .expect("mutex poisoned")
            .entry(path.clone())
            .or_default()
            .clone()
    }

    pub async fn acquire_section(&self, name: &str) -> Result<VersionedSection, StateError> {
        self.acquire_section_cancellable(name, &CancellationToken::new())
            .await
    }

    /// Check out the section at `name`, waiting for any other holder of the
    /// same path to release it first.
    ///
    /// A missing section yields empty data. The document is not modified.
    pub async fn acquire_section_cancellable(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<VersionedSection, StateError> {
        let path = SectionPath::new(name)?;
        let span = info_span!("acquire section", section = %path);
        async move {
            let lock = self.path_lock(&path);
            let guard = cancellable(cancel, lock.lock_owned()).await?;
            let committed = cancellable(cancel, self.committed()).await??;
            let committed = committed.lock().await;
            let data = committed.document.get(&path).cloned().unwrap_or_default();
            let version = committed.versions.get(&path).copied().unwrap_or(0);
            debug!(version, "section acquired");
            Ok(VersionedSection::acquired(
                path,
                data,
                version,
                committed.sequence,
                guard,
            ))
        }
        .instrument(span)
        .await
    }

    pub async fn save_section(&self, section: &VersionedSection) -> Result<(), StateError> {
        self.save_section_cancellable(section, &CancellationToken::new())
            .await
    }

    /// Write the section's data back and persist the whole document.
    ///
    /// Fails with [`StateError::Conflict`] when the section's version is not
    /// the store's current version for its path, and with the other conflict
    /// variants when an overlapping path was written or the state was cleared
    /// since the section was acquired. Nothing is written then.
    pub async fn save_section_cancellable(
        &self,
        section: &VersionedSection,
        cancel: &CancellationToken,
    ) -> Result<(), StateError> {
        let data = section.snapshot().await;
        let span = info_span!("save section", section = %section.name());
        self.commit(section, cancel, |document, path| document.set(path, data))
            .instrument(span)
            .await
    }

    pub async fn delete_section(&self, section: &VersionedSection) -> Result<(), StateError> {
        self.delete_section_cancellable(section, &CancellationToken::new())
            .await
    }

    /// Remove the section from the document, with the same version check as
    /// [`save_section`](Self::save_section). The section's data is cleared.
    pub async fn delete_section_cancellable(
        &self,
        section: &VersionedSection,
        cancel: &CancellationToken,
    ) -> Result<(), StateError> {
        let span = info_span!("delete section", section = %section.name());
        self.commit(section, cancel, |document, path| {
            document.remove(path).map(|_| ())
        })
        .instrument(span)
        .await?;
        if !section.is_detached() {
            section.data().await.clear();
        }
        Ok(())
    }

    async fn commit(
        &self,
        section: &VersionedSection,
        cancel: &CancellationToken,
        change: impl FnOnce(&mut StateDocument, &SectionPath) -> Result<(), StateError>,
    ) -> Result<(), StateError> {
        let committed = cancellable(cancel, self.committed()).await??;
        let mut committed = cancellable(cancel, committed.lock()).await?;

        committed.check_current(section)?;
        let path = section.name();

        let previous = committed.document.clone();
        let changed = match change(&mut committed.document, path) {
            Ok(()) => self.storage.save(&committed.document.to_persisted()).await,
            Err(e) => Err(e),
        };
        if let Err(e) = changed {
            committed.document = previous;
            return Err(e);
        }

        let version = section.version() + 1;
        committed.sequence += 1;
        let sequence = committed.sequence;
        committed.versions.insert(path.clone(), version);
        committed.changed_at.insert(path.clone(), sequence);
        section.set_committed(version, sequence);
        debug!(version, sequence, "section committed");
        Ok(())
    }

    pub async fn clear_all_state(&self) -> Result<(), StateError> {
        self.clear_all_state_cancellable(&CancellationToken::new())
            .await
    }

    /// Remove all state. Every section acquired before, saved or not, becomes
    /// stale.
    pub async fn clear_all_state_cancellable(
        &self,
        cancel: &CancellationToken,
    ) -> Result<(), StateError> {
        let committed = cancellable(cancel, self.committed()).await??;
        let mut committed = cancellable(cancel, committed.lock()).await?;
        let previous = committed.document.clone();
        committed.document.clear();
        if let Err(e) = self.storage.save(&committed.document.to_persisted()).await {
            committed.document = previous;
            return Err(e);
        }
        for version in committed.versions.values_mut() {
            *version += 1;
        }
        committed.sequence += 1;
        committed.cleared_at = committed.sequence;
        committed.changed_at.clear();
        debug!(storage = %self.storage.describe(), "cleared deployment state");
        Ok(())
    }

    pub async fn snapshot(&self) -> Result<Map<String, Value>, StateError> {
        self.snapshot_cancellable(&CancellationToken::new()).await
    }

    /// A copy of the whole document in its nested form.
    pub async fn snapshot_cancellable(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Map<String, Value>, StateError> {
        let committed = cancellable(cancel, self.committed()).await??;
        let committed = cancellable(cancel, committed.lock()).await?;
        Ok(committed.document.root_map().clone())
    }
}

/// Run `future` unless `cancel` fires first.
async fn cancellable<T>(
    cancel: &CancellationToken,
    future: impl Future<Output = T>,
) -> Result<T, StateError> {
    if cancel.is_cancelled() {
        return Err(StateError::Cancelled);
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(StateError::Cancelled),
        r = future => Ok(r),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FileStateStorage, MemoryStateStorage};
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;

    fn memory_store() -> (DeploymentStateStore, MemoryStateStorage) {
        let storage = MemoryStateStorage::new();
        (DeploymentStateStore::new(Arc::new(storage.clone())), storage)
    }

    fn as_map(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[tokio::test]
    async fn test_acquire_fresh_section() {
        let (store, _) = memory_store();
        let section = store.acquire_section("Parameters").await.unwrap();
        assert_eq!(section.version(), 0);
        assert!(section.snapshot().await.is_empty());
        assert_eq!(section.name().as_str(), "Parameters");
    }

    #[tokio::test]
    async fn test_save_and_reacquire() {
        let (store, storage) = memory_store();
        {
            let section = store.acquire_section("Parameters").await.unwrap();
            section
                .data()
                .await
                .insert("key1".to_owned(), json!("value1"));
            store.save_section(&section).await.unwrap();
            assert_eq!(section.version(), 1);
        }
        let section = store.acquire_section("Parameters").await.unwrap();
        assert_eq!(section.version(), 1);
        assert_eq!(section.snapshot().await.get("key1"), Some(&json!("value1")));
        assert_eq!(
            storage.persisted(),
            as_map(json!({"Parameters": {"key1": "value1"}}))
        );
    }

    #[tokio::test]
    async fn test_version_increments_per_save() {
        let (store, _) = memory_store();
        let section = store.acquire_section("Counter").await.unwrap();
        for i in 1..=5u64 {
            section.data().await.insert("n".to_owned(), json!(i));
            store.save_section(&section).await.unwrap();
            assert_eq!(section.version(), i);
        }
    }

    #[tokio::test]
    async fn test_stale_copy_conflicts() {
        let (store, _) = memory_store();
        let section = store.acquire_section("Conflict").await.unwrap();
        let stale = VersionedSection::detached(
            section.name().clone(),
            as_map(json!({"value": "stale"})),
            section.version(),
        );
        section
            .data()
            .await
            .insert("value".to_owned(), json!("first"));
        store.save_section(&section).await.unwrap();

        let err = store.save_section(&stale).await.unwrap_err();
        match &err {
            StateError::Conflict {
                section,
                expected,
                actual,
            } => {
                assert_eq!(section, "Conflict");
                assert_eq!(*expected, 0);
                assert_eq!(*actual, 1);
            }
            other => panic!("unexpected error {:?}", other),
        }
        let message = err.to_string();
        assert!(message.contains("Conflict"));
        assert!(message.contains("expected version 0"));

        assert_eq!(
            store.snapshot().await.unwrap(),
            as_map(json!({"Conflict": {"value": "first"}}))
        );
    }

    #[tokio::test]
    async fn test_detached_save_does_not_bump_copy() {
        let (store, _) = memory_store();
        let copy = VersionedSection::detached(
            SectionPath::new("Detached").unwrap(),
            as_map(json!({"a": 1})),
            0,
        );
        store.save_section(&copy).await.unwrap();
        assert_eq!(copy.version(), 0);
        assert!(store.save_section(&copy).await.unwrap_err().is_conflict());
        assert_eq!(store.acquire_section("Detached").await.unwrap().version(), 1);
    }

    #[tokio::test]
    async fn test_persistence_across_instances_resets_version() {
        let storage = MemoryStateStorage::new();
        {
            let store_a = DeploymentStateStore::new(Arc::new(storage.clone()));
            let section = store_a.acquire_section("Parameters").await.unwrap();
            section.data().await.insert("key".to_owned(), json!(42));
            store_a.save_section(&section).await.unwrap();
            store_a.save_section(&section).await.unwrap();
            assert_eq!(section.version(), 2);
        }
        let store_b = DeploymentStateStore::new(Arc::new(storage));
        let section = store_b.acquire_section("Parameters").await.unwrap();
        assert_eq!(section.version(), 0);
        assert_eq!(section.snapshot().await.get("key"), Some(&json!(42)));
    }

    #[tokio::test]
    async fn test_file_persistence_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let open = |env: &str| {
            DeploymentStateStore::new(Arc::new(
                FileStateStorage::for_application(Some(dir.path()), "/src/app", env).unwrap(),
            ))
        };
        {
            let store = open("production");
            let section = store.acquire_section("Azure:Deployments").await.unwrap();
            section
                .data()
                .await
                .insert("name".to_owned(), json!("web"));
            store.save_section(&section).await.unwrap();
        }
        let store = open("production");
        let section = store.acquire_section("Azure:Deployments").await.unwrap();
        assert_eq!(section.version(), 0);
        assert_eq!(section.snapshot().await.get("name"), Some(&json!("web")));

        let other_env = open("staging");
        let section = other_env.acquire_section("Azure:Deployments").await.unwrap();
        assert!(section.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn test_nested_paths_are_isolated() {
        let (store, _) = memory_store();
        let other = store.acquire_section("Parent:Child:Other").await.unwrap();
        other.data().await.insert("keep".to_owned(), json!(true));
        store.save_section(&other).await.unwrap();

        let grandchild = store
            .acquire_section("Parent:Child:Grandchild")
            .await
            .unwrap();
        grandchild
            .data()
            .await
            .insert("value".to_owned(), json!("nested"));
        store.save_section(&grandchild).await.unwrap();
        drop(other);
        drop(grandchild);

        let other = store.acquire_section("Parent:Child:Other").await.unwrap();
        assert_eq!(other.snapshot().await.get("keep"), Some(&json!(true)));
        let grandchild = store
            .acquire_section("Parent:Child:Grandchild")
            .await
            .unwrap();
        assert_eq!(
            grandchild.snapshot().await.get("value"),
            Some(&json!("nested"))
        );
        let parent = store.acquire_section("Parent").await.unwrap();
        assert!(parent.snapshot().await.contains_key("Child"));
    }

    #[tokio::test]
    async fn test_reading_missing_path_does_not_create_it() {
        let (store, storage) = memory_store();
        let section = store.acquire_section("Missing:Deeply:Nested").await.unwrap();
        assert!(section.snapshot().await.is_empty());
        assert!(store.snapshot().await.unwrap().is_empty());
        assert!(storage.persisted().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_read_modify_write_same_path() {
        let (store, _) = memory_store();
        let store = Arc::new(store);
        let mut handles = Vec::new();
        for _ in 0..10 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let section = store.acquire_section("Shared").await.unwrap();
                let counter = section
                    .with_data(|data| {
                        let n = data.get("counter").and_then(Value::as_u64).unwrap_or(0) + 1;
                        data.insert("counter".to_owned(), json!(n));
                        n
                    })
                    .await;
                tokio::task::yield_now().await;
                store.save_section(&section).await.unwrap();
                counter
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        let section = store.acquire_section("Shared").await.unwrap();
        assert_eq!(section.version(), 10);
        assert_eq!(section.snapshot().await.get("counter"), Some(&json!(10)));
    }

    #[tokio::test]
    async fn test_distinct_paths_do_not_block() {
        let (store, _) = memory_store();
        let a = store.acquire_section("A").await.unwrap();
        let b = tokio::time::timeout(Duration::from_secs(5), store.acquire_section("B"))
            .await
            .expect("acquiring a different path must not block")
            .unwrap();
        store.save_section(&b).await.unwrap();
        store.save_section(&a).await.unwrap();
    }

    #[tokio::test]
    async fn test_same_path_waits_for_release() {
        let (store, _) = memory_store();
        let first = store.acquire_section("Same").await.unwrap();
        let blocked =
            tokio::time::timeout(Duration::from_millis(50), store.acquire_section("Same")).await;
        assert!(blocked.is_err());
        first.release();
        first.release();
        let second = tokio::time::timeout(Duration::from_secs(5), store.acquire_section("Same"))
            .await
            .expect("released lock must be available")
            .unwrap();
        assert_eq!(second.version(), 0);
    }

    #[tokio::test]
    async fn test_cancel_before_lock_has_no_effect() {
        let (store, storage) = memory_store();
        let holder = store.acquire_section("Busy").await.unwrap();

        let cancel = CancellationToken::new();
        let waiting = {
            let cancel = cancel.clone();
            let store = &store;
            async move { store.acquire_section_cancellable("Busy", &cancel).await }
        };
        cancel.cancel();
        assert!(matches!(waiting.await, Err(StateError::Cancelled)));

        let cancelled = CancellationToken::new();
        cancelled.cancel();
        holder.data().await.insert("x".to_owned(), json!(1));
        assert!(matches!(
            store.save_section_cancellable(&holder, &cancelled).await,
            Err(StateError::Cancelled)
        ));
        assert_eq!(holder.version(), 0);
        assert!(storage.persisted().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_section_names() {
        let (store, _) = memory_store();
        for name in ["", "a::b", ":a", "a:"] {
            assert!(matches!(
                store.acquire_section(name).await,
                Err(StateError::InvalidSectionName { .. })
            ));
        }
    }

    #[tokio::test]
    async fn test_delete_section() {
        let (store, storage) = memory_store();
        let keep = store.acquire_section("Parent:Keep").await.unwrap();
        keep.data().await.insert("k".to_owned(), json!(1));
        store.save_section(&keep).await.unwrap();
        let gone = store.acquire_section("Parent:Gone").await.unwrap();
        gone.data().await.insert("g".to_owned(), json!(2));
        store.save_section(&gone).await.unwrap();

        store.delete_section(&gone).await.unwrap();
        assert_eq!(gone.version(), 2);
        assert!(gone.snapshot().await.is_empty());
        assert_eq!(storage.persisted(), as_map(json!({"Parent": {"Keep": {"k": 1}}})));
    }

    #[tokio::test]
    async fn test_clear_all_state_invalidates_sections() {
        let (store, storage) = memory_store();
        let section = store.acquire_section("Parameters").await.unwrap();
        section.data().await.insert("a".to_owned(), json!(1));
        store.save_section(&section).await.unwrap();

        store.clear_all_state().await.unwrap();
        assert!(storage.persisted().is_empty());
        assert!(store.save_section(&section).await.unwrap_err().is_conflict());
    }

    #[tokio::test]
    async fn test_data_keys_survive_new_store() {
        let storage = MemoryStateStorage::new();
        let data = as_map(json!({"a:b": 1, "": 2, "c": {"d:e": 3}}));
        {
            let store_a = DeploymentStateStore::new(Arc::new(storage.clone()));
            let section = store_a.acquire_section("Parameters").await.unwrap();
            *section.data().await = data.clone();
            store_a.save_section(&section).await.unwrap();
        }
        let store_b = DeploymentStateStore::new(Arc::new(storage));
        let section = store_b.acquire_section("Parameters").await.unwrap();
        assert_eq!(section.snapshot().await, data);
        assert_eq!(
            store_b.snapshot().await.unwrap(),
            as_map(json!({"Parameters": data}))
        );
    }

    #[tokio::test]
    async fn test_legacy_flattened_state_loads() {
        let storage = MemoryStateStorage::with_document(as_map(json!({
            "Parameters:key1": "value1",
            "Parameters": {"key2": 2},
        })));
        let store = DeploymentStateStore::new(Arc::new(storage.clone()));
        let section = store.acquire_section("Parameters").await.unwrap();
        assert_eq!(
            section.snapshot().await,
            as_map(json!({"key1": "value1", "key2": 2}))
        );
        store.save_section(&section).await.unwrap();
        assert_eq!(
            storage.persisted(),
            as_map(json!({"Parameters": {"key1": "value1", "key2": 2}}))
        );
    }

    #[tokio::test]
    async fn test_parent_save_after_child_save_conflicts() {
        let (store, _) = memory_store();
        let child = store.acquire_section("Parent:Child").await.unwrap();
        let parent = store.acquire_section("Parent").await.unwrap();

        child.data().await.insert("x".to_owned(), json!(1));
        store.save_section(&child).await.unwrap();
        assert_eq!(child.version(), 1);

        parent.data().await.insert("p".to_owned(), json!(true));
        let err = store.save_section(&parent).await.unwrap_err();
        assert!(err.is_conflict());
        match &err {
            StateError::OverlapConflict {
                section, changed, ..
            } => {
                assert_eq!(section, "Parent");
                assert_eq!(changed, "Parent:Child");
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert!(err.to_string().contains("expected version 0"));
        drop(child);
        drop(parent);

        let child = store.acquire_section("Parent:Child").await.unwrap();
        assert_eq!(child.snapshot().await, as_map(json!({"x": 1})));
        drop(child);

        let parent = store.acquire_section("Parent").await.unwrap();
        parent.data().await.insert("p".to_owned(), json!(true));
        store.save_section(&parent).await.unwrap();
        assert_eq!(
            store.snapshot().await.unwrap(),
            as_map(json!({"Parent": {"Child": {"x": 1}, "p": true}}))
        );
    }

    #[tokio::test]
    async fn test_child_save_after_parent_write_conflicts() {
        let (store, _) = memory_store();
        let child = store.acquire_section("Parent:Child").await.unwrap();
        let sibling = store.acquire_section("Parent:Sibling").await.unwrap();
        let parent = store.acquire_section("Parent").await.unwrap();

        sibling.data().await.insert("s".to_owned(), json!(1));
        store.save_section(&sibling).await.unwrap();
        drop(sibling);

        // The parent was acquired before the sibling's save
        assert!(store.save_section(&parent).await.unwrap_err().is_conflict());
        drop(parent);
        let parent = store.acquire_section("Parent").await.unwrap();
        store.delete_section(&parent).await.unwrap();

        child.data().await.insert("x".to_owned(), json!(1));
        assert!(matches!(
            store.save_section(&child).await,
            Err(StateError::OverlapConflict { .. })
        ));
        assert!(store.snapshot().await.unwrap().is_empty());
        drop(parent);

        // Own saves keep the section current
        let parent = store.acquire_section("Parent").await.unwrap();
        assert_eq!(parent.version(), 1);
        parent.data().await.insert("a".to_owned(), json!(1));
        store.save_section(&parent).await.unwrap();
        parent.data().await.insert("b".to_owned(), json!(2));
        store.save_section(&parent).await.unwrap();
        assert_eq!(parent.version(), 3);
    }

    #[tokio::test]
    async fn test_clear_invalidates_unsaved_sections() {
        let storage = MemoryStateStorage::with_document(as_map(json!({"Parameters:k": 1})));
        let store = DeploymentStateStore::new(Arc::new(storage.clone()));
        let section = store.acquire_section("Parameters").await.unwrap();
        assert_eq!(section.version(), 0);
        assert_eq!(section.snapshot().await, as_map(json!({"k": 1})));

        store.clear_all_state().await.unwrap();
        assert!(matches!(
            store.save_section(&section).await,
            Err(StateError::ClearedConflict { .. })
        ));
        assert!(matches!(
            store.delete_section(&section).await,
            Err(StateError::ClearedConflict { .. })
        ));
        assert!(storage.persisted().is_empty());
        assert!(store.snapshot().await.unwrap().is_empty());
        drop(section);

        let section = store.acquire_section("Parameters").await.unwrap();
        assert!(section.snapshot().await.is_empty());
        section.data().await.insert("fresh".to_owned(), json!(true));
        store.save_section(&section).await.unwrap();
        assert_eq!(
            storage.persisted(),
            as_map(json!({"Parameters": {"fresh": true}}))
        );
    }

    #[tokio::test]
    async fn test_clear_while_section_checked_out() {
        let (store, _) = memory_store();
        let held = store.acquire_section("Held:Nested").await.unwrap();
        // Clearing does not wait for path locks
        tokio::time::timeout(Duration::from_secs(5), store.clear_all_state())
            .await
            .expect("clear must not wait for checked out sections")
            .unwrap();
        held.data().await.insert("v".to_owned(), json!(1));
        assert!(store.save_section(&held).await.unwrap_err().is_conflict());
        assert!(store.snapshot().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_while_waiting_for_path_lock() {
        let (store, _) = memory_store();
        let holder = store.acquire_section("Busy").await.unwrap();

        let cancel = CancellationToken::new();
        let waiting = store.acquire_section_cancellable("Busy", &cancel);
        let cancelling = async {
            tokio::task::yield_now().await;
            cancel.cancel();
        };
        let (acquired, ()) = tokio::join!(waiting, cancelling);
        assert!(matches!(acquired, Err(StateError::Cancelled)));

        holder.release();
        let section = tokio::time::timeout(Duration::from_secs(5), store.acquire_section("Busy"))
            .await
            .expect("cancelled waiter must not keep the lock")
            .unwrap();
        assert_eq!(section.version(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_clear_and_snapshot() {
        let (store, storage) = memory_store();
        let section = store.acquire_section("Parameters").await.unwrap();
        section.data().await.insert("k".to_owned(), json!(1));
        store.save_section(&section).await.unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(
            store.clear_all_state_cancellable(&cancel).await,
            Err(StateError::Cancelled)
        ));
        assert!(matches!(
            store.snapshot_cancellable(&cancel).await,
            Err(StateError::Cancelled)
        ));
        assert!(!storage.persisted().is_empty());
        store.save_section(&section).await.unwrap();

        let live = CancellationToken::new();
        assert_eq!(
            store.snapshot_cancellable(&live).await.unwrap(),
            as_map(json!({"Parameters": {"k": 1}}))
        );
        store.clear_all_state_cancellable(&live).await.unwrap();
        assert!(storage.persisted().is_empty());
    }

    struct FailingStorage;

    #[async_trait]
    impl StateStorage for FailingStorage {
        async fn load(&self) -> Result<Map<String, Value>, StateError> {
            Ok(as_map(json!({"Existing": {"a": 1}})))
        }
        async fn save(&self, _document: &Map<String, Value>) -> Result<(), StateError> {
            Err(StateError::Storage("disk full".to_owned()))
        }
        fn describe(&self) -> String {
            "failing".to_owned()
        }
    }

    #[tokio::test]
    async fn test_failed_persist_rolls_back() {
        let store = DeploymentStateStore::new(Arc::new(FailingStorage));
        let section = store.acquire_section("Existing").await.unwrap();
        section.data().await.insert("a".to_owned(), json!(2));
        assert!(matches!(
            store.save_section(&section).await,
            Err(StateError::Storage(_))
        ));
        assert_eq!(section.version(), 0);
        assert_eq!(
            store.snapshot().await.unwrap(),
            as_map(json!({"Existing": {"a": 1}}))
        );
    }
}
