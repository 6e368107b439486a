//! Deployment state for orchestra.
//!
//! The state is one JSON document, divided into *sections* that are addressed
//! by colon-delimited paths such as `"Parameters"` or `"Azure:Deployments"`.
//! Callers check a section out of a [`DeploymentStateStore`], change its data
//! and save it back:
//!
//! ```ignore
//! let store = DeploymentStateStore::new(Arc::new(storage));
//! let section = store.acquire_section("Parameters").await?;
//! section.data().await.insert("key1".to_owned(), "value1".into());
//! store.save_section(&section).await?;
//! ```
//!
//! ## Concurrency
//!
//! - Acquiring a section locks its path until the section is released or
//!   dropped, so read-modify-write cycles on one path are serialized. Different
//!   paths do not block each other.
//! - Saving is optimistic: every section carries the version it was acquired
//!   at, and a save with an outdated version fails with
//!   [`StateError::Conflict`] without writing anything.
//! - Nested paths overlap: a save is also rejected when an ancestor or a
//!   descendant of its path was written, or all state was cleared, after the
//!   section was acquired. [`StateError::is_conflict`] covers every case.
//! - Versions are counted per store instance. A new store over the same
//!   storage sees the same data, starting again at version 0.

pub mod document;
pub mod error;
pub mod path;
pub mod section;
pub mod storage;
pub mod store;

pub use document::StateDocument;
pub use error::StateError;
pub use path::SectionPath;
pub use section::{DataFuture, VersionedSection};
pub use storage::{storage_key, FileStateStorage, MemoryStateStorage, StateStorage};
pub use store::DeploymentStateStore;
