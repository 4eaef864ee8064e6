//! Durable storage for a virtual consumer's committed [`ConsumerState`].
//!
//! The adapter is consulted on `open` (to resume where a previous instance
//! left off) and on every successful commit. Patterned after the
//! checkpoint-file handling in `surrealdb-surreal-sync/src/checkpoint.rs`:
//! a JSON blob per key, read whole and written whole, with no partial
//! updates.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::message::{SidelineRequestId, VirtualConsumerId};
use crate::state::ConsumerState;

/// Key a stored [`ConsumerState`] is filed under: the normal per-consumer
/// slot, or a sideline-request-scoped slot used while a bounded replay is
/// in flight.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum StateKey {
    Consumer(VirtualConsumerId),
    SidelineRequest(VirtualConsumerId, SidelineRequestId),
}

impl StateKey {
    fn file_stem(&self) -> String {
        match self {
            StateKey::Consumer(id) => id.as_ref().to_string(),
            StateKey::SidelineRequest(id, request) => {
                format!("{}--{}", id.as_ref(), request.as_ref())
            }
        }
    }
}

/// Persists and retrieves [`ConsumerState`] snapshots keyed by [`StateKey`].
///
/// Implementations need not be transactional across keys; the virtual
/// consumer only ever writes one key from one task at a time.
#[async_trait]
pub trait PersistenceAdapter: Send + Sync {
    async fn get_state(&self, key: &StateKey) -> crate::error::Result<Option<ConsumerState>>;

    async fn put_state(
        &self,
        key: &StateKey,
        state: &ConsumerState,
    ) -> crate::error::Result<()>;

    /// Deletes a stored state, e.g. once a sideline request's bounded replay
    /// has fully completed and there is nothing left to resume.
    async fn delete_state(&self, key: &StateKey) -> crate::error::Result<()>;
}

/// In-process adapter with no durability; useful for tests and for
/// single-process demos where restart-survival is not required.
#[derive(Default)]
pub struct InMemoryPersistenceAdapter {
    states: Mutex<HashMap<StateKey, ConsumerState>>,
}

impl InMemoryPersistenceAdapter {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PersistenceAdapter for InMemoryPersistenceAdapter {
    async fn get_state(&self, key: &StateKey) -> crate::error::Result<Option<ConsumerState>> {
        Ok(self.states.lock().unwrap().get(key).cloned())
    }

    async fn put_state(
        &self,
        key: &StateKey,
        state: &ConsumerState,
    ) -> crate::error::Result<()> {
        self.states
            .lock()
            .unwrap()
            .insert(key.clone(), state.clone());
        Ok(())
    }

    async fn delete_state(&self, key: &StateKey) -> crate::error::Result<()> {
        self.states.lock().unwrap().remove(key);
        Ok(())
    }
}

#[derive(Serialize, Deserialize)]
struct StoredState {
    state: ConsumerState,
}

/// One JSON file per key, under a configured root directory.
pub struct FilesystemPersistenceAdapter {
    root: PathBuf,
}

impl FilesystemPersistenceAdapter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &StateKey) -> PathBuf {
        self.root.join(format!("{}.json", key.file_stem()))
    }

    async fn ensure_root(&self) -> crate::error::Result<()> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|err| crate::error::Error::TransientIo(err.into()))
    }
}

#[async_trait]
impl PersistenceAdapter for FilesystemPersistenceAdapter {
    async fn get_state(&self, key: &StateKey) -> crate::error::Result<Option<ConsumerState>> {
        let path = self.path_for(key);
        match tokio::fs::read_to_string(&path).await {
            Ok(contents) => {
                let stored: StoredState = serde_json::from_str(&contents)
                    .map_err(|err| crate::error::Error::TransientIo(err.into()))?;
                Ok(Some(stored.state))
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(crate::error::Error::TransientIo(err.into())),
        }
    }

    async fn put_state(
        &self,
        key: &StateKey,
        state: &ConsumerState,
    ) -> crate::error::Result<()> {
        self.ensure_root().await?;
        let stored = StoredState {
            state: state.clone(),
        };
        let json = serde_json::to_string_pretty(&stored)
            .map_err(|err| crate::error::Error::TransientIo(err.into()))?;
        tokio::fs::write(self.path_for(key), json)
            .await
            .map_err(|err| crate::error::Error::TransientIo(err.into()))
    }

    async fn delete_state(&self, key: &StateKey) -> crate::error::Result<()> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(crate::error::Error::TransientIo(err.into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Partition;

    #[tokio::test]
    async fn in_memory_round_trips_state() {
        let adapter = InMemoryPersistenceAdapter::new();
        let key = StateKey::Consumer(VirtualConsumerId::new("vc-1"));
        assert!(adapter.get_state(&key).await.unwrap().is_none());

        let mut state = ConsumerState::new();
        state.set(Partition::new("orders", 0), 42);
        adapter.put_state(&key, &state).await.unwrap();

        let fetched = adapter.get_state(&key).await.unwrap().unwrap();
        assert_eq!(fetched.get(&Partition::new("orders", 0)), Some(42));
    }

    #[tokio::test]
    async fn filesystem_round_trips_and_deletes() {
        let dir = std::env::temp_dir().join(format!(
            "sideline-spout-test-{}",
            uuid_like_suffix()
        ));
        let adapter = FilesystemPersistenceAdapter::new(&dir);
        let key = StateKey::SidelineRequest(
            VirtualConsumerId::new("vc-1"),
            SidelineRequestId::new("req-1"),
        );

        let mut state = ConsumerState::new();
        state.set(Partition::new("orders", 3), 7);
        adapter.put_state(&key, &state).await.unwrap();

        let fetched = adapter.get_state(&key).await.unwrap().unwrap();
        assert_eq!(fetched.get(&Partition::new("orders", 3)), Some(7));

        adapter.delete_state(&key).await.unwrap();
        assert!(adapter.get_state(&key).await.unwrap().is_none());

        let _ = std::fs::remove_dir_all(&dir);
    }

    fn uuid_like_suffix() -> u64 {
        use std::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        std::thread::current().id().hash(&mut hasher);
        hasher.finish()
    }
}
