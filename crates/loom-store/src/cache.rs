//! In-memory cache of materialized conversation trees.
//!
//! Each cached conversation is an [`Arc<ConversationHandle>`] wrapping its
//! [`TreeState`] in a read/write lock. Readers clone what they need under the
//! read guard; the store's single writer per conversation takes the write
//! guard only to fold an already-persisted event.
//!
//! The cache is bounded and evicts the least recently used handle. Evicted
//! or invalidated handles stay valid for whoever still holds them.

use std::collections::HashMap;
use std::sync::Arc;

use loom_core::ConversationId;
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

use crate::tree::TreeState;

/// A materialized conversation shared between readers and its writer.
#[derive(Debug)]
pub struct ConversationHandle {
    id: ConversationId,
    state: RwLock<TreeState>,
}

impl ConversationHandle {
    /// Wrap a freshly loaded tree.
    pub fn new(state: TreeState) -> Self {
        Self {
            id: state.conversation_id().clone(),
            state: RwLock::new(state),
        }
    }

    /// Conversation this handle materializes.
    pub fn id(&self) -> &ConversationId {
        &self.id
    }

    /// Shared access to the tree.
    pub fn read(&self) -> RwLockReadGuard<'_, TreeState> {
        self.state.read()
    }

    /// Owned copy of the tree.
    pub fn snapshot(&self) -> TreeState {
        self.state.read().clone()
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, TreeState> {
        self.state.write()
    }
}

#[derive(Debug)]
struct Entry {
    handle: Arc<ConversationHandle>,
    last_used: u64,
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<ConversationId, Entry>,
    tick: u64,
}

impl Inner {
    fn touch(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }
}

/// Bounded LRU map of conversation handles.
#[derive(Debug)]
pub struct ConversationCache {
    capacity: usize,
    inner: Mutex<Inner>,
}

impl ConversationCache {
    /// Cache holding at most `capacity` conversations (minimum one).
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Maximum number of cached conversations.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Cached handle for `id`, marking it recently used.
    pub fn get(&self, id: &ConversationId) -> Option<Arc<ConversationHandle>> {
        let mut inner = self.inner.lock();
        let tick = inner.touch();
        let entry = inner.entries.get_mut(id)?;
        entry.last_used = tick;
        Some(Arc::clone(&entry.handle))
    }

    /// Cached handle for `id`, calling `loader` on a miss.
    ///
    /// The loader runs without the cache lock held. If another caller cached
    /// the same conversation meanwhile, that handle wins.
    pub fn load<E>(
        &self,
        id: &ConversationId,
        loader: impl FnOnce() -> Result<TreeState, E>,
    ) -> Result<Arc<ConversationHandle>, E> {
        if let Some(handle) = self.get(id) {
            return Ok(handle);
        }
        let state = loader()?;
        Ok(self.insert(state))
    }

    /// Cache `state`, returning the handle now cached for its conversation.
    ///
    /// An existing handle is kept and returned instead.
    pub fn insert(&self, state: TreeState) -> Arc<ConversationHandle> {
        let mut inner = self.inner.lock();
        let tick = inner.touch();
        let id = state.conversation_id().clone();
        if let Some(entry) = inner.entries.get_mut(&id) {
            entry.last_used = tick;
            return Arc::clone(&entry.handle);
        }

        let handle = Arc::new(ConversationHandle::new(state));
        let _ = inner.entries.insert(
            id.clone(),
            Entry {
                handle: Arc::clone(&handle),
                last_used: tick,
            },
        );
        while inner.entries.len() > self.capacity {
            let Some(victim) = inner
                .entries
                .iter()
                .filter(|(key, _)| **key != id)
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(key, _)| key.clone())
            else {
                break;
            };
            let _ = inner.entries.remove(&victim);
            debug!(conversation_id = %victim, "evicted conversation from cache");
        }
        handle
    }

    /// Drop the cached handle. Returns whether one was cached.
    pub fn unload(&self, id: &ConversationId) -> bool {
        self.inner.lock().entries.remove(id).is_some()
    }

    /// Drop a handle whose tree may no longer match the log.
    pub fn invalidate(&self, id: &ConversationId) -> bool {
        let removed = self.unload(id);
        if removed {
            debug!(conversation_id = %id, "invalidated cached conversation");
        }
        removed
    }

    /// Drop every cached handle.
    pub fn clear(&self) {
        self.inner.lock().entries.clear();
    }

    /// Whether `id` is cached. Does not affect recency.
    pub fn contains(&self, id: &ConversationId) -> bool {
        self.inner.lock().entries.contains_key(id)
    }

    /// Number of cached conversations.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Whether nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
