//! High-level transactional `ConversationStore` API.
//!
//! Composes the event log, the materialized tree cache, access control and
//! the repositories into conversation-centric methods. Every write runs
//! inside a single `SQLite` transaction, so callers never observe partial
//! state in storage.
//!
//! INVARIANT: tree mutations are serialized per conversation through an
//! in-process mutex (`with_conversation_write_lock`). Events are planned
//! against the cached tree and folded into a copy of it; the events and the
//! copy's counters commit in one transaction, and only then does the copy
//! replace the cached tree. The in-memory order always matches the log order.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use loom_core::{ConversationFormat, ConversationId, UserId};
use serde_json::Value;
use tracing::{debug, error, info, instrument};

use crate::access::{Access, Capability};
use crate::cache::{ConversationCache, ConversationHandle};
use crate::errors::{Result, StoreError};
use crate::event_log::EventLog;
use crate::events::TreeEvent;
use crate::sqlite::connection::{self, ConnectionConfig, ConnectionPool, PooledConnection};
use crate::sqlite::migrations::run_migrations;
use crate::sqlite::repositories::collaborator::CollaboratorRepo;
use crate::sqlite::repositories::conversation::{
    ConversationRepo, CreateConversationOptions, ListConversationsOptions,
};
use crate::sqlite::row_types::ConversationRow;
use crate::tree::TreeState;

mod fork_ops;
mod maintenance;
mod sharing;
mod tree_ops;

pub use fork_ops::{ForkRequest, ForkResult};
pub use maintenance::{CompactionSweep, ConversationStats, VerifyReport, spawn_compaction_task};

/// Options for creating a conversation.
#[derive(Debug, Default, Clone)]
pub struct NewConversation {
    /// Display title.
    pub title: String,
    /// Conversation format.
    pub format: ConversationFormat,
    /// Opaque settings object; `None` stores `{}`.
    pub settings: Option<Value>,
}

/// High-level store wrapping a connection pool, the tree cache and all
/// repositories.
pub struct ConversationStore {
    pool: ConnectionPool,
    cache: ConversationCache,
    write_locks: Mutex<HashMap<String, Weak<Mutex<()>>>>,
}

impl ConversationStore {
    const SQLITE_BUSY_MAX_RETRIES: u32 = 32;

    /// Wrap an already-migrated pool.
    pub fn new(pool: ConnectionPool, cache_capacity: usize) -> Self {
        Self {
            pool,
            cache: ConversationCache::new(cache_capacity),
            write_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Open the database named by `settings`, creating and migrating it as needed.
    pub fn open(settings: &loom_settings::LoomSettings) -> Result<Self> {
        let path = loom_settings::database_path(settings);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Internal(format!("cannot create {}: {e}", parent.display())))?;
        }
        let config = ConnectionConfig::from(&settings.storage);
        let pool = connection::new_file(&path.to_string_lossy(), &config)?;
        Self::migrated(pool, settings.cache.max_conversations)
    }

    /// Fresh private in-memory database.
    pub fn in_memory() -> Result<Self> {
        let pool = connection::new_in_memory(&ConnectionConfig::default())?;
        Self::migrated(pool, loom_settings::CacheSettings::default().max_conversations)
    }

    fn migrated(pool: ConnectionPool, cache_capacity: usize) -> Result<Self> {
        {
            let conn = pool.get()?;
            let applied = run_migrations(&conn)?;
            debug!(applied, "database ready");
        }
        Ok(Self::new(pool, cache_capacity))
    }

    /// Underlying connection pool.
    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Materialized tree cache.
    pub fn cache(&self) -> &ConversationCache {
        &self.cache
    }

    // ─────────────────────────────────────────────────────────────────────
    // Locking and retries
    // ─────────────────────────────────────────────────────────────────────

    fn acquire_conversation_write_lock(&self, conversation_id: &str) -> Result<Arc<Mutex<()>>> {
        let mut locks = self
            .write_locks
            .lock()
            .map_err(|_| StoreError::Internal("conversation lock map poisoned".into()))?;

        // Opportunistically prune dead weak refs when the map grows.
        if locks.len() > 128 {
            locks.retain(|_, weak| weak.strong_count() > 0);
        }

        if let Some(existing) = locks.get(conversation_id).and_then(Weak::upgrade) {
            return Ok(existing);
        }

        let lock = Arc::new(Mutex::new(()));
        let _ = locks.insert(conversation_id.to_string(), Arc::downgrade(&lock));
        Ok(lock)
    }

    fn with_conversation_write_lock<T>(
        &self,
        conversation_id: &str,
        f: impl FnOnce() -> Result<T>,
    ) -> Result<T> {
        let conversation_lock = self.acquire_conversation_write_lock(conversation_id)?;
        let _guard = conversation_lock
            .lock()
            .map_err(|_| StoreError::Internal("conversation write lock poisoned".into()))?;
        f()
    }

    fn remove_conversation_write_lock(&self, conversation_id: &str) -> Result<()> {
        let mut locks = self
            .write_locks
            .lock()
            .map_err(|_| StoreError::Internal("conversation lock map poisoned".into()))?;
        let _ = locks.remove(conversation_id);
        Ok(())
    }

    /// Retry an operation on `SQLite` BUSY/LOCKED with linear backoff + jitter.
    ///
    /// Backoff: base = min(attempts * 10, 500) ms, jitter ±25%.
    #[allow(clippy::unused_self)]
    fn retry_on_sqlite_busy<T>(&self, mut f: impl FnMut() -> Result<T>) -> Result<T> {
        let mut attempts = 0;

        loop {
            match f() {
                Ok(value) => return Ok(value),
                Err(err)
                    if Self::is_sqlite_busy_or_locked(&err)
                        && attempts < Self::SQLITE_BUSY_MAX_RETRIES =>
                {
                    attempts += 1;
                    let base_ms = u64::from(attempts).saturating_mul(10).min(500);
                    let jitter_range = base_ms / 4;
                    let jitter = if jitter_range > 0 {
                        rand::random::<u64>() % (jitter_range * 2 + 1)
                    } else {
                        0
                    };
                    let backoff_ms = base_ms.saturating_sub(jitter_range) + jitter;
                    debug!(attempts, backoff_ms, "sqlite busy, retrying");
                    std::thread::sleep(Duration::from_millis(backoff_ms));
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn is_sqlite_busy_or_locked(err: &StoreError) -> bool {
        match err {
            StoreError::Sqlite(rusqlite::Error::SqliteFailure(code, _)) => {
                matches!(
                    code.code,
                    rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
                )
            }
            _ => false,
        }
    }

    /// Get a connection from the pool.
    fn conn(&self) -> Result<PooledConnection> {
        Ok(self.pool.get()?)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Access and materialization
    // ─────────────────────────────────────────────────────────────────────

    /// `user`'s standing on the conversation, or `None` without any.
    ///
    /// Errors with [`StoreError::ConversationNotFound`] if the conversation
    /// does not exist.
    pub fn access_for(&self, conversation_id: &ConversationId, user: &UserId) -> Result<Option<Access>> {
        let conn = self.conn()?;
        let row = ConversationRepo::get_by_id(&conn, conversation_id)?
            .ok_or_else(|| StoreError::ConversationNotFound(conversation_id.to_string()))?;
        access_of(&conn, &row, user)
    }

    /// Load the conversation row and check `user` may exercise `capability`.
    ///
    /// `None` when the conversation does not exist.
    fn authorize(
        &self,
        conn: &rusqlite::Connection,
        conversation_id: &ConversationId,
        user: &UserId,
        capability: Capability,
    ) -> Result<Option<ConversationRow>> {
        let Some(row) = ConversationRepo::get_by_id(conn, conversation_id)? else {
            return Ok(None);
        };
        match access_of(conn, &row, user)? {
            Some(access) if access.allows(capability) => Ok(Some(row)),
            _ => {
                debug!(
                    conversation_id = %conversation_id,
                    user_id = %user,
                    ?capability,
                    "access denied"
                );
                Err(StoreError::AccessDenied)
            }
        }
    }

    /// Cached tree for `row`, replaying the log on a miss.
    ///
    /// Callers must hold the conversation write lock, so a cold load never
    /// races a writer appending to the same log.
    fn handle_locked(
        &self,
        conn: &rusqlite::Connection,
        row: &ConversationRow,
    ) -> Result<Arc<ConversationHandle>> {
        let id = ConversationId::from(row.id.as_str());
        self.cache.load(&id, || {
            let state = EventLog::load_state(conn, &id, row.conversation_format())?;
            debug!(conversation_id = %id, events = state.events_applied(), "conversation loaded");
            Ok(state)
        })
    }

    /// Cached tree for `row`, taking the write lock only on a miss.
    fn handle(&self, conn: &rusqlite::Connection, row: &ConversationRow) -> Result<Arc<ConversationHandle>> {
        let id = ConversationId::from(row.id.as_str());
        if let Some(handle) = self.cache.get(&id) {
            return Ok(handle);
        }
        self.with_conversation_write_lock(&row.id, || self.handle_locked(conn, row))
    }

    /// Read-only view of a conversation for `user`.
    ///
    /// `None` if the conversation does not exist.
    fn read_tree<T>(
        &self,
        conversation_id: &ConversationId,
        user: &UserId,
        read: impl FnOnce(&TreeState) -> T,
    ) -> Result<Option<T>> {
        let conn = self.conn()?;
        let Some(row) = self.authorize(&conn, conversation_id, user, Capability::Read)? else {
            return Ok(None);
        };
        let handle = self.handle(&conn, &row)?;
        let state = handle.read();
        Ok(Some(read(&state)))
    }

    /// Plan, persist and apply one tree mutation.
    ///
    /// `plan` sees the current tree and returns the events to record plus
    /// any context `materialize` needs, or `None` if the target does not
    /// exist. `materialize` runs on the tree after the events are applied.
    fn write_tree<C, T>(
        &self,
        conversation_id: &ConversationId,
        user: &UserId,
        capability: Capability,
        plan: impl FnOnce(&TreeState) -> Result<Option<(Vec<TreeEvent>, C)>>,
        materialize: impl FnOnce(&TreeState, C) -> T,
    ) -> Result<Option<T>> {
        self.with_conversation_write_lock(conversation_id, || {
            let conn = self.conn()?;
            let row = self
                .authorize(&conn, conversation_id, user, capability)?
                .ok_or_else(|| StoreError::ConversationNotFound(conversation_id.to_string()))?;
            let handle = self.handle_locked(&conn, &row)?;

            // Fold into a copy first so the counters commit with the events.
            let planned = {
                let state = handle.read();
                match plan(&state)? {
                    Some((events, context)) => Some((events, context, TreeState::clone(&state))),
                    None => None,
                }
            };
            let Some((events, context, mut next)) = planned else {
                return Ok(None);
            };
            for event in &events {
                if let Err(e) = next.apply(event) {
                    error!(
                        conversation_id = %conversation_id,
                        event_type = %event.event_type(),
                        error = %e,
                        "planned event failed to apply"
                    );
                    return Err(StoreError::Internal(format!("planned event does not apply: {e}")));
                }
            }

            let (message_count, branch_count) = (count(next.message_count()), count(next.branch_count()));
            self.retry_on_sqlite_busy(|| {
                let tx = conn.unchecked_transaction()?;
                let _ = EventLog::append_batch(&tx, conversation_id, &events)?;
                let _ = ConversationRepo::set_tree_counters(&tx, conversation_id.as_str(), message_count, branch_count)?;
                tx.commit()?;
                Ok(())
            })?;

            let result = materialize(&next, context);
            *handle.write() = next;

            debug!(
                conversation_id = %conversation_id,
                events = events.len(),
                first_type = %events.first().map_or("none", |e| e.event_type().as_str()),
                "tree mutation committed"
            );
            Ok(Some(result))
        })
    }

    // ─────────────────────────────────────────────────────────────────────
    // Conversation lifecycle
    // ─────────────────────────────────────────────────────────────────────

    /// Create an empty conversation owned by `owner`.
    #[instrument(skip_all, fields(owner = %owner, format = %options.format))]
    pub fn create_conversation(&self, owner: &UserId, options: NewConversation) -> Result<ConversationRow> {
        let id = ConversationId::new();
        let settings = options.settings.as_ref().map(serde_json::to_string).transpose()?;
        let conn = self.conn()?;
        let row = self.retry_on_sqlite_busy(|| {
            ConversationRepo::create(
                &conn,
                &CreateConversationOptions {
                    id: &id,
                    owner_user_id: owner,
                    title: &options.title,
                    format: options.format.as_str(),
                    settings: settings.as_deref(),
                    ..Default::default()
                },
            )
        })?;
        let _ = self.cache.insert(TreeState::new(id.clone(), options.format));
        info!(conversation_id = %id, "conversation created");
        Ok(row)
    }

    /// Conversation metadata if `user` may read it.
    pub fn get_conversation(&self, conversation_id: &ConversationId, user: &UserId) -> Result<Option<ConversationRow>> {
        let conn = self.conn()?;
        self.authorize(&conn, conversation_id, user, Capability::Read)
    }

    /// Conversations owned by or shared with `user`.
    pub fn list_conversations(
        &self,
        user: &UserId,
        options: &ListConversationsOptions,
    ) -> Result<Vec<ConversationRow>> {
        let conn = self.conn()?;
        ConversationRepo::list_for_user(&conn, user, options)
    }

    /// Change the title. Owner only; `false` if the conversation does not exist.
    #[instrument(skip_all, fields(conversation_id = %conversation_id))]
    pub fn rename_conversation(&self, conversation_id: &ConversationId, user: &UserId, title: &str) -> Result<bool> {
        let conn = self.conn()?;
        if self.authorize(&conn, conversation_id, user, Capability::Own)?.is_none() {
            return Ok(false);
        }
        self.retry_on_sqlite_busy(|| ConversationRepo::update_title(&conn, conversation_id, title))
    }

    /// Replace the settings object. Owner only.
    pub fn update_conversation_settings(
        &self,
        conversation_id: &ConversationId,
        user: &UserId,
        settings: &Value,
    ) -> Result<bool> {
        let conn = self.conn()?;
        if self.authorize(&conn, conversation_id, user, Capability::Own)?.is_none() {
            return Ok(false);
        }
        let encoded = serde_json::to_string(settings)?;
        self.retry_on_sqlite_busy(|| ConversationRepo::update_settings(&conn, conversation_id, &encoded))
    }

    /// Archive or unarchive. Owner only.
    #[instrument(skip_all, fields(conversation_id = %conversation_id))]
    pub fn archive_conversation(&self, conversation_id: &ConversationId, user: &UserId, archived: bool) -> Result<bool> {
        let conn = self.conn()?;
        if self.authorize(&conn, conversation_id, user, Capability::Own)?.is_none() {
            return Ok(false);
        }
        self.retry_on_sqlite_busy(|| ConversationRepo::set_archived(&conn, conversation_id, archived))
    }

    /// Permanently delete the conversation with its log, backups and grants.
    /// Owner only.
    #[instrument(skip_all, fields(conversation_id = %conversation_id))]
    pub fn delete_conversation(&self, conversation_id: &ConversationId, user: &UserId) -> Result<bool> {
        let deleted = self.with_conversation_write_lock(conversation_id, || {
            let conn = self.conn()?;
            if self.authorize(&conn, conversation_id, user, Capability::Own)?.is_none() {
                return Ok(false);
            }
            let deleted = self.retry_on_sqlite_busy(|| ConversationRepo::delete(&conn, conversation_id))?;
            let _ = self.cache.unload(conversation_id);
            Ok(deleted)
        })?;
        if deleted {
            self.remove_conversation_write_lock(conversation_id)?;
            info!("conversation deleted");
        }
        Ok(deleted)
    }
}

fn access_of(conn: &rusqlite::Connection, row: &ConversationRow, user: &UserId) -> Result<Option<Access>> {
    if row.owner_user_id == user.as_str() {
        return Ok(Some(Access::Owner));
    }
    Ok(CollaboratorRepo::get(conn, &row.id, user)?.map(|c| Access::Granted(c.permission_level())))
}

fn count(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
