//! Persistent local remote on SQLite.
//!
//! Runtime defaults:
//! - `journal_mode = WAL` so readers never block the writer
//! - `busy_timeout = 5s` to ride out transient lock contention
//! - `foreign_keys = ON` so deleting a perspective drops its links
//!
//! Entities and perspective state share one connection. A mutation is applied
//! inside a single transaction; any failed precondition rolls it back.

pub mod migrations;
pub mod schema;

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, Transaction, params};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, instrument};

use super::{RemoteEvees, apply_update, build_slice, children_delta};
use crate::cas::{CasStore, verify_all};
use crate::client::{Client, EVENTS_CAPACITY};
use crate::error::{EveesError, Result};
use crate::hash::Hasher;
use crate::model::{
    Commit, Entity, EntityCreate, EveesMutation, GetPerspectiveOptions, PerspectiveDetails,
    PerspectiveGetResult,
};

/// Busy timeout used for every connection.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Open (or create) the database, apply pragmas and migrate.
///
/// # Errors
///
/// Returns an error if the directory cannot be created or opening,
/// configuring or migrating the database fails.
pub fn open_database(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut conn = Connection::open(path)?;
    configure_connection(&conn)?;
    migrations::migrate(&mut conn)?;
    Ok(conn)
}

fn configure_connection(conn: &Connection) -> rusqlite::Result<()> {
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    let _journal_mode: String =
        conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
    conn.busy_timeout(DEFAULT_BUSY_TIMEOUT)?;
    Ok(())
}

type SharedConnection = Arc<Mutex<Connection>>;

// ---------------------------------------------------------------------------
// SqliteStore
// ---------------------------------------------------------------------------

/// Content store over the `entities` table. Writes are durable on return.
pub struct SqliteStore {
    conn: SharedConnection,
    hasher: Hasher,
}

impl SqliteStore {
    fn insert(&self, entities: &[Entity]) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt =
                tx.prepare_cached("INSERT OR IGNORE INTO entities (id, object) VALUES (?1, ?2)")?;
            for entity in entities {
                stmt.execute(params![entity.id, serde_json::to_string(&entity.object)?])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn select(&self, hashes: &[String]) -> Result<Vec<Entity>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached("SELECT object FROM entities WHERE id = ?1")?;
        let mut found = Vec::with_capacity(hashes.len());
        for hash in hashes {
            let object: Option<String> = stmt
                .query_row(params![hash], |row| row.get(0))
                .optional()?;
            if let Some(object) = object {
                found.push(Entity {
                    id: hash.clone(),
                    object: serde_json::from_str(&object)?,
                });
            }
        }
        Ok(found)
    }
}

#[async_trait]
impl CasStore for SqliteStore {
    async fn cache_entities(&self, entities: Vec<Entity>) -> Result<()> {
        let verified = verify_all(
            &self.hasher,
            entities.into_iter().map(EntityCreate::from).collect(),
        )?;
        self.insert(&verified)
    }

    async fn store_entities(&self, objects: Vec<EntityCreate>) -> Result<Vec<Entity>> {
        let entities = verify_all(&self.hasher, objects)?;
        self.insert(&entities)?;
        Ok(entities)
    }

    async fn hash_entities(&self, objects: Vec<Value>) -> Result<Vec<Entity>> {
        verify_all(
            &self.hasher,
            objects.into_iter().map(EntityCreate::from).collect(),
        )
    }

    async fn get_entities(&self, hashes: &[String]) -> Result<Vec<Entity>> {
        self.select(hashes)
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// SqliteRemote
// ---------------------------------------------------------------------------

pub struct SqliteRemote {
    id: String,
    hasher: Hasher,
    conn: SharedConnection,
    store: Arc<SqliteStore>,
    user: Mutex<Option<String>>,
    events: broadcast::Sender<Vec<String>>,
}

impl std::fmt::Debug for SqliteRemote {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteRemote")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl SqliteRemote {
    /// Open the database at `path` as remote `id`.
    ///
    /// # Errors
    ///
    /// See [`open_database`].
    pub fn open(path: &Path, id: impl Into<String>, hasher: Hasher) -> Result<Self> {
        Ok(Self::from_connection(open_database(path)?, id, hasher))
    }

    /// In-memory database, migrated.
    ///
    /// # Errors
    ///
    /// Returns an error if configuring or migrating fails.
    pub fn open_in_memory(id: impl Into<String>, hasher: Hasher) -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        migrations::migrate(&mut conn)?;
        Ok(Self::from_connection(conn, id, hasher))
    }

    fn from_connection(conn: Connection, id: impl Into<String>, hasher: Hasher) -> Self {
        let conn = Arc::new(Mutex::new(conn));
        let (events, _) = broadcast::channel(EVENTS_CAPACITY);
        Self {
            id: id.into(),
            hasher,
            store: Arc::new(SqliteStore {
                conn: Arc::clone(&conn),
                hasher,
            }),
            conn,
            user: Mutex::new(None),
            events,
        }
    }

    /// Perspectives registered under `context`, sorted by id.
    pub fn perspectives_with_context(&self, context: &str) -> Result<Vec<String>> {
        self.ids("SELECT id FROM perspectives WHERE context = ?1 ORDER BY id", context)
    }

    /// Perspectives whose head commit points at `data_id`, sorted by id.
    pub fn perspectives_with_data(&self, data_id: &str) -> Result<Vec<String>> {
        self.ids("SELECT id FROM perspectives WHERE data_id = ?1 ORDER BY id", data_id)
    }

    /// Perspectives linking `child_id` as a child, sorted by id.
    pub fn ecosystem_parents(&self, child_id: &str) -> Result<Vec<String>> {
        self.ids(
            "SELECT perspective_id FROM ecosystem WHERE child_id = ?1 ORDER BY perspective_id",
            child_id,
        )
    }

    /// Children of `perspective_id`, in link order.
    pub fn children_of(&self, perspective_id: &str) -> Result<Vec<String>> {
        self.ids(
            "SELECT child_id FROM ecosystem WHERE perspective_id = ?1 ORDER BY position",
            perspective_id,
        )
    }

    fn ids(&self, sql: &str, key: &str) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(sql)?;
        let rows = stmt.query_map(params![key], |row| row.get::<_, String>(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn details(&self, perspective_id: &str) -> Result<Option<PerspectiveDetails>> {
        let conn = self.conn.lock();
        Ok(read_details(&conn, perspective_id)?)
    }

    fn can_update_as(&self, perspective_id: &str, user_id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare_cached("SELECT creator_id, guardian_id FROM perspectives WHERE id = ?1")?;
        let mut visited = HashSet::new();
        let mut current = Some(perspective_id.to_string());
        while let Some(id) = current {
            if !visited.insert(id.clone()) {
                break;
            }
            let row: Option<(String, Option<String>)> = stmt
                .query_row(params![id], |row| Ok((row.get(0)?, row.get(1)?)))
                .optional()?;
            let Some((creator, guardian)) = row else {
                break;
            };
            if creator == user_id {
                return Ok(true);
            }
            current = guardian;
        }
        Ok(false)
    }

    #[instrument(level = "debug", skip_all, fields(remote = %self.id))]
    fn apply(&self, mutation: &EveesMutation) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        for new_perspective in &mutation.new_perspectives {
            let perspective = &new_perspective.perspective;
            tx.execute(
                "INSERT OR IGNORE INTO perspectives (id, context, remote, creator_id)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    perspective.id,
                    perspective.object.context,
                    perspective.object.remote,
                    perspective.object.creator_id
                ],
            )?;
        }

        let updates = mutation
            .new_perspectives
            .iter()
            .filter_map(|np| np.update.as_ref())
            .chain(&mutation.updates);
        let mut staged: HashMap<String, PerspectiveDetails> = HashMap::new();
        for update in updates {
            let id = &update.perspective_id;
            if !staged.contains_key(id) {
                let current = read_details(&tx, id)?
                    .ok_or_else(|| EveesError::PerspectiveNotFound(id.clone()))?;
                staged.insert(id.clone(), current);
            }
            if let Some(details) = staged.get_mut(id) {
                apply_update(details, update)?;
            }
            if let Some(delta) = children_delta(update) {
                apply_children(&tx, id, &delta.removed, &delta.added)?;
            }
        }

        for (id, details) in &staged {
            let data_id = match &details.head_id {
                Some(head) => head_data_id(&tx, head)?,
                None => None,
            };
            tx.execute(
                "UPDATE perspectives SET head_id = ?2, guardian_id = ?3, data_id = ?4 WHERE id = ?1",
                params![id, details.head_id, details.guardian_id, data_id],
            )?;
        }

        for perspective_id in &mutation.deleted_perspectives {
            tx.execute("DELETE FROM perspectives WHERE id = ?1", params![perspective_id])?;
        }

        tx.commit()?;
        Ok(())
    }
}

fn read_details(conn: &Connection, perspective_id: &str) -> rusqlite::Result<Option<PerspectiveDetails>> {
    conn.query_row(
        "SELECT head_id, guardian_id FROM perspectives WHERE id = ?1",
        params![perspective_id],
        |row| {
            Ok(PerspectiveDetails {
                head_id: row.get(0)?,
                guardian_id: row.get(1)?,
                can_update: None,
            })
        },
    )
    .optional()
}

fn apply_children(
    tx: &Transaction<'_>,
    perspective_id: &str,
    removed: &[String],
    added: &[String],
) -> rusqlite::Result<()> {
    for child in removed {
        tx.execute(
            "DELETE FROM ecosystem WHERE perspective_id = ?1 AND child_id = ?2",
            params![perspective_id, child],
        )?;
    }
    for child in added {
        tx.execute(
            "INSERT OR IGNORE INTO ecosystem (perspective_id, child_id, position)
             SELECT ?1, ?2, COALESCE(MAX(position) + 1, 0) FROM ecosystem WHERE perspective_id = ?1",
            params![perspective_id, child],
        )?;
    }
    Ok(())
}

/// `dataId` of a stored head commit; `None` if the commit is not stored here.
fn head_data_id(conn: &Connection, head_id: &str) -> Result<Option<String>> {
    let object: Option<String> = conn
        .query_row(
            "SELECT object FROM entities WHERE id = ?1",
            params![head_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(object
        .and_then(|raw| serde_json::from_str::<Commit>(&raw).ok())
        .map(|commit| commit.data_id))
}

#[async_trait]
impl Client for SqliteRemote {
    fn store(&self) -> Arc<dyn CasStore> {
        self.store.clone()
    }

    fn subscribe(&self) -> broadcast::Receiver<Vec<String>> {
        self.events.subscribe()
    }

    async fn get_perspective(
        &self,
        perspective_id: &str,
        options: GetPerspectiveOptions,
    ) -> Result<PerspectiveGetResult> {
        let mut details = self
            .details(perspective_id)?
            .ok_or_else(|| EveesError::PerspectiveNotFound(perspective_id.to_string()))?;
        let user = self.user_id();
        details.can_update = Some(match user {
            Some(user) => self.can_update_as(perspective_id, &user)?,
            None => false,
        });

        let depth = options.depth();
        let slice = if depth == 0 {
            None
        } else {
            Some(
                build_slice(self.store.as_ref(), perspective_id, depth, |id| {
                    Ok((self.details(id)?, self.children_of(id)?))
                })
                .await?,
            )
        };
        Ok(PerspectiveGetResult { details, slice })
    }

    async fn update(&self, mutation: EveesMutation) -> Result<()> {
        let mut entities: Vec<Entity> = mutation.entities.clone();
        for new_perspective in &mutation.new_perspectives {
            entities.push(new_perspective.perspective.erase()?);
        }
        if !entities.is_empty() {
            self.store
                .store_entities(entities.into_iter().map(EntityCreate::from).collect())
                .await?;
        }

        self.apply(&mutation)?;

        let ids = mutation.perspective_ids();
        debug!(remote = %self.id, perspectives = ids.len(), "applied mutation");
        let _ = self.events.send(ids);
        Ok(())
    }

    async fn diff(&self) -> Result<EveesMutation> {
        Ok(EveesMutation::default())
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }

    async fn refresh(&self) -> Result<()> {
        Ok(())
    }

    async fn can_update(&self, perspective_id: &str, user_id: Option<&str>) -> Result<bool> {
        match user_id.map(str::to_string).or_else(|| self.user_id()) {
            Some(user) => self.can_update_as(perspective_id, &user),
            None => Ok(false),
        }
    }

    async fn get_user_perspectives(&self, perspective_id: &str) -> Result<Vec<String>> {
        let Some(user) = self.user_id() else {
            return Ok(Vec::new());
        };
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT other.id FROM perspectives AS this
             JOIN perspectives AS other ON other.context = this.context
             WHERE this.id = ?1 AND other.id <> ?1 AND other.creator_id = ?2
             ORDER BY other.id",
        )?;
        let rows = stmt.query_map(params![perspective_id, user], |row| row.get::<_, String>(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

#[async_trait]
impl RemoteEvees for SqliteRemote {
    fn id(&self) -> &str {
        &self.id
    }

    fn hasher(&self) -> Hasher {
        self.hasher
    }

    fn user_id(&self) -> Option<String> {
        self.user.lock().clone()
    }

    fn as_client(self: Arc<Self>) -> Arc<dyn Client> {
        self
    }

    async fn login(&self, user_id: &str) -> Result<()> {
        *self.user.lock() = Some(user_id.to_string());
        Ok(())
    }

    async fn logout(&self) -> Result<()> {
        *self.user.lock() = None;
        Ok(())
    }
}
