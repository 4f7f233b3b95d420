//! SQLite implementation of `SpaceRepository`.
//!
//! This provides persistent storage that survives service restarts.
//!
//! # Schema Versioning
//!
//! The database has a `schema_version` table that tracks the schema version.
//! When the schema needs to change, increment `CURRENT_SCHEMA_VERSION` and add
//! a migration in `run_migrations()`. Migrations run sequentially from the
//! current version to the target version.
//!
//! # Occupancy
//!
//! Partial unique indexes back the two request invariants, so a conflicting
//! write fails with a constraint violation even if a caller skipped the
//! in-process checks.

mod messages;


use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use plotshare_core::{
    ChatMessage, RequestId, RequestStatus, Space, SpaceId, SpaceRequest, UserId,
};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use tracing::warn;

use super::{
    timestamp_now, Conflict, NewChatMessage, NewSpaceRequest, RepositoryError, SpaceRepository,
    StatusUpdate,
};

/// Current schema version. Increment this when making schema changes and add
/// corresponding migration logic in `run_migrations()`.
const CURRENT_SCHEMA_VERSION: i64 = 1;

const REQUEST_COLUMNS: &str = "id, space_id, gardener_id, owner_id, status, message, \
                               created_at, started_at, finished_at";

/// SQLite-backed space repository.
///
/// Uses `tokio::task::spawn_blocking` to run synchronous rusqlite operations
/// without blocking the async runtime.
pub struct SqliteRepository {
    pub(crate) conn: Arc<Mutex<Connection>>,
}

impl SqliteRepository {
    /// Create a new SQLite repository at the given path.
    ///
    /// Creates the database file and schema if they don't exist.
    /// Runs any pending migrations if the database exists but has an older schema.
    ///
    /// # Durability
    ///
    /// The database is configured with:
    /// - `journal_mode = WAL` for better concurrency and crash safety
    /// - `synchronous = FULL` so a committed transition survives power loss
    /// - `busy_timeout = 5000ms` to handle concurrent access gracefully
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, RepositoryError> {
        let path_ref = path.as_ref();
        let path_str = path_ref.to_string_lossy();
        let is_in_memory = path_str == ":memory:";

        if !is_in_memory && !path_str.is_empty() {
            if let Some(parent) = path_ref.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).map_err(|e| {
                        RepositoryError::storage(
                            "create database directory",
                            format!("{}: {}", parent.display(), e),
                        )
                    })?;
                }
            }
        }

        let conn = Connection::open(path_ref)
            .map_err(|e| RepositoryError::storage("open database", e.to_string()))?;

        // SQLite can silently keep DELETE mode on filesystems without shared
        // memory support. In-memory databases report "memory".
        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))
            .map_err(|e| RepositoryError::storage("set journal_mode", e.to_string()))?;
        let journal_mode_ok = journal_mode.eq_ignore_ascii_case("wal")
            || (is_in_memory && journal_mode.eq_ignore_ascii_case("memory"));
        if !journal_mode_ok {
            return Err(RepositoryError::storage(
                "configure journal_mode",
                format!(
                    "Failed to enable WAL mode: SQLite returned '{}' instead of 'wal'",
                    journal_mode
                ),
            ));
        }

        conn.execute_batch(
            r#"
            PRAGMA synchronous = FULL;
            PRAGMA busy_timeout = 5000;
            PRAGMA foreign_keys = ON;
            "#,
        )
        .map_err(|e| RepositoryError::storage("configure pragmas", e.to_string()))?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS schema_version (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                version INTEGER NOT NULL
            );
            "#,
        )
        .map_err(|e| RepositoryError::storage("create schema_version table", e.to_string()))?;

        let current_version: i64 = conn
            .query_row(
                "SELECT version FROM schema_version WHERE id = 1",
                [],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| RepositoryError::storage("get schema version", e.to_string()))?
            .unwrap_or(0);

        Self::run_migrations(&conn, current_version)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run migrations from `from_version` to `CURRENT_SCHEMA_VERSION`.
    fn run_migrations(conn: &Connection, from_version: i64) -> Result<(), RepositoryError> {
        if from_version > CURRENT_SCHEMA_VERSION {
            return Err(RepositoryError::storage(
                "schema version",
                format!(
                    "Database schema version {} is newer than supported version {}. \
                     Please upgrade the application.",
                    from_version, CURRENT_SCHEMA_VERSION
                ),
            ));
        }

        if from_version == CURRENT_SCHEMA_VERSION {
            return Ok(());
        }

        if from_version < 1 {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS spaces (
                    id TEXT PRIMARY KEY,
                    owner_id TEXT NOT NULL,
                    title TEXT NOT NULL,
                    created_at INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_spaces_owner
                    ON spaces(owner_id, created_at);

                CREATE TABLE IF NOT EXISTS space_requests (
                    id TEXT PRIMARY KEY,
                    space_id TEXT NOT NULL REFERENCES spaces(id),
                    gardener_id TEXT NOT NULL,
                    owner_id TEXT NOT NULL,
                    status TEXT NOT NULL,
                    message TEXT,
                    created_at INTEGER NOT NULL,
                    started_at INTEGER,
                    finished_at INTEGER
                );
                CREATE UNIQUE INDEX IF NOT EXISTS idx_one_active_per_space
                    ON space_requests(space_id) WHERE status = 'active';
                CREATE UNIQUE INDEX IF NOT EXISTS idx_one_open_per_gardener
                    ON space_requests(space_id, gardener_id)
                    WHERE status IN ('pending', 'approved', 'active');
                CREATE INDEX IF NOT EXISTS idx_requests_gardener
                    ON space_requests(gardener_id, created_at DESC);
                CREATE INDEX IF NOT EXISTS idx_requests_space_status
                    ON space_requests(space_id, status);

                CREATE TABLE IF NOT EXISTS chat_messages (
                    seq INTEGER PRIMARY KEY AUTOINCREMENT,
                    id TEXT NOT NULL UNIQUE,
                    request_id TEXT NOT NULL,
                    sender_id TEXT NOT NULL,
                    body TEXT NOT NULL,
                    kind TEXT NOT NULL CHECK (kind IN ('human', 'system')),
                    created_at INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_messages_request
                    ON chat_messages(request_id, created_at, seq);
                "#,
            )
            .map_err(|e| RepositoryError::storage("migration v1", e.to_string()))?;
        }

        conn.execute(
            "INSERT OR REPLACE INTO schema_version (id, version) VALUES (1, ?1)",
            params![CURRENT_SCHEMA_VERSION],
        )
        .map_err(|e| RepositoryError::storage("update schema version", e.to_string()))?;

        Ok(())
    }

    /// Create a new in-memory SQLite repository (for testing).
    pub fn new_in_memory() -> Result<Self, RepositoryError> {
        Self::new(":memory:")
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, operation: &'static str, f: F) -> Result<T, RepositoryError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, RepositoryError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = lock(&conn, operation)?;
            f(&mut conn)
        })
        .await
        .map_err(|e| RepositoryError::storage(operation, e.to_string()))?
    }
}

fn lock<'a>(
    conn: &'a Mutex<Connection>,
    operation: &'static str,
) -> Result<MutexGuard<'a, Connection>, RepositoryError> {
    conn.lock()
        .map_err(|_| RepositoryError::storage(operation, "connection mutex poisoned"))
}

// =============================================================================
// Row conversion helpers
// =============================================================================

pub(super) fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(super) fn from_millis(
    value: i64,
    what: &'static str,
) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::from_timestamp_millis(value).ok_or(RepositoryError::corruption(what))
}

pub(super) fn parse_uuid(value: &str, what: &'static str) -> Result<uuid::Uuid, RepositoryError> {
    uuid::Uuid::parse_str(value).map_err(|_| RepositoryError::corruption(what))
}

pub(super) fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation
    )
}

/// Raw `space_requests` row, read inside the rusqlite closure and converted
/// afterwards so conversion errors become `RepositoryError`s.
struct RequestRow {
    id: String,
    space_id: String,
    gardener_id: String,
    owner_id: String,
    status: String,
    message: Option<String>,
    created_at: i64,
    started_at: Option<i64>,
    finished_at: Option<i64>,
}

impl RequestRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            space_id: row.get(1)?,
            gardener_id: row.get(2)?,
            owner_id: row.get(3)?,
            status: row.get(4)?,
            message: row.get(5)?,
            created_at: row.get(6)?,
            started_at: row.get(7)?,
            finished_at: row.get(8)?,
        })
    }

    fn into_request(self) -> Result<SpaceRequest, RepositoryError> {
        let status: RequestStatus = self
            .status
            .parse()
            .map_err(|_| RepositoryError::corruption("request status"))?;
        Ok(SpaceRequest {
            id: RequestId(parse_uuid(&self.id, "request id")?),
            space_id: SpaceId(parse_uuid(&self.space_id, "space id")?),
            gardener_id: UserId(self.gardener_id),
            owner_id: UserId(self.owner_id),
            status,
            message: self.message,
            created_at: from_millis(self.created_at, "request created_at")?,
            started_at: self
                .started_at
                .map(|v| from_millis(v, "request started_at"))
                .transpose()?,
            finished_at: self
                .finished_at
                .map(|v| from_millis(v, "request finished_at"))
                .transpose()?,
        })
    }
}

fn select_request(
    conn: &Connection,
    id: &str,
    operation: &'static str,
) -> Result<Option<SpaceRequest>, RepositoryError> {
    let row = conn
        .query_row(
            &format!("SELECT {REQUEST_COLUMNS} FROM space_requests WHERE id = ?1"),
            params![id],
            RequestRow::read,
        )
        .optional()
        .map_err(|e| RepositoryError::storage(operation, e.to_string()))?;
    row.map(RequestRow::into_request).transpose()
}

/// Run a request query and convert every row, skipping rows that fail to
/// convert so one corrupt record does not hide the rest of a listing.
fn select_requests(
    conn: &Connection,
    sql: &str,
    param: &str,
    operation: &'static str,
) -> Result<Vec<SpaceRequest>, RepositoryError> {
    let mut stmt = conn
        .prepare(sql)
        .map_err(|e| RepositoryError::storage(operation, e.to_string()))?;
    let rows = stmt
        .query_map(params![param], RequestRow::read)
        .map_err(|e| RepositoryError::storage(operation, e.to_string()))?;

    let mut results = Vec::new();
    for row in rows {
        let row = row.map_err(|e| RepositoryError::storage(operation, e.to_string()))?;
        let id = row.id.clone();
        match row.into_request() {
            Ok(request) => results.push(request),
            Err(e) => warn!("Skipping corrupt space request {} in {}: {}", id, operation, e),
        }
    }
    Ok(results)
}

fn count_requests(
    conn: &Connection,
    space_id: &str,
    status: RequestStatus,
    operation: &'static str,
) -> Result<usize, RepositoryError> {
    let count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM space_requests WHERE space_id = ?1 AND status = ?2",
            params![space_id, status.as_str()],
            |row| row.get(0),
        )
        .map_err(|e| RepositoryError::storage(operation, e.to_string()))?;
    usize::try_from(count).map_err(|_| RepositoryError::corruption("request count"))
}

// =============================================================================
// SpaceRepository trait implementation
// =============================================================================

#[async_trait]
impl SpaceRepository for SqliteRepository {
    async fn put_space(&self, space: Space) -> Result<Space, RepositoryError> {
        self.with_conn("put_space", move |conn| {
            let created_at: i64 = conn
                .query_row(
                    "INSERT INTO spaces (id, owner_id, title, created_at)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(id) DO UPDATE SET
                         owner_id = excluded.owner_id,
                         title = excluded.title
                     RETURNING created_at",
                    params![
                        space.id.to_string(),
                        space.owner_id.0,
                        space.title,
                        to_millis(space.created_at)
                    ],
                    |row| row.get(0),
                )
                .map_err(|e| RepositoryError::storage("put_space", e.to_string()))?;
            Ok(Space {
                created_at: from_millis(created_at, "space created_at")?,
                ..space
            })
        })
        .await
    }

    async fn get_space(&self, id: &SpaceId) -> Result<Option<Space>, RepositoryError> {
        let id = id.to_string();
        self.with_conn("get_space", move |conn| {
            let row: Option<(String, String, String, i64)> = conn
                .query_row(
                    "SELECT id, owner_id, title, created_at FROM spaces WHERE id = ?1",
                    params![id],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
                )
                .optional()
                .map_err(|e| RepositoryError::storage("get_space", e.to_string()))?;

            row.map(|(id, owner_id, title, created_at)| {
                Ok(Space {
                    id: SpaceId(parse_uuid(&id, "space id")?),
                    owner_id: UserId(owner_id),
                    title,
                    created_at: from_millis(created_at, "space created_at")?,
                })
            })
            .transpose()
        })
        .await
    }

    async fn list_spaces_for_owner(&self, owner: &UserId) -> Result<Vec<Space>, RepositoryError> {
        let owner = owner.0.clone();
        self.with_conn("list_spaces_for_owner", move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, owner_id, title, created_at FROM spaces
                     WHERE owner_id = ?1 ORDER BY created_at ASC, rowid ASC",
                )
                .map_err(|e| RepositoryError::storage("list_spaces_for_owner", e.to_string()))?;
            let rows = stmt
                .query_map(params![owner], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                })
                .map_err(|e| RepositoryError::storage("list_spaces_for_owner", e.to_string()))?;

            let mut spaces = Vec::new();
            for row in rows {
                let (id, owner_id, title, created_at) = row.map_err(|e| {
                    RepositoryError::storage("list_spaces_for_owner row", e.to_string())
                })?;
                spaces.push(Space {
                    id: SpaceId(parse_uuid(&id, "space id")?),
                    owner_id: UserId(owner_id),
                    title,
                    created_at: from_millis(created_at, "space created_at")?,
                });
            }
            Ok(spaces)
        })
        .await
    }

    async fn get_request(&self, id: &RequestId) -> Result<Option<SpaceRequest>, RepositoryError> {
        let id = id.to_string();
        self.with_conn("get_request", move |conn| {
            select_request(conn, &id, "get_request")
        })
        .await
    }

    async fn create_request(&self, new: NewSpaceRequest) -> Result<SpaceRequest, RepositoryError> {
        let request = SpaceRequest {
            id: RequestId::new(),
            space_id: new.space_id,
            gardener_id: new.gardener_id,
            owner_id: new.owner_id,
            status: RequestStatus::Pending,
            message: new.message,
            created_at: timestamp_now(),
            started_at: None,
            finished_at: None,
        };

        self.with_conn("create_request", move |conn| {
            let result = conn.execute(
                "INSERT INTO space_requests (id, space_id, gardener_id, owner_id, status,
                                             message, created_at, started_at, finished_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, NULL, NULL)",
                params![
                    request.id.to_string(),
                    request.space_id.to_string(),
                    request.gardener_id.0,
                    request.owner_id.0,
                    request.status.as_str(),
                    request.message,
                    to_millis(request.created_at)
                ],
            );
            match result {
                Ok(_) => Ok(request),
                Err(e) if is_constraint_violation(&e) => {
                    // Either the open-request index or the space foreign key.
                    let space_exists: bool = conn
                        .query_row(
                            "SELECT EXISTS(SELECT 1 FROM spaces WHERE id = ?1)",
                            params![request.space_id.to_string()],
                            |row| row.get(0),
                        )
                        .map_err(|e| RepositoryError::storage("create_request", e.to_string()))?;
                    if space_exists {
                        Err(RepositoryError::Conflict(Conflict::OpenRequestExists))
                    } else {
                        Err(RepositoryError::NotFound { what: "space" })
                    }
                }
                Err(e) => Err(RepositoryError::storage("create_request", e.to_string())),
            }
        })
        .await
    }

    async fn update_status(&self, update: StatusUpdate) -> Result<SpaceRequest, RepositoryError> {
        let id = update.request_id.to_string();

        self.with_conn("update_status", move |conn| {
            let tx = conn
                .transaction()
                .map_err(|e| RepositoryError::storage("update_status begin", e.to_string()))?;

            let result = tx.execute(
                "UPDATE space_requests
                 SET status = ?1,
                     started_at = COALESCE(?2, started_at),
                     finished_at = COALESCE(?3, finished_at)
                 WHERE id = ?4 AND status = ?5",
                params![
                    update.status.as_str(),
                    update.started_at.map(to_millis),
                    update.finished_at.map(to_millis),
                    id,
                    update.expected.as_str()
                ],
            );

            let changed = match result {
                Ok(changed) => changed,
                Err(e) if is_constraint_violation(&e) => {
                    return Err(RepositoryError::Conflict(Conflict::SpaceOccupied));
                }
                Err(e) => return Err(RepositoryError::storage("update_status", e.to_string())),
            };

            let current = select_request(&tx, &id, "update_status")?.ok_or(
                RepositoryError::NotFound {
                    what: "space request",
                },
            )?;
            if changed == 0 {
                return Err(RepositoryError::Conflict(Conflict::StatusChanged {
                    expected: update.expected,
                    actual: current.status,
                }));
            }

            tx.commit()
                .map_err(|e| RepositoryError::storage("update_status commit", e.to_string()))?;
            Ok(current)
        })
        .await
    }

    async fn count_active_for_space(&self, space_id: &SpaceId) -> Result<usize, RepositoryError> {
        let space_id = space_id.to_string();
        self.with_conn("count_active_for_space", move |conn| {
            count_requests(
                conn,
                &space_id,
                RequestStatus::Active,
                "count_active_for_space",
            )
        })
        .await
    }

    async fn count_pending_for_space(&self, space_id: &SpaceId) -> Result<usize, RepositoryError> {
        let space_id = space_id.to_string();
        self.with_conn("count_pending_for_space", move |conn| {
            count_requests(
                conn,
                &space_id,
                RequestStatus::Pending,
                "count_pending_for_space",
            )
        })
        .await
    }

    async fn list_requests_for_gardener(
        &self,
        gardener: &UserId,
    ) -> Result<Vec<SpaceRequest>, RepositoryError> {
        let gardener = gardener.0.clone();
        self.with_conn("list_requests_for_gardener", move |conn| {
            select_requests(
                conn,
                &format!(
                    "SELECT {REQUEST_COLUMNS} FROM space_requests
                     WHERE gardener_id = ?1 ORDER BY created_at DESC, rowid DESC"
                ),
                &gardener,
                "list_requests_for_gardener",
            )
        })
        .await
    }

    async fn list_requests_for_space(
        &self,
        space_id: &SpaceId,
    ) -> Result<Vec<SpaceRequest>, RepositoryError> {
        let space_id = space_id.to_string();
        self.with_conn("list_requests_for_space", move |conn| {
            select_requests(
                conn,
                &format!(
                    "SELECT {REQUEST_COLUMNS} FROM space_requests
                     WHERE space_id = ?1 ORDER BY created_at DESC, rowid DESC"
                ),
                &space_id,
                "list_requests_for_space",
            )
        })
        .await
    }

    // =========================================================================
    // Chat log - delegated to messages module
    // =========================================================================

    async fn append_message(&self, new: NewChatMessage) -> Result<ChatMessage, RepositoryError> {
        self.append_message_impl(new).await
    }

    async fn list_messages(
        &self,
        request_id: &RequestId,
    ) -> Result<Vec<ChatMessage>, RepositoryError> {
        self.list_messages_impl(request_id).await
    }
}
