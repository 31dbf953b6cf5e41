use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params};
use uuid::Uuid;

use super::schema::SCHEMA;
use super::{RepositoryCounts, Store, TaskCursor};
use crate::error::{Error, Result};
use crate::types::*;

const NODE_COLUMNS: &str = "id, uuid, index_base_url, search_base_url, last_seen_at, used_bytes, \
     total_bytes, indexed_bytes, metadata, task_failures, created_at, updated_at";
const ENABLED_NAMESPACE_COLUMNS: &str =
    "id, root_namespace_id, search, last_rollout_failed_at, created_at, updated_at";
const REPLICA_COLUMNS: &str =
    "id, zoekt_enabled_namespace_id, namespace_id, state, created_at, updated_at";
const INDEX_COLUMNS: &str = "id, zoekt_node_id, zoekt_replica_id, zoekt_enabled_namespace_id, \
     namespace_id, state, watermark_level, reserved_storage_bytes, used_storage_bytes, \
     created_at, updated_at";
const REPOSITORY_COLUMNS: &str = "id, zoekt_index_id, project_id, project_identifier, state, \
     size_bytes, indexed_at, created_at, updated_at";
const TASK_COLUMNS: &str = "id, partition_id, zoekt_node_id, zoekt_repository_id, \
     project_identifier, task_type, state, retries_left, perform_at, created_at, updated_at";
const TOKEN_COLUMNS: &str =
    "id, token_hash, token_lookup, is_admin, description, created_at, expires_at, last_used_at";

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path)?;

        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// A private in-memory database, used by tests and one-off tooling.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.initialize()?;
        Ok(store)
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Returns a guard to the underlying database connection.
    /// This allows consuming applications to execute custom SQL.
    pub fn connection(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn()
    }
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            // Handle SQLite's default datetime format: "YYYY-MM-DD HH:MM:SS"
            chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").map(|ndt| ndt.and_utc())
        })
        .unwrap_or_else(|e| {
            tracing::error!("Invalid datetime in database: '{}' - {}", s, e);
            Utc::now()
        })
}

/// Fixed-width UTC timestamps so that text comparison in SQL orders correctly.
fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

fn text_column<T>(row: &Row, idx: usize, parse: fn(&str) -> Option<T>) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    parse(&raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Text,
            format!("unexpected value '{raw}'").into(),
        )
    })
}

fn optional_datetime(row: &Row, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    Ok(row.get::<_, Option<String>>(idx)?.map(|s| parse_datetime(&s)))
}

fn node_from_row(row: &Row) -> rusqlite::Result<Node> {
    let uuid: String = row.get(1)?;
    let uuid = Uuid::parse_str(&uuid).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(1, Type::Text, Box::new(e))
    })?;
    let metadata: String = row.get(8)?;

    Ok(Node {
        id: row.get(0)?,
        uuid,
        index_base_url: row.get(2)?,
        search_base_url: row.get(3)?,
        last_seen_at: parse_datetime(&row.get::<_, String>(4)?),
        used_bytes: row.get(5)?,
        total_bytes: row.get(6)?,
        indexed_bytes: row.get(7)?,
        metadata: serde_json::from_str(&metadata).unwrap_or_default(),
        task_failures: row.get(9)?,
        created_at: parse_datetime(&row.get::<_, String>(10)?),
        updated_at: parse_datetime(&row.get::<_, String>(11)?),
    })
}

fn enabled_namespace_from_row(row: &Row) -> rusqlite::Result<EnabledNamespace> {
    Ok(EnabledNamespace {
        id: row.get(0)?,
        root_namespace_id: row.get(1)?,
        search: row.get(2)?,
        last_rollout_failed_at: optional_datetime(row, 3)?,
        created_at: parse_datetime(&row.get::<_, String>(4)?),
        updated_at: parse_datetime(&row.get::<_, String>(5)?),
    })
}

fn replica_from_row(row: &Row) -> rusqlite::Result<Replica> {
    Ok(Replica {
        id: row.get(0)?,
        zoekt_enabled_namespace_id: row.get(1)?,
        namespace_id: row.get(2)?,
        state: text_column(row, 3, ReplicaState::parse)?,
        created_at: parse_datetime(&row.get::<_, String>(4)?),
        updated_at: parse_datetime(&row.get::<_, String>(5)?),
    })
}

fn index_from_row(row: &Row) -> rusqlite::Result<Index> {
    Ok(Index {
        id: row.get(0)?,
        zoekt_node_id: row.get(1)?,
        zoekt_replica_id: row.get(2)?,
        zoekt_enabled_namespace_id: row.get(3)?,
        namespace_id: row.get(4)?,
        state: text_column(row, 5, IndexState::parse)?,
        watermark_level: text_column(row, 6, WatermarkLevel::parse)?,
        reserved_storage_bytes: row.get(7)?,
        used_storage_bytes: row.get(8)?,
        created_at: parse_datetime(&row.get::<_, String>(9)?),
        updated_at: parse_datetime(&row.get::<_, String>(10)?),
    })
}

fn repository_from_row(row: &Row) -> rusqlite::Result<Repository> {
    Ok(Repository {
        id: row.get(0)?,
        zoekt_index_id: row.get(1)?,
        project_id: row.get(2)?,
        project_identifier: row.get(3)?,
        state: text_column(row, 4, RepositoryState::parse)?,
        size_bytes: row.get(5)?,
        indexed_at: optional_datetime(row, 6)?,
        created_at: parse_datetime(&row.get::<_, String>(7)?),
        updated_at: parse_datetime(&row.get::<_, String>(8)?),
    })
}

fn task_from_row(row: &Row) -> rusqlite::Result<Task> {
    Ok(Task {
        id: row.get(0)?,
        partition_id: row.get(1)?,
        zoekt_node_id: row.get(2)?,
        zoekt_repository_id: row.get(3)?,
        project_identifier: row.get(4)?,
        task_type: text_column(row, 5, TaskType::parse)?,
        state: text_column(row, 6, TaskState::parse)?,
        retries_left: row.get(7)?,
        perform_at: parse_datetime(&row.get::<_, String>(8)?),
        created_at: parse_datetime(&row.get::<_, String>(9)?),
        updated_at: parse_datetime(&row.get::<_, String>(10)?),
    })
}

fn partition_from_row(row: &Row) -> rusqlite::Result<TaskPartition> {
    Ok(TaskPartition {
        id: row.get(0)?,
        created_at: parse_datetime(&row.get::<_, String>(1)?),
        detached_at: optional_datetime(row, 2)?,
    })
}

fn index_job_from_row(row: &Row) -> rusqlite::Result<IndexJob> {
    Ok(IndexJob {
        id: row.get(0)?,
        zoekt_index_id: row.get(1)?,
        kind: text_column(row, 2, IndexJobKind::parse)?,
        state: text_column(row, 3, IndexJobState::parse)?,
        created_at: parse_datetime(&row.get::<_, String>(4)?),
    })
}

fn token_from_row(row: &Row) -> rusqlite::Result<Token> {
    Ok(Token {
        id: row.get(0)?,
        token_hash: row.get(1)?,
        token_lookup: row.get(2)?,
        is_admin: row.get(3)?,
        description: row.get(4)?,
        created_at: parse_datetime(&row.get::<_, String>(5)?),
        expires_at: optional_datetime(row, 6)?,
        last_used_at: optional_datetime(row, 7)?,
    })
}

fn query_list<T, P>(
    conn: &Connection,
    sql: &str,
    params: P,
    map: fn(&Row) -> rusqlite::Result<T>,
) -> Result<Vec<T>>
where
    P: rusqlite::Params,
{
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, map)?;
    rows.collect::<std::result::Result<Vec<_>, _>>()
        .map_err(Error::from)
}

fn fetch_index(conn: &Connection, id: i64) -> Result<Option<Index>> {
    conn.query_row(
        &format!("SELECT {INDEX_COLUMNS} FROM zoekt_indices WHERE id = ?1"),
        params![id],
        index_from_row,
    )
    .optional()
    .map_err(Error::from)
}

fn fetch_repository_by_project(
    conn: &Connection,
    index_id: i64,
    project_identifier: i64,
) -> Result<Option<Repository>> {
    conn.query_row(
        &format!(
            "SELECT {REPOSITORY_COLUMNS} FROM zoekt_repositories
             WHERE zoekt_index_id = ?1 AND project_identifier = ?2"
        ),
        params![index_id, project_identifier],
        repository_from_row,
    )
    .optional()
    .map_err(Error::from)
}

fn fetch_enabled_namespace(conn: &Connection, id: i64) -> Result<Option<EnabledNamespace>> {
    conn.query_row(
        &format!("SELECT {ENABLED_NAMESPACE_COLUMNS} FROM zoekt_enabled_namespaces WHERE id = ?1"),
        params![id],
        enabled_namespace_from_row,
    )
    .optional()
    .map_err(Error::from)
}

fn insert_index(
    conn: &Connection,
    replica: &Replica,
    placement: &IndexPlacement,
    now: &str,
) -> Result<Index> {
    let result = conn.execute(
        "INSERT INTO zoekt_indices (zoekt_node_id, zoekt_replica_id, zoekt_enabled_namespace_id,
             namespace_id, state, reserved_storage_bytes, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
        params![
            placement.zoekt_node_id,
            replica.id,
            replica.zoekt_enabled_namespace_id,
            replica.namespace_id,
            placement.state.as_str(),
            placement.reserved_storage_bytes,
            now,
        ],
    );

    match result {
        Ok(_) => {}
        Err(e) if is_constraint_violation(&e) => {
            return Err(Error::Conflict(format!(
                "replica {} already has an index on node {}",
                replica.id, placement.zoekt_node_id
            )));
        }
        Err(e) => return Err(Error::from(e)),
    }

    fetch_index(conn, conn.last_insert_rowid())?.ok_or(Error::NotFound)
}

fn insert_replicas(
    conn: &Connection,
    enabled_namespace: &EnabledNamespace,
    placements: &[IndexPlacement],
    now: &str,
) -> Result<Vec<(Replica, Index)>> {
    let mut created = Vec::with_capacity(placements.len());

    for placement in placements {
        conn.execute(
            "INSERT INTO zoekt_replicas (zoekt_enabled_namespace_id, namespace_id, state, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)",
            params![
                enabled_namespace.id,
                enabled_namespace.root_namespace_id,
                ReplicaState::Pending.as_str(),
                now,
            ],
        )?;
        let replica = conn.query_row(
            &format!("SELECT {REPLICA_COLUMNS} FROM zoekt_replicas WHERE id = ?1"),
            params![conn.last_insert_rowid()],
            replica_from_row,
        )?;
        let index = insert_index(conn, &replica, placement, now)?;
        created.push((replica, index));
    }

    Ok(created)
}

/// SQL list of watermark levels strictly below `level`.
fn levels_below(level: WatermarkLevel) -> String {
    WatermarkLevel::ALL
        .iter()
        .filter(|l| l.severity() < level.severity())
        .map(|l| format!("'{}'", l.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

impl Store for SqliteStore {
    fn initialize(&self) -> Result<()> {
        self.conn().execute_batch(SCHEMA)?;
        Ok(())
    }

    // Settings

    fn list_settings(&self) -> Result<Vec<(String, String)>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT key, value FROM settings ORDER BY key")?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    fn put_setting(&self, key: &str, value: &str) -> Result<()> {
        self.conn().execute(
            "INSERT INTO settings (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    // Token operations

    fn create_token(&self, token: &Token) -> Result<()> {
        let result = self.conn().execute(
            "INSERT INTO tokens (id, token_hash, token_lookup, is_admin, description, created_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                token.id,
                token.token_hash,
                token.token_lookup,
                token.is_admin,
                token.description,
                format_datetime(&token.created_at),
                token.expires_at.as_ref().map(format_datetime),
            ],
        );

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_constraint_violation(&e) => Err(Error::TokenLookupCollision),
            Err(e) => Err(Error::from(e)),
        }
    }

    fn get_token_by_lookup(&self, lookup: &str) -> Result<Option<Token>> {
        self.conn()
            .query_row(
                &format!("SELECT {TOKEN_COLUMNS} FROM tokens WHERE token_lookup = ?1"),
                params![lookup],
                token_from_row,
            )
            .optional()
            .map_err(Error::from)
    }

    fn list_tokens(&self, cursor: &str, limit: i32) -> Result<Vec<Token>> {
        query_list(
            &self.conn(),
            &format!("SELECT {TOKEN_COLUMNS} FROM tokens WHERE id > ?1 ORDER BY id LIMIT ?2"),
            params![cursor, limit],
            token_from_row,
        )
    }

    fn delete_token(&self, id: &str) -> Result<bool> {
        let rows = self
            .conn()
            .execute("DELETE FROM tokens WHERE id = ?1", params![id])?;
        Ok(rows > 0)
    }

    fn update_token_last_used(&self, id: &str, now: DateTime<Utc>) -> Result<()> {
        self.conn().execute(
            "UPDATE tokens SET last_used_at = ?1 WHERE id = ?2",
            params![format_datetime(&now), id],
        )?;
        Ok(())
    }

    fn has_admin_token(&self) -> Result<bool> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM tokens WHERE is_admin = 1",
            [],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    // Mirrored namespaces, projects and subscriptions

    fn upsert_namespace(&self, ns: &Namespace) -> Result<()> {
        self.conn().execute(
            "INSERT INTO namespaces (id, parent_id, name) VALUES (?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET parent_id = excluded.parent_id, name = excluded.name",
            params![ns.id, ns.parent_id, ns.name],
        )?;
        Ok(())
    }

    fn get_namespace(&self, id: i64) -> Result<Option<Namespace>> {
        self.conn()
            .query_row(
                "SELECT id, parent_id, name FROM namespaces WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Namespace {
                        id: row.get(0)?,
                        parent_id: row.get(1)?,
                        name: row.get(2)?,
                    })
                },
            )
            .optional()
            .map_err(Error::from)
    }

    fn list_unindexed_root_namespaces(&self, limit: i64) -> Result<Vec<Namespace>> {
        query_list(
            &self.conn(),
            "SELECT n.id, n.parent_id, n.name FROM namespaces n
             WHERE n.parent_id IS NULL
               AND NOT EXISTS (
                   SELECT 1 FROM zoekt_enabled_namespaces e WHERE e.root_namespace_id = n.id
               )
             ORDER BY n.id LIMIT ?1",
            params![limit],
            |row| {
                Ok(Namespace {
                    id: row.get(0)?,
                    parent_id: row.get(1)?,
                    name: row.get(2)?,
                })
            },
        )
    }

    fn upsert_project(&self, project: &Project) -> Result<()> {
        self.conn().execute(
            "INSERT INTO projects (id, namespace_id, root_namespace_id) VALUES (?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET
                 namespace_id = excluded.namespace_id,
                 root_namespace_id = excluded.root_namespace_id",
            params![project.id, project.namespace_id, project.root_namespace_id],
        )?;
        Ok(())
    }

    fn get_project(&self, id: i64) -> Result<Option<Project>> {
        self.conn()
            .query_row(
                "SELECT id, namespace_id, root_namespace_id FROM projects WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Project {
                        id: row.get(0)?,
                        namespace_id: row.get(1)?,
                        root_namespace_id: row.get(2)?,
                    })
                },
            )
            .optional()
            .map_err(Error::from)
    }

    fn delete_project(&self, id: i64) -> Result<bool> {
        let rows = self
            .conn()
            .execute("DELETE FROM projects WHERE id = ?1", params![id])?;
        Ok(rows > 0)
    }

    fn list_projects_in_root_namespace(&self, root_namespace_id: i64) -> Result<Vec<Project>> {
        query_list(
            &self.conn(),
            "SELECT id, namespace_id, root_namespace_id FROM projects
             WHERE root_namespace_id = ?1 ORDER BY id",
            params![root_namespace_id],
            |row| {
                Ok(Project {
                    id: row.get(0)?,
                    namespace_id: row.get(1)?,
                    root_namespace_id: row.get(2)?,
                })
            },
        )
    }

    fn upsert_subscription(&self, subscription: &Subscription) -> Result<()> {
        self.conn().execute(
            "INSERT INTO namespace_subscriptions (namespace_id, end_date) VALUES (?1, ?2)
             ON CONFLICT(namespace_id) DO UPDATE SET end_date = excluded.end_date",
            params![
                subscription.namespace_id,
                format_datetime(&subscription.end_date)
            ],
        )?;
        Ok(())
    }

    // Node operations

    fn upsert_node(&self, registration: &NodeRegistration, now: DateTime<Utc>) -> Result<Node> {
        let metadata = serde_json::to_string(&registration.metadata)
            .map_err(|e| Error::BadRequest(e.to_string()))?;
        let uuid = registration.uuid.to_string();
        let conn = self.conn();

        conn.execute(
            "INSERT INTO zoekt_nodes (uuid, index_base_url, search_base_url, last_seen_at,
                 used_bytes, total_bytes, indexed_bytes, metadata, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)
             ON CONFLICT(uuid) DO UPDATE SET
                 index_base_url = excluded.index_base_url,
                 search_base_url = excluded.search_base_url,
                 last_seen_at = excluded.last_seen_at,
                 used_bytes = excluded.used_bytes,
                 total_bytes = excluded.total_bytes,
                 indexed_bytes = excluded.indexed_bytes,
                 metadata = excluded.metadata,
                 updated_at = excluded.updated_at",
            params![
                uuid,
                registration.index_base_url,
                registration.search_base_url,
                format_datetime(&registration.last_seen_at),
                registration.used_bytes,
                registration.total_bytes,
                registration.indexed_bytes,
                metadata,
                format_datetime(&now),
            ],
        )?;

        conn.query_row(
            &format!("SELECT {NODE_COLUMNS} FROM zoekt_nodes WHERE uuid = ?1"),
            params![uuid],
            node_from_row,
        )
        .map_err(Error::from)
    }

    fn get_node(&self, id: i64) -> Result<Option<Node>> {
        self.conn()
            .query_row(
                &format!("SELECT {NODE_COLUMNS} FROM zoekt_nodes WHERE id = ?1"),
                params![id],
                node_from_row,
            )
            .optional()
            .map_err(Error::from)
    }

    fn get_node_by_uuid(&self, uuid: &Uuid) -> Result<Option<Node>> {
        self.conn()
            .query_row(
                &format!("SELECT {NODE_COLUMNS} FROM zoekt_nodes WHERE uuid = ?1"),
                params![uuid.to_string()],
                node_from_row,
            )
            .optional()
            .map_err(Error::from)
    }

    fn list_nodes(&self) -> Result<Vec<Node>> {
        query_list(
            &self.conn(),
            &format!("SELECT {NODE_COLUMNS} FROM zoekt_nodes ORDER BY id"),
            [],
            node_from_row,
        )
    }

    fn list_nodes_seen_since(&self, since: DateTime<Utc>) -> Result<Vec<Node>> {
        query_list(
            &self.conn(),
            &format!("SELECT {NODE_COLUMNS} FROM zoekt_nodes WHERE last_seen_at >= ?1 ORDER BY id"),
            params![format_datetime(&since)],
            node_from_row,
        )
    }

    fn list_nodes_seen_before(&self, before: DateTime<Utc>) -> Result<Vec<Node>> {
        query_list(
            &self.conn(),
            &format!("SELECT {NODE_COLUMNS} FROM zoekt_nodes WHERE last_seen_at < ?1 ORDER BY id"),
            params![format_datetime(&before)],
            node_from_row,
        )
    }

    fn record_node_task_outcome(&self, id: i64, success: bool) -> Result<i32> {
        self.conn()
            .query_row(
                "UPDATE zoekt_nodes
                 SET task_failures = CASE WHEN ?1 THEN 0 ELSE task_failures + 1 END
                 WHERE id = ?2
                 RETURNING task_failures",
                params![success, id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or(Error::NotFound)
    }

    fn delete_node_cascade(&self, id: i64) -> Result<bool> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        tx.execute("DELETE FROM zoekt_tasks WHERE zoekt_node_id = ?1", params![id])?;
        tx.execute(
            "DELETE FROM zoekt_repositories WHERE zoekt_index_id IN
                 (SELECT id FROM zoekt_indices WHERE zoekt_node_id = ?1)",
            params![id],
        )?;
        tx.execute("DELETE FROM zoekt_indices WHERE zoekt_node_id = ?1", params![id])?;
        let rows = tx.execute("DELETE FROM zoekt_nodes WHERE id = ?1", params![id])?;

        tx.commit()?;
        Ok(rows > 0)
    }

    fn sum_reserved_storage_for_node(&self, node_id: i64) -> Result<i64> {
        let sum: i64 = self.conn().query_row(
            "SELECT COALESCE(SUM(reserved_storage_bytes), 0) FROM zoekt_indices WHERE zoekt_node_id = ?1",
            params![node_id],
            |row| row.get(0),
        )?;
        Ok(sum)
    }

    fn list_nodes_with_ready_repository(
        &self,
        project_id: i64,
        seen_since: DateTime<Utc>,
    ) -> Result<Vec<Node>> {
        let columns = NODE_COLUMNS
            .split(", ")
            .map(|c| format!("n.{c}"))
            .collect::<Vec<_>>()
            .join(", ");
        query_list(
            &self.conn(),
            &format!(
                "SELECT DISTINCT {columns} FROM zoekt_nodes n
                 JOIN zoekt_indices i ON i.zoekt_node_id = n.id
                 JOIN zoekt_repositories r ON r.zoekt_index_id = i.id
                 WHERE r.project_id = ?1 AND r.state = 'ready' AND n.last_seen_at >= ?2
                 ORDER BY n.id"
            ),
            params![project_id, format_datetime(&seen_since)],
            node_from_row,
        )
    }

    // Enabled namespace operations

    fn create_enabled_namespace(
        &self,
        root_namespace_id: i64,
        placements: &[IndexPlacement],
        now: DateTime<Utc>,
    ) -> Result<(EnabledNamespace, Vec<(Replica, Index)>)> {
        let now = format_datetime(&now);
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let result = tx.execute(
            "INSERT INTO zoekt_enabled_namespaces (root_namespace_id, search, created_at, updated_at)
             VALUES (?1, 0, ?2, ?2)",
            params![root_namespace_id, now],
        );
        match result {
            Ok(_) => {}
            Err(e) if is_constraint_violation(&e) => return Err(Error::AlreadyExists),
            Err(e) => return Err(Error::from(e)),
        }

        let enabled_namespace =
            fetch_enabled_namespace(&tx, tx.last_insert_rowid())?.ok_or(Error::NotFound)?;
        let replicas = insert_replicas(&tx, &enabled_namespace, placements, &now)?;

        tx.commit()?;
        Ok((enabled_namespace, replicas))
    }

    fn add_replicas(
        &self,
        enabled_namespace: &EnabledNamespace,
        placements: &[IndexPlacement],
        now: DateTime<Utc>,
    ) -> Result<Vec<(Replica, Index)>> {
        let now = format_datetime(&now);
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let replicas = insert_replicas(&tx, enabled_namespace, placements, &now)?;
        tx.execute(
            "UPDATE zoekt_enabled_namespaces SET last_rollout_failed_at = NULL, updated_at = ?1
             WHERE id = ?2",
            params![now, enabled_namespace.id],
        )?;

        tx.commit()?;
        Ok(replicas)
    }

    fn get_enabled_namespace_by_root(
        &self,
        root_namespace_id: i64,
    ) -> Result<Option<EnabledNamespace>> {
        self.conn()
            .query_row(
                &format!(
                    "SELECT {ENABLED_NAMESPACE_COLUMNS} FROM zoekt_enabled_namespaces
                     WHERE root_namespace_id = ?1"
                ),
                params![root_namespace_id],
                enabled_namespace_from_row,
            )
            .optional()
            .map_err(Error::from)
    }

    fn list_enabled_namespaces(&self, after_id: i64, limit: i64) -> Result<Vec<EnabledNamespace>> {
        query_list(
            &self.conn(),
            &format!(
                "SELECT {ENABLED_NAMESPACE_COLUMNS} FROM zoekt_enabled_namespaces
                 WHERE id > ?1 ORDER BY id LIMIT ?2"
            ),
            params![after_id, limit],
            enabled_namespace_from_row,
        )
    }

    fn delete_enabled_namespace(&self, id: i64) -> Result<bool> {
        let rows = self.conn().execute(
            "DELETE FROM zoekt_enabled_namespaces WHERE id = ?1",
            params![id],
        )?;
        Ok(rows > 0)
    }

    fn set_enabled_namespace_search(
        &self,
        id: i64,
        search: bool,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.conn().execute(
            "UPDATE zoekt_enabled_namespaces SET search = ?1, updated_at = ?2 WHERE id = ?3",
            params![search, format_datetime(&now), id],
        )?;
        Ok(())
    }

    fn set_rollout_failed_at(&self, id: i64, at: Option<DateTime<Utc>>) -> Result<()> {
        self.conn().execute(
            "UPDATE zoekt_enabled_namespaces SET last_rollout_failed_at = ?1 WHERE id = ?2",
            params![at.as_ref().map(format_datetime), id],
        )?;
        Ok(())
    }

    fn list_enabled_namespaces_awaiting_rollout(
        &self,
        failed_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<EnabledNamespace>> {
        query_list(
            &self.conn(),
            &format!(
                "SELECT {ENABLED_NAMESPACE_COLUMNS} FROM zoekt_enabled_namespaces e
                 WHERE e.last_rollout_failed_at IS NOT NULL
                   AND e.last_rollout_failed_at < ?1
                   AND NOT EXISTS (
                       SELECT 1 FROM zoekt_replicas r WHERE r.zoekt_enabled_namespace_id = e.id
                   )
                 ORDER BY e.id LIMIT ?2"
            ),
            params![format_datetime(&failed_before), limit],
            enabled_namespace_from_row,
        )
    }

    fn list_expired_enabled_namespaces(
        &self,
        ended_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<EnabledNamespace>> {
        query_list(
            &self.conn(),
            &format!(
                "SELECT {ENABLED_NAMESPACE_COLUMNS} FROM zoekt_enabled_namespaces e
                 WHERE EXISTS (
                     SELECT 1 FROM namespace_subscriptions s
                     WHERE s.namespace_id = e.root_namespace_id AND s.end_date < ?1
                 )
                 ORDER BY e.id LIMIT ?2"
            ),
            params![format_datetime(&ended_before), limit],
            enabled_namespace_from_row,
        )
    }

    // Replica operations

    fn get_replica(&self, id: i64) -> Result<Option<Replica>> {
        self.conn()
            .query_row(
                &format!("SELECT {REPLICA_COLUMNS} FROM zoekt_replicas WHERE id = ?1"),
                params![id],
                replica_from_row,
            )
            .optional()
            .map_err(Error::from)
    }

    fn list_replicas(&self, enabled_namespace_id: i64) -> Result<Vec<Replica>> {
        query_list(
            &self.conn(),
            &format!(
                "SELECT {REPLICA_COLUMNS} FROM zoekt_replicas
                 WHERE zoekt_enabled_namespace_id = ?1 ORDER BY id"
            ),
            params![enabled_namespace_id],
            replica_from_row,
        )
    }

    fn set_replica_state(&self, id: i64, state: ReplicaState, now: DateTime<Utc>) -> Result<()> {
        self.conn().execute(
            "UPDATE zoekt_replicas SET state = ?1, updated_at = ?2 WHERE id = ?3",
            params![state.as_str(), format_datetime(&now), id],
        )?;
        Ok(())
    }

    // Index operations

    fn create_index(
        &self,
        replica: &Replica,
        placement: &IndexPlacement,
        now: DateTime<Utc>,
    ) -> Result<Index> {
        insert_index(&self.conn(), replica, placement, &format_datetime(&now))
    }

    fn get_index(&self, id: i64) -> Result<Option<Index>> {
        fetch_index(&self.conn(), id)
    }

    fn list_indices(&self, after_id: i64, limit: i64) -> Result<Vec<Index>> {
        query_list(
            &self.conn(),
            &format!("SELECT {INDEX_COLUMNS} FROM zoekt_indices WHERE id > ?1 ORDER BY id LIMIT ?2"),
            params![after_id, limit],
            index_from_row,
        )
    }

    fn list_indices_for_replica(&self, replica_id: i64) -> Result<Vec<Index>> {
        query_list(
            &self.conn(),
            &format!("SELECT {INDEX_COLUMNS} FROM zoekt_indices WHERE zoekt_replica_id = ?1 ORDER BY id"),
            params![replica_id],
            index_from_row,
        )
    }

    fn list_indices_in_state(&self, state: IndexState, limit: i64) -> Result<Vec<Index>> {
        query_list(
            &self.conn(),
            &format!("SELECT {INDEX_COLUMNS} FROM zoekt_indices WHERE state = ?1 ORDER BY id LIMIT ?2"),
            params![state.as_str(), limit],
            index_from_row,
        )
    }

    fn list_detached_indices(&self, limit: i64) -> Result<Vec<Index>> {
        query_list(
            &self.conn(),
            &format!(
                "SELECT {INDEX_COLUMNS} FROM zoekt_indices
                 WHERE (zoekt_replica_id IS NULL OR zoekt_enabled_namespace_id IS NULL)
                   AND state != 'orphaned'
                 ORDER BY id LIMIT ?1"
            ),
            params![limit],
            index_from_row,
        )
    }

    fn list_indices_needing_watermark(
        &self,
        ratio: f64,
        level: WatermarkLevel,
        limit: i64,
    ) -> Result<Vec<Index>> {
        let below = levels_below(level);
        if below.is_empty() {
            return Ok(Vec::new());
        }
        query_list(
            &self.conn(),
            &format!(
                "SELECT {INDEX_COLUMNS} FROM zoekt_indices
                 WHERE used_storage_bytes > 0
                   AND used_storage_bytes >= ?1 * reserved_storage_bytes
                   AND watermark_level IN ({below})
                 ORDER BY id LIMIT ?2"
            ),
            params![ratio, limit],
            index_from_row,
        )
    }

    fn list_indices_below_watermark(&self, ratio: f64, limit: i64) -> Result<Vec<Index>> {
        query_list(
            &self.conn(),
            &format!(
                "SELECT {INDEX_COLUMNS} FROM zoekt_indices
                 WHERE watermark_level != 'healthy'
                   AND (used_storage_bytes = 0 OR used_storage_bytes < ?1 * reserved_storage_bytes)
                 ORDER BY id LIMIT ?2"
            ),
            params![ratio, limit],
            index_from_row,
        )
    }

    fn set_index_state(&self, id: i64, state: IndexState, now: DateTime<Utc>) -> Result<()> {
        self.conn().execute(
            "UPDATE zoekt_indices SET state = ?1, updated_at = ?2 WHERE id = ?3",
            params![state.as_str(), format_datetime(&now), id],
        )?;
        Ok(())
    }

    fn set_index_watermark_level(
        &self,
        id: i64,
        level: WatermarkLevel,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.conn().execute(
            "UPDATE zoekt_indices SET watermark_level = ?1, updated_at = ?2 WHERE id = ?3",
            params![level.as_str(), format_datetime(&now), id],
        )?;
        Ok(())
    }

    fn set_index_reserved_storage(&self, id: i64, bytes: i64, now: DateTime<Utc>) -> Result<()> {
        self.conn().execute(
            "UPDATE zoekt_indices SET reserved_storage_bytes = ?1, updated_at = ?2 WHERE id = ?3",
            params![bytes, format_datetime(&now), id],
        )?;
        Ok(())
    }

    fn recompute_index_used_storage(&self, id: i64, now: DateTime<Utc>) -> Result<i64> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let used: i64 = tx.query_row(
            "SELECT COALESCE(SUM(size_bytes), 0) FROM zoekt_repositories
             WHERE zoekt_index_id = ?1 AND state = 'ready'",
            params![id],
            |row| row.get(0),
        )?;
        let rows = tx.execute(
            "UPDATE zoekt_indices SET used_storage_bytes = ?1, updated_at = ?2 WHERE id = ?3",
            params![used, format_datetime(&now), id],
        )?;
        if rows == 0 {
            return Err(Error::NotFound);
        }

        tx.commit()?;
        Ok(used)
    }

    fn delete_index(&self, id: i64) -> Result<bool> {
        let result = self
            .conn()
            .execute("DELETE FROM zoekt_indices WHERE id = ?1", params![id]);

        match result {
            Ok(rows) => Ok(rows > 0),
            Err(e) if is_constraint_violation(&e) => Err(Error::Conflict(format!(
                "index {id} still has repositories"
            ))),
            Err(e) => Err(Error::from(e)),
        }
    }

    fn count_repositories(&self, index_id: i64) -> Result<RepositoryCounts> {
        self.conn()
            .query_row(
                "SELECT COUNT(*),
                        COALESCE(SUM(CASE WHEN state = 'ready' THEN 1 ELSE 0 END), 0),
                        COALESCE(SUM(CASE WHEN state = 'failed' THEN 1 ELSE 0 END), 0)
                 FROM zoekt_repositories WHERE zoekt_index_id = ?1",
                params![index_id],
                |row| {
                    Ok(RepositoryCounts {
                        total: row.get(0)?,
                        ready: row.get(1)?,
                        failed: row.get(2)?,
                    })
                },
            )
            .map_err(Error::from)
    }

    // Repository operations

    fn find_or_create_repository(
        &self,
        index: &Index,
        project_id: i64,
        now: DateTime<Utc>,
    ) -> Result<Repository> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        if let Some(existing) = fetch_repository_by_project(&tx, index.id, project_id)? {
            return Ok(existing);
        }

        let project_exists: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM projects WHERE id = ?1)",
            params![project_id],
            |row| row.get(0),
        )?;
        if !project_exists {
            return Err(Error::validation(format!("project {project_id} does not exist")));
        }

        // Re-read the index state inside the transaction.
        let index = fetch_index(&tx, index.id)?.ok_or(Error::NotFound)?;
        if let Some(replica_id) = index.zoekt_replica_id {
            let clash_states = if index.state == IndexState::Reallocating {
                "'reallocating'"
            } else {
                "'pending', 'ready', 'failed'"
            };
            let other: Option<i64> = tx
                .query_row(
                    &format!(
                        "SELECT i.id FROM zoekt_repositories r
                         JOIN zoekt_indices i ON i.id = r.zoekt_index_id
                         WHERE i.zoekt_replica_id = ?1 AND i.id != ?2
                           AND r.project_identifier = ?3
                           AND i.state IN ({clash_states})
                         LIMIT 1"
                    ),
                    params![replica_id, index.id, project_id],
                    |row| row.get(0),
                )
                .optional()?;

            if let Some(other) = other {
                return Err(Error::validation(format!(
                    "project {project_id} is already assigned to index {other} of replica {replica_id}"
                )));
            }
        }

        let now = format_datetime(&now);
        tx.execute(
            "INSERT INTO zoekt_repositories (zoekt_index_id, project_id, project_identifier, state,
                 created_at, updated_at)
             VALUES (?1, ?2, ?2, 'pending', ?3, ?3)
             ON CONFLICT(zoekt_index_id, project_identifier) DO NOTHING",
            params![index.id, project_id, now],
        )?;
        let repository =
            fetch_repository_by_project(&tx, index.id, project_id)?.ok_or(Error::NotFound)?;

        tx.commit()?;
        Ok(repository)
    }

    fn get_repository(&self, id: i64) -> Result<Option<Repository>> {
        self.conn()
            .query_row(
                &format!("SELECT {REPOSITORY_COLUMNS} FROM zoekt_repositories WHERE id = ?1"),
                params![id],
                repository_from_row,
            )
            .optional()
            .map_err(Error::from)
    }

    fn get_repository_by_project(
        &self,
        index_id: i64,
        project_identifier: i64,
    ) -> Result<Option<Repository>> {
        fetch_repository_by_project(&self.conn(), index_id, project_identifier)
    }

    fn list_repositories(&self, index_id: i64) -> Result<Vec<Repository>> {
        query_list(
            &self.conn(),
            &format!(
                "SELECT {REPOSITORY_COLUMNS} FROM zoekt_repositories
                 WHERE zoekt_index_id = ?1 ORDER BY id"
            ),
            params![index_id],
            repository_from_row,
        )
    }

    fn list_repositories_in_state(
        &self,
        state: RepositoryState,
        limit: i64,
    ) -> Result<Vec<Repository>> {
        query_list(
            &self.conn(),
            &format!(
                "SELECT {REPOSITORY_COLUMNS} FROM zoekt_repositories
                 WHERE state = ?1 ORDER BY id LIMIT ?2"
            ),
            params![state.as_str(), limit],
            repository_from_row,
        )
    }

    fn list_repositories_missing_project(&self, limit: i64) -> Result<Vec<Repository>> {
        query_list(
            &self.conn(),
            &format!(
                "SELECT {REPOSITORY_COLUMNS} FROM zoekt_repositories
                 WHERE project_id IS NULL AND state != 'orphaned'
                 ORDER BY id LIMIT ?1"
            ),
            params![limit],
            repository_from_row,
        )
    }

    fn set_repository_state(
        &self,
        id: i64,
        state: RepositoryState,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let rows = self.conn().execute(
            "UPDATE zoekt_repositories SET state = ?1, updated_at = ?2 WHERE id = ?3",
            params![state.as_str(), format_datetime(&now), id],
        )?;
        if rows == 0 {
            return Err(Error::NotFound);
        }
        Ok(())
    }

    fn mark_repository_indexed(&self, id: i64, size_bytes: i64, now: DateTime<Utc>) -> Result<()> {
        let now = format_datetime(&now);
        let rows = self.conn().execute(
            "UPDATE zoekt_repositories
             SET state = 'ready', size_bytes = ?1, indexed_at = ?2, updated_at = ?2
             WHERE id = ?3",
            params![size_bytes, now, id],
        )?;
        if rows == 0 {
            return Err(Error::NotFound);
        }
        Ok(())
    }

    fn delete_repository(&self, id: i64) -> Result<bool> {
        let rows = self
            .conn()
            .execute("DELETE FROM zoekt_repositories WHERE id = ?1", params![id])?;
        Ok(rows > 0)
    }

    // Task operations

    fn insert_task(&self, task: &NewTask, partition_id: i64) -> Result<Option<Task>> {
        let conn = self.conn();
        let created_at = format_datetime(&task.created_at);
        let rows = conn.execute(
            "INSERT OR IGNORE INTO zoekt_tasks (partition_id, zoekt_node_id, zoekt_repository_id,
                 project_identifier, task_type, state, retries_left, perform_at, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6, ?7, ?8, ?8)",
            params![
                partition_id,
                task.zoekt_node_id,
                task.zoekt_repository_id,
                task.project_identifier,
                task.task_type.as_str(),
                task.retries_left,
                format_datetime(&task.perform_at),
                created_at,
            ],
        )?;
        if rows == 0 {
            return Ok(None);
        }

        conn.query_row(
            &format!("SELECT {TASK_COLUMNS} FROM zoekt_tasks WHERE id = ?1"),
            params![conn.last_insert_rowid()],
            task_from_row,
        )
        .optional()
        .map_err(Error::from)
    }

    fn get_task(&self, id: i64) -> Result<Option<Task>> {
        self.conn()
            .query_row(
                &format!("SELECT {TASK_COLUMNS} FROM zoekt_tasks WHERE id = ?1"),
                params![id],
                task_from_row,
            )
            .optional()
            .map_err(Error::from)
    }

    fn list_due_tasks(
        &self,
        node_id: Option<i64>,
        now: DateTime<Utc>,
        after: Option<TaskCursor>,
        limit: i64,
    ) -> Result<Vec<Task>> {
        let (after_at, after_id) = after
            .map(|c| (format_datetime(&c.perform_at), c.id))
            .unwrap_or_default();
        query_list(
            &self.conn(),
            &format!(
                "SELECT {TASK_COLUMNS} FROM zoekt_tasks
                 WHERE state = 'pending' AND perform_at <= ?1
                   AND (?2 IS NULL OR zoekt_node_id = ?2)
                   AND (perform_at > ?3 OR (perform_at = ?3 AND id > ?4))
                 ORDER BY perform_at, id LIMIT ?5"
            ),
            params![format_datetime(&now), node_id, after_at, after_id, limit],
            task_from_row,
        )
    }

    fn claim_task(&self, id: i64, now: DateTime<Utc>) -> Result<bool> {
        let rows = self.conn().execute(
            "UPDATE zoekt_tasks SET state = 'processing', updated_at = ?1
             WHERE id = ?2 AND state = 'pending'",
            params![format_datetime(&now), id],
        )?;
        Ok(rows == 1)
    }

    fn settle_task(&self, id: i64, state: TaskState, now: DateTime<Utc>) -> Result<bool> {
        let rows = self.conn().execute(
            "UPDATE zoekt_tasks SET state = ?1, updated_at = ?2
             WHERE id = ?3 AND state IN ('pending', 'processing')",
            params![state.as_str(), format_datetime(&now), id],
        )?;
        Ok(rows == 1)
    }

    fn release_task(&self, id: i64, state: TaskState, now: DateTime<Utc>) -> Result<bool> {
        let rows = self.conn().execute(
            "UPDATE zoekt_tasks SET state = ?1, updated_at = ?2
             WHERE id = ?3 AND state = 'processing'",
            params![state.as_str(), format_datetime(&now), id],
        )?;
        Ok(rows == 1)
    }

    fn reschedule_task(
        &self,
        id: i64,
        perform_at: DateTime<Utc>,
        retries_left: i32,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let rows = self.conn().execute(
            "UPDATE OR IGNORE zoekt_tasks
             SET state = 'pending', perform_at = ?1, retries_left = ?2, updated_at = ?3
             WHERE id = ?4 AND state = 'processing'",
            params![
                format_datetime(&perform_at),
                retries_left,
                format_datetime(&now),
                id
            ],
        )?;
        Ok(rows == 1)
    }

    fn orphan_pending_tasks(
        &self,
        repository_id: i64,
        task_type: TaskType,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let rows = self.conn().execute(
            "UPDATE zoekt_tasks SET state = 'orphaned', updated_at = ?1
             WHERE zoekt_repository_id = ?2 AND task_type = ?3 AND state = 'pending'",
            params![format_datetime(&now), repository_id, task_type.as_str()],
        )?;
        Ok(rows)
    }

    fn list_processing_tasks_updated_before(
        &self,
        before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Task>> {
        query_list(
            &self.conn(),
            &format!(
                "SELECT {TASK_COLUMNS} FROM zoekt_tasks
                 WHERE state = 'processing' AND updated_at < ?1
                 ORDER BY updated_at, id LIMIT ?2"
            ),
            params![format_datetime(&before), limit],
            task_from_row,
        )
    }

    fn count_tasks_for_node(&self, node_id: i64, state: TaskState) -> Result<i64> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM zoekt_tasks WHERE zoekt_node_id = ?1 AND state = ?2",
            params![node_id, state.as_str()],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    fn list_tasks_for_repository(&self, repository_id: i64) -> Result<Vec<Task>> {
        query_list(
            &self.conn(),
            &format!(
                "SELECT {TASK_COLUMNS} FROM zoekt_tasks
                 WHERE zoekt_repository_id = ?1 ORDER BY id"
            ),
            params![repository_id],
            task_from_row,
        )
    }

    // Task partition operations

    fn active_task_partition(&self) -> Result<Option<TaskPartition>> {
        self.conn()
            .query_row(
                "SELECT id, created_at, detached_at FROM zoekt_task_partitions
                 WHERE detached_at IS NULL ORDER BY id DESC LIMIT 1",
                [],
                partition_from_row,
            )
            .optional()
            .map_err(Error::from)
    }

    fn create_task_partition(&self, now: DateTime<Utc>) -> Result<TaskPartition> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO zoekt_task_partitions (created_at) VALUES (?1)",
            params![format_datetime(&now)],
        )?;
        conn.query_row(
            "SELECT id, created_at, detached_at FROM zoekt_task_partitions WHERE id = ?1",
            params![conn.last_insert_rowid()],
            partition_from_row,
        )
        .map_err(Error::from)
    }

    fn list_attached_task_partitions(&self) -> Result<Vec<TaskPartition>> {
        query_list(
            &self.conn(),
            "SELECT id, created_at, detached_at FROM zoekt_task_partitions
             WHERE detached_at IS NULL ORDER BY id",
            [],
            partition_from_row,
        )
    }

    fn oldest_task_created_at(&self, partition_id: i64) -> Result<Option<DateTime<Utc>>> {
        let oldest: Option<String> = self.conn().query_row(
            "SELECT MIN(created_at) FROM zoekt_tasks WHERE partition_id = ?1",
            params![partition_id],
            |row| row.get(0),
        )?;
        Ok(oldest.map(|s| parse_datetime(&s)))
    }

    fn detach_task_partition(&self, id: i64, now: DateTime<Utc>) -> Result<bool> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let in_flight: i64 = tx.query_row(
            "SELECT COUNT(*) FROM zoekt_tasks
             WHERE partition_id = ?1 AND state IN ('pending', 'processing')",
            params![id],
            |row| row.get(0),
        )?;
        if in_flight > 0 {
            return Ok(false);
        }

        tx.execute("DELETE FROM zoekt_tasks WHERE partition_id = ?1", params![id])?;
        let rows = tx.execute(
            "UPDATE zoekt_task_partitions SET detached_at = ?1
             WHERE id = ?2 AND detached_at IS NULL",
            params![format_datetime(&now), id],
        )?;

        tx.commit()?;
        Ok(rows > 0)
    }

    // Index job operations

    fn create_index_job(
        &self,
        index_id: i64,
        kind: IndexJobKind,
        now: DateTime<Utc>,
    ) -> Result<IndexJob> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO zoekt_index_jobs (zoekt_index_id, kind, state, created_at)
             VALUES (?1, ?2, 'pending', ?3)",
            params![index_id, kind.as_str(), format_datetime(&now)],
        )?;
        conn.query_row(
            "SELECT id, zoekt_index_id, kind, state, created_at FROM zoekt_index_jobs WHERE id = ?1",
            params![conn.last_insert_rowid()],
            index_job_from_row,
        )
        .map_err(Error::from)
    }

    fn has_pending_index_job(&self, index_id: i64, kind: IndexJobKind) -> Result<bool> {
        let exists: bool = self.conn().query_row(
            "SELECT EXISTS(SELECT 1 FROM zoekt_index_jobs
                 WHERE zoekt_index_id = ?1 AND kind = ?2 AND state = 'pending')",
            params![index_id, kind.as_str()],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    fn list_pending_index_jobs(&self, limit: i64) -> Result<Vec<IndexJob>> {
        query_list(
            &self.conn(),
            "SELECT id, zoekt_index_id, kind, state, created_at FROM zoekt_index_jobs
             WHERE state = 'pending' ORDER BY id LIMIT ?1",
            params![limit],
            index_job_from_row,
        )
    }

    fn complete_index_job(&self, id: i64) -> Result<()> {
        self.conn().execute(
            "UPDATE zoekt_index_jobs SET state = 'done' WHERE id = ?1",
            params![id],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeDelta;
    use tempfile::TempDir;

    use super::*;

    fn ts(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn registration(uuid: Uuid) -> NodeRegistration {
        NodeRegistration {
            uuid,
            index_base_url: "http://node:6060".to_string(),
            search_base_url: "http://node:6070".to_string(),
            last_seen_at: ts(0),
            used_bytes: 10,
            total_bytes: 100,
            indexed_bytes: 0,
            metadata: NodeMetadata {
                name: "node".to_string(),
                ..NodeMetadata::default()
            },
        }
    }

    fn seed_namespace(store: &SqliteStore, id: i64, projects: &[i64]) {
        store
            .upsert_namespace(&Namespace {
                id,
                parent_id: None,
                name: format!("group-{id}"),
            })
            .unwrap();
        for project in projects {
            store
                .upsert_project(&Project {
                    id: *project,
                    namespace_id: id,
                    root_namespace_id: id,
                })
                .unwrap();
        }
    }

    fn placement(node_id: i64) -> IndexPlacement {
        IndexPlacement {
            zoekt_node_id: node_id,
            state: IndexState::Pending,
            reserved_storage_bytes: 1_000,
        }
    }

    #[test]
    fn test_initialize_creates_tables() {
        let temp = TempDir::new().unwrap();
        let store = SqliteStore::new(temp.path().join("test.db")).unwrap();
        store.initialize().unwrap();

        let conn = store.conn();
        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<std::result::Result<Vec<_>, _>>()
            .unwrap();

        for table in [
            "namespaces",
            "projects",
            "namespace_subscriptions",
            "zoekt_nodes",
            "zoekt_enabled_namespaces",
            "zoekt_replicas",
            "zoekt_indices",
            "zoekt_repositories",
            "zoekt_tasks",
            "zoekt_task_partitions",
            "zoekt_index_jobs",
            "settings",
            "tokens",
        ] {
            assert!(tables.contains(&table.to_string()), "missing {table}");
        }
    }

    #[test]
    fn test_upsert_node_is_keyed_by_uuid() {
        let store = SqliteStore::in_memory().unwrap();
        let uuid = Uuid::new_v4();

        let first = store.upsert_node(&registration(uuid), ts(0)).unwrap();
        let mut update = registration(uuid);
        update.used_bytes = 42;
        update.last_seen_at = ts(30);
        let second = store.upsert_node(&update, ts(30)).unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.used_bytes, 42);
        assert_eq!(second.last_seen_at, ts(30));
        assert_eq!(second.created_at, ts(0));
        assert_eq!(store.list_nodes().unwrap().len(), 1);
    }

    #[test]
    fn test_same_url_different_uuid_is_allowed() {
        let store = SqliteStore::in_memory().unwrap();
        store.upsert_node(&registration(Uuid::new_v4()), ts(0)).unwrap();
        store.upsert_node(&registration(Uuid::new_v4()), ts(0)).unwrap();
        assert_eq!(store.list_nodes().unwrap().len(), 2);
    }

    #[test]
    fn test_enabled_namespace_is_unique_per_root() {
        let store = SqliteStore::in_memory().unwrap();
        seed_namespace(&store, 1, &[]);
        let node = store.upsert_node(&registration(Uuid::new_v4()), ts(0)).unwrap();

        let (_, replicas) = store
            .create_enabled_namespace(1, &[placement(node.id)], ts(0))
            .unwrap();
        assert_eq!(replicas.len(), 1);

        let again = store.create_enabled_namespace(1, &[placement(node.id)], ts(0));
        assert!(matches!(again, Err(Error::AlreadyExists)));
    }

    #[test]
    fn test_failed_allocation_commits_nothing() {
        let store = SqliteStore::in_memory().unwrap();
        seed_namespace(&store, 1, &[]);

        // Node 999 does not exist, so the index insert fails.
        let result = store.create_enabled_namespace(1, &[placement(999)], ts(0));
        assert!(result.is_err());
        assert!(store.get_enabled_namespace_by_root(1).unwrap().is_none());
    }

    #[test]
    fn test_index_delete_is_restricted_by_repositories() {
        let store = SqliteStore::in_memory().unwrap();
        seed_namespace(&store, 1, &[10]);
        let node = store.upsert_node(&registration(Uuid::new_v4()), ts(0)).unwrap();
        let (_, replicas) = store
            .create_enabled_namespace(1, &[placement(node.id)], ts(0))
            .unwrap();
        let index = &replicas[0].1;

        let repo = store.find_or_create_repository(index, 10, ts(0)).unwrap();
        assert!(matches!(store.delete_index(index.id), Err(Error::Conflict(_))));

        store.delete_repository(repo.id).unwrap();
        assert!(store.delete_index(index.id).unwrap());
    }

    #[test]
    fn test_project_deletion_keeps_identifier() {
        let store = SqliteStore::in_memory().unwrap();
        seed_namespace(&store, 1, &[10]);
        let node = store.upsert_node(&registration(Uuid::new_v4()), ts(0)).unwrap();
        let (_, replicas) = store
            .create_enabled_namespace(1, &[placement(node.id)], ts(0))
            .unwrap();
        let repo = store
            .find_or_create_repository(&replicas[0].1, 10, ts(0))
            .unwrap();
        assert_eq!(repo.project_id, Some(10));

        store.delete_project(10).unwrap();

        let repo = store.get_repository(repo.id).unwrap().unwrap();
        assert_eq!(repo.project_id, None);
        assert_eq!(repo.project_identifier, 10);
        assert_eq!(store.list_repositories_missing_project(10).unwrap().len(), 1);
    }

    #[test]
    fn test_insert_task_ignores_duplicate_pending() {
        let store = SqliteStore::in_memory().unwrap();
        seed_namespace(&store, 1, &[10]);
        let node = store.upsert_node(&registration(Uuid::new_v4()), ts(0)).unwrap();
        let (_, replicas) = store
            .create_enabled_namespace(1, &[placement(node.id)], ts(0))
            .unwrap();
        let repo = store
            .find_or_create_repository(&replicas[0].1, 10, ts(0))
            .unwrap();
        let partition = store.create_task_partition(ts(0)).unwrap();

        let task = NewTask {
            zoekt_node_id: node.id,
            zoekt_repository_id: repo.id,
            project_identifier: 10,
            task_type: TaskType::IndexRepo,
            retries_left: 3,
            perform_at: ts(0),
            created_at: ts(0),
        };
        let first = store.insert_task(&task, partition.id).unwrap();
        let second = store.insert_task(&task, partition.id).unwrap();
        assert!(first.is_some());
        assert!(second.is_none());

        // Once the first one is claimed a new pending task may be queued.
        assert!(store.claim_task(first.unwrap().id, ts(1)).unwrap());
        assert!(store.insert_task(&task, partition.id).unwrap().is_some());
    }

    #[test]
    fn test_claim_is_exclusive() {
        let store = SqliteStore::in_memory().unwrap();
        seed_namespace(&store, 1, &[10]);
        let node = store.upsert_node(&registration(Uuid::new_v4()), ts(0)).unwrap();
        let (_, replicas) = store
            .create_enabled_namespace(1, &[placement(node.id)], ts(0))
            .unwrap();
        let repo = store
            .find_or_create_repository(&replicas[0].1, 10, ts(0))
            .unwrap();
        let partition = store.create_task_partition(ts(0)).unwrap();
        let task = store
            .insert_task(
                &NewTask {
                    zoekt_node_id: node.id,
                    zoekt_repository_id: repo.id,
                    project_identifier: 10,
                    task_type: TaskType::IndexRepo,
                    retries_left: 0,
                    perform_at: ts(0),
                    created_at: ts(0),
                },
                partition.id,
            )
            .unwrap()
            .unwrap();

        assert!(store.claim_task(task.id, ts(1)).unwrap());
        assert!(!store.claim_task(task.id, ts(1)).unwrap());
    }

    #[test]
    fn test_timestamps_compare_in_order() {
        let store = SqliteStore::in_memory().unwrap();
        let early = ts(0) + TimeDelta::milliseconds(5);
        let mut node = registration(Uuid::new_v4());
        node.last_seen_at = early;
        store.upsert_node(&node, early).unwrap();

        assert_eq!(store.list_nodes_seen_since(ts(0)).unwrap().len(), 1);
        assert_eq!(store.list_nodes_seen_since(ts(1)).unwrap().len(), 0);
        assert_eq!(store.list_nodes_seen_before(ts(1)).unwrap().len(), 1);
    }

    #[test]
    fn test_token_lookup_collision() {
        let store = SqliteStore::in_memory().unwrap();

        let token1 = Token {
            id: "token-1".to_string(),
            token_hash: "hash1".to_string(),
            token_lookup: "lookup123".to_string(),
            is_admin: true,
            description: None,
            created_at: Utc::now(),
            expires_at: None,
            last_used_at: None,
        };
        store.create_token(&token1).unwrap();

        let token2 = Token {
            id: "token-2".to_string(),
            token_hash: "hash2".to_string(),
            token_lookup: "lookup123".to_string(), // Same lookup
            ..token1.clone()
        };

        let result = store.create_token(&token2);
        assert!(matches!(result, Err(Error::TokenLookupCollision)));
    }
}
