use std::path::Path;
use std::sync::Mutex;

use futures::future::BoxFuture;
use rusqlite::{params, params_from_iter, Connection, ErrorCode, OptionalExtension};
use tracing::debug;

use trellis_core::error::{Result, TrellisError};
use trellis_core::filter::NodeFilter;
use trellis_core::traits::NodeStore;
use trellis_core::types::NodeExecution;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS node_executions (
        id TEXT PRIMARY KEY,
        plan_execution_id TEXT NOT NULL,
        plan_node_id TEXT NOT NULL,
        parent_id TEXT,
        status TEXT NOT NULL,
        old_retry INTEGER NOT NULL DEFAULT 0,
        version INTEGER NOT NULL,
        body TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_ne_plan
        ON node_executions(plan_execution_id, old_retry, status);

    CREATE INDEX IF NOT EXISTS idx_ne_parent
        ON node_executions(parent_id);

    CREATE UNIQUE INDEX IF NOT EXISTS idx_ne_live_attempt
        ON node_executions(plan_execution_id, plan_node_id)
        WHERE old_retry = 0;";

/// SQLite-backed node store.
///
/// The full record is kept as a JSON body; the columns used for lookups,
/// the version token, and the live-attempt uniqueness index are kept alongside.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        // Create parent directories
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                TrellisError::Database(format!("Failed to create db directory: {}", e))
            })?;
        }

        let conn = Connection::open(path).map_err(|e| TrellisError::Database(e.to_string()))?;

        // Enable WAL mode for better concurrent performance
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(|e| TrellisError::Database(e.to_string()))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| TrellisError::Database(e.to_string()))?;

        debug!(path = %path.display(), "SQLite node store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().map_err(|e| TrellisError::Database(e.to_string()))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| TrellisError::Database(e.to_string()))?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

fn decode(body: &str, version: i64) -> Result<NodeExecution> {
    let mut node: NodeExecution = serde_json::from_str(body)?;
    // The column is authoritative
    node.version = version as u64;
    Ok(node)
}

fn map_write_error(e: rusqlite::Error, id: &str) -> TrellisError {
    match e {
        rusqlite::Error::SqliteFailure(ref err, ref msg)
            if err.code == ErrorCode::ConstraintViolation =>
        {
            let detail = msg.clone().unwrap_or_else(|| err.to_string());
            if detail.contains("plan_node_id") {
                TrellisError::Conflict(format!(
                    "Live attempt already exists for node execution {}: {}",
                    id, detail
                ))
            } else {
                TrellisError::Conflict(format!(
                    "Node execution already exists: {} ({})",
                    id, detail
                ))
            }
        }
        other => TrellisError::Database(other.to_string()),
    }
}

impl NodeStore for SqliteStore {
    fn insert(&self, node: NodeExecution) -> BoxFuture<'_, Result<NodeExecution>> {
        Box::pin(async move {
            let body = serde_json::to_string(&node)?;
            let conn = self
                .conn
                .lock()
                .map_err(|e| TrellisError::Database(e.to_string()))?;

            conn.execute(
                "INSERT INTO node_executions
                    (id, plan_execution_id, plan_node_id, parent_id, status, old_retry, version, body)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    node.id,
                    node.plan_execution_id,
                    node.plan_node.id,
                    node.parent_id,
                    node.status.as_str(),
                    node.old_retry,
                    node.version as i64,
                    body,
                ],
            )
            .map_err(|e| map_write_error(e, &node.id))?;

            Ok(node)
        })
    }

    fn fetch(&self, id: &str) -> BoxFuture<'_, Result<Option<NodeExecution>>> {
        let id = id.to_string();

        Box::pin(async move {
            let conn = self
                .conn
                .lock()
                .map_err(|e| TrellisError::Database(e.to_string()))?;

            let row = conn
                .query_row(
                    "SELECT body, version FROM node_executions WHERE id = ?1",
                    params![id],
                    |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
                )
                .optional()
                .map_err(|e| TrellisError::Database(e.to_string()))?;

            row.map(|(body, version)| decode(&body, version)).transpose()
        })
    }

    fn find(&self, filter: &NodeFilter) -> BoxFuture<'_, Result<Vec<NodeExecution>>> {
        let filter = filter.clone();

        Box::pin(async move {
            // Narrow on indexed columns in SQL, apply the full filter in memory
            let mut sql = String::from("SELECT body, version FROM node_executions WHERE 1 = 1");
            let mut args: Vec<String> = Vec::new();
            if let Some(ref pe) = filter.plan_execution_id {
                args.push(pe.clone());
                sql.push_str(&format!(" AND plan_execution_id = ?{}", args.len()));
            }
            if let Some(ref parent) = filter.parent_id {
                args.push(parent.clone());
                sql.push_str(&format!(" AND parent_id = ?{}", args.len()));
            }
            if !filter.include_old_retries {
                sql.push_str(" AND old_retry = 0");
            }
            sql.push_str(" ORDER BY rowid ASC");

            let conn = self
                .conn
                .lock()
                .map_err(|e| TrellisError::Database(e.to_string()))?;
            let mut stmt = conn
                .prepare(&sql)
                .map_err(|e| TrellisError::Database(e.to_string()))?;

            let rows = stmt
                .query_map(params_from_iter(args.iter()), |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
                })
                .map_err(|e| TrellisError::Database(e.to_string()))?;

            let mut found = Vec::new();
            for row in rows {
                let (body, version) = row.map_err(|e| TrellisError::Database(e.to_string()))?;
                let node = decode(&body, version)?;
                if filter.matches(&node) {
                    found.push(node);
                }
            }

            Ok(found)
        })
    }

    fn compare_and_swap(
        &self,
        candidate: NodeExecution,
    ) -> BoxFuture<'_, Result<Option<NodeExecution>>> {
        Box::pin(async move {
            let expected = candidate.version;
            let mut next = candidate;
            next.version = expected + 1;
            let body = serde_json::to_string(&next)?;

            let conn = self
                .conn
                .lock()
                .map_err(|e| TrellisError::Database(e.to_string()))?;

            let changed = conn
                .execute(
                    "UPDATE node_executions
                     SET status = ?1, old_retry = ?2, body = ?3, version = version + 1
                     WHERE id = ?4 AND version = ?5",
                    params![
                        next.status.as_str(),
                        next.old_retry,
                        body,
                        next.id,
                        expected as i64,
                    ],
                )
                .map_err(|e| map_write_error(e, &next.id))?;

            if changed == 1 {
                return Ok(Some(next));
            }

            let exists = conn
                .query_row(
                    "SELECT 1 FROM node_executions WHERE id = ?1",
                    params![next.id],
                    |_| Ok(()),
                )
                .optional()
                .map_err(|e| TrellisError::Database(e.to_string()))?
                .is_some();

            if exists {
                Ok(None)
            } else {
                Err(TrellisError::NotFound(next.id))
            }
        })
    }
}
