use super::{
    ensure_id, increment_path, validate_collection_name, validate_field_name, DocumentStore,
};
use crate::constants::ID_FIELD;
use crate::domain::{Document, FieldAggregate, IndexKey, IndexSpec, SortOrder};
use crate::error::{EtlError, Result};
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, info};

const INDEX_CATALOG: &str = "_etl_indexes";

/// File-backed document store: one SQLite table per collection, documents
/// kept as JSON text and queried through the JSON1 functions.
///
/// Calls run on the caller's task. The batch job issues one call at a time,
/// so the connection mutex is never contended.
pub struct SqliteStore {
    conn: Mutex<Option<Connection>>,
    location: String,
}

impl SqliteStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        let store = Self::with_connection(conn, path.display().to_string())?;
        info!("📂 Opened SQLite document store at {}", store.location);
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::with_connection(conn, ":memory:".to_string())
    }

    fn with_connection(conn: Connection, location: String) -> Result<Self> {
        conn.execute_batch(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {INDEX_CATALOG} (
                collection  TEXT NOT NULL,
                name        TEXT NOT NULL,
                keys        TEXT NOT NULL,
                PRIMARY KEY (collection, name)
            );
            "#
        ))?;
        Ok(Self {
            conn: Mutex::new(Some(conn)),
            location,
        })
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut guard = self.conn.lock().map_err(|_| EtlError::LockPoisoned)?;
        let conn = guard.as_mut().ok_or(EtlError::ConnectionClosed)?;
        f(conn)
    }
}

/// Creates the backing table on first use
fn ensure_collection(conn: &Connection, collection: &str) -> Result<()> {
    validate_collection_name(collection)?;
    conn.execute_batch(&format!(
        r#"
        CREATE TABLE IF NOT EXISTS "{collection}" (
            seq   INTEGER PRIMARY KEY AUTOINCREMENT,
            id    TEXT NOT NULL UNIQUE,
            body  TEXT NOT NULL
        );
        "#
    ))?;
    Ok(())
}

fn json_path(field: &str) -> Result<String> {
    validate_field_name(field)?;
    Ok(format!("$.\"{field}\""))
}

fn parse_body(body: &str) -> Result<Document> {
    Ok(serde_json::from_str(body)?)
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

#[async_trait]
impl DocumentStore for SqliteStore {
    fn engine(&self) -> &'static str {
        "sqlite"
    }

    async fn clear(&self, collection: &str) -> Result<u64> {
        self.with_conn(|conn| {
            ensure_collection(conn, collection)?;
            let removed = conn.execute(&format!(r#"DELETE FROM "{collection}""#), [])?;
            debug!("Cleared {} documents from {}", removed, collection);
            Ok(removed as u64)
        })
    }

    async fn insert_many(&self, collection: &str, docs: Vec<Document>) -> Result<usize> {
        self.with_conn(|conn| {
            ensure_collection(conn, collection)?;
            let tx = conn.transaction()?;
            let n = docs.len();
            {
                let mut stmt =
                    tx.prepare(&format!(r#"INSERT INTO "{collection}" (id, body) VALUES (?1, ?2)"#))?;
                for mut doc in docs {
                    let id = ensure_id(&mut doc);
                    let body = serde_json::to_string(&doc)?;
                    stmt.execute(params![id, body]).map_err(|e| {
                        if is_unique_violation(&e) {
                            EtlError::DuplicateKey {
                                collection: collection.to_string(),
                                id: id.clone(),
                            }
                        } else {
                            EtlError::from(e)
                        }
                    })?;
                }
            }
            tx.commit()?;
            debug!("Inserted {} documents into {}", n, collection);
            Ok(n)
        })
    }

    async fn find_all(&self, collection: &str) -> Result<Vec<Document>> {
        self.with_conn(|conn| {
            ensure_collection(conn, collection)?;
            let mut stmt = conn.prepare(&format!(r#"SELECT body FROM "{collection}" ORDER BY seq"#))?;
            let bodies = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            bodies.iter().map(|b| parse_body(b)).collect()
        })
    }

    async fn find_by_id(&self, collection: &str, id: &str) -> Result<Option<Document>> {
        self.with_conn(|conn| {
            ensure_collection(conn, collection)?;
            let body: Option<String> = conn
                .query_row(
                    &format!(r#"SELECT body FROM "{collection}" WHERE id = ?1"#),
                    params![id],
                    |row| row.get(0),
                )
                .optional()?;
            body.as_deref().map(parse_body).transpose()
        })
    }

    async fn count(&self, collection: &str) -> Result<u64> {
        self.with_conn(|conn| {
            ensure_collection(conn, collection)?;
            let n: i64 = conn.query_row(
                &format!(r#"SELECT COUNT(*) FROM "{collection}""#),
                [],
                |row| row.get(0),
            )?;
            Ok(n as u64)
        })
    }

    async fn set_if_absent(&self, collection: &str, defaults: &[(String, Value)]) -> Result<u64> {
        self.with_conn(|conn| {
            ensure_collection(conn, collection)?;
            let tx = conn.transaction()?;
            let mut written = 0u64;
            {
                let mut stmt = tx.prepare(&format!(
                    r#"UPDATE "{collection}" SET body = json_set(body, ?1, json(?2))
                       WHERE json_type(body, ?1) IS NULL OR json_type(body, ?1) = 'null'"#
                ))?;
                for (field, default) in defaults {
                    let path = json_path(field)?;
                    let value = serde_json::to_string(default)?;
                    written += stmt.execute(params![path, value])? as u64;
                }
            }
            tx.commit()?;
            debug!("Filled {} absent fields in {}", written, collection);
            Ok(written)
        })
    }

    async fn increment(&self, collection: &str, id: &str, path: &[&str], by: i64) -> Result<()> {
        self.with_conn(|conn| {
            ensure_collection(conn, collection)?;
            let tx = conn.transaction()?;
            let existing: Option<String> = tx
                .query_row(
                    &format!(r#"SELECT body FROM "{collection}" WHERE id = ?1"#),
                    params![id],
                    |row| row.get(0),
                )
                .optional()?;

            let mut doc = match &existing {
                Some(body) => parse_body(body)?,
                None => {
                    let mut doc = Document::new();
                    doc.insert(ID_FIELD.to_string(), Value::String(id.to_string()));
                    doc
                }
            };
            increment_path(&mut doc, path, by)?;
            let body = serde_json::to_string(&doc)?;

            if existing.is_some() {
                tx.execute(
                    &format!(r#"UPDATE "{collection}" SET body = ?2 WHERE id = ?1"#),
                    params![id, body],
                )?;
            } else {
                tx.execute(
                    &format!(r#"INSERT INTO "{collection}" (id, body) VALUES (?1, ?2)"#),
                    params![id, body],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
    }

    async fn set_field(&self, collection: &str, id: &str, field: &str, value: Value) -> Result<bool> {
        if field == ID_FIELD {
            return Err(EtlError::InvalidUpdate("the _id field is immutable".to_string()));
        }
        let path = json_path(field)?;
        let value = serde_json::to_string(&value)?;
        self.with_conn(|conn| {
            ensure_collection(conn, collection)?;
            let changed = conn.execute(
                &format!(r#"UPDATE "{collection}" SET body = json_set(body, ?1, json(?2)) WHERE id = ?3"#),
                params![path, value, id],
            )?;
            Ok(changed > 0)
        })
    }

    async fn set_field_many(
        &self,
        collection: &str,
        field: &str,
        updates: Vec<(String, Value)>,
    ) -> Result<u64> {
        if field == ID_FIELD {
            return Err(EtlError::InvalidUpdate("the _id field is immutable".to_string()));
        }
        let path = json_path(field)?;
        self.with_conn(|conn| {
            ensure_collection(conn, collection)?;
            let tx = conn.transaction()?;
            let mut matched = 0u64;
            {
                let mut stmt = tx.prepare(&format!(
                    r#"UPDATE "{collection}" SET body = json_set(body, ?1, json(?2)) WHERE id = ?3"#
                ))?;
                for (id, value) in &updates {
                    let value = serde_json::to_string(value)?;
                    matched += stmt.execute(params![path, value, id])? as u64;
                }
            }
            tx.commit()?;
            debug!("Set {} on {} documents in {}", field, matched, collection);
            Ok(matched)
        })
    }

    async fn aggregate_field(&self, collection: &str, field: &str) -> Result<FieldAggregate> {
        let path = json_path(field)?;
        self.with_conn(|conn| {
            ensure_collection(conn, collection)?;
            let numeric = format!(
                r#"SELECT json_extract(body, ?1) AS v FROM "{collection}"
                   WHERE json_type(body, ?1) IN ('integer', 'real')"#
            );
            let (mean, n): (Option<f64>, i64) = conn.query_row(
                &format!("SELECT AVG(v), COUNT(v) FROM ({numeric})"),
                params![path],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            let total: i64 = conn.query_row(
                &format!(r#"SELECT COUNT(*) FROM "{collection}""#),
                [],
                |row| row.get(0),
            )?;

            let stddev = match mean {
                Some(mean) if n > 1 => {
                    let sum_sq: f64 = conn.query_row(
                        &format!("SELECT SUM((v - ?2) * (v - ?2)) FROM ({numeric})"),
                        params![path, mean],
                        |row| row.get(0),
                    )?;
                    Some((sum_sq / (n - 1) as f64).sqrt())
                }
                _ => None,
            };

            Ok(FieldAggregate {
                mean,
                stddev,
                count: total as u64,
            })
        })
    }

    async fn create_index(&self, collection: &str, spec: &IndexSpec) -> Result<()> {
        let columns = spec
            .keys
            .iter()
            .map(|key| {
                validate_field_name(&key.field)?;
                let direction = match key.order {
                    SortOrder::Ascending => "ASC",
                    SortOrder::Descending => "DESC",
                };
                Ok(format!(r#"json_extract(body, '$."{}"') {direction}"#, key.field))
            })
            .collect::<Result<Vec<_>>>()?
            .join(", ");
        let keys = serde_json::to_string(&spec.keys)?;

        self.with_conn(|conn| {
            ensure_collection(conn, collection)?;
            let existing: Option<String> = conn
                .query_row(
                    &format!("SELECT keys FROM {INDEX_CATALOG} WHERE collection = ?1 AND name = ?2"),
                    params![collection, spec.name],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(existing) = existing {
                if existing != keys {
                    return Err(EtlError::InvalidUpdate(format!(
                        "index {} already exists with different keys",
                        spec.name
                    )));
                }
                return Ok(());
            }

            let tx = conn.transaction()?;
            tx.execute_batch(&format!(
                r#"CREATE INDEX IF NOT EXISTS "{collection}__{name}" ON "{collection}" ({columns});"#,
                name = spec.name
            ))?;
            tx.execute(
                &format!("INSERT INTO {INDEX_CATALOG} (collection, name, keys) VALUES (?1, ?2, ?3)"),
                params![collection, spec.name, keys],
            )?;
            tx.commit()?;
            debug!("Created index {} on {}", spec.name, collection);
            Ok(())
        })
    }

    async fn list_indexes(&self, collection: &str) -> Result<Vec<IndexSpec>> {
        validate_collection_name(collection)?;
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT name, keys FROM {INDEX_CATALOG} WHERE collection = ?1 ORDER BY rowid"
            ))?;
            let rows = stmt
                .query_map(params![collection], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows.into_iter()
                .map(|(name, keys)| {
                    let keys: Vec<IndexKey> = serde_json::from_str(&keys)?;
                    Ok(IndexSpec { name, keys })
                })
                .collect()
        })
    }

    async fn close(&self) -> Result<()> {
        let conn = {
            let mut guard = self.conn.lock().map_err(|_| EtlError::LockPoisoned)?;
            guard.take()
        };
        match conn {
            Some(conn) => {
                conn.close().map_err(|(_, e)| EtlError::from(e))?;
                info!("🔒 Closed SQLite document store at {}", self.location);
                Ok(())
            }
            None => Ok(()),
        }
    }
}
