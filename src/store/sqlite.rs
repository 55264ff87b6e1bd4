//! Embedded SQLite-backed [`DataStore`].
//!
//! Documents live as JSON rows in a single `records` table keyed by
//! `(collection, id)`; enumeration order is rowid order, which is insertion order.
//! The `catalog` table holds materialized collection names so a collection survives
//! being emptied. The `meta` table carries the password check hash.
//!
//! Password protection is application-level: a SHA-256 check hash of the credential
//! is stored at creation and verified on every open. A mismatch, a missing
//! credential for a protected file, or a supplied credential for an unprotected
//! file all surface as [`DocbaseError::WrongPassword`], distinguishable from
//! corruption and IO failures.

use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::DocbaseError;
use crate::store::{
    build_file_records, reassemble_chunks, ConnectionMode, DataStore, Record,
    CHUNKS_COLLECTION, FILES_COLLECTION, ID_FIELD,
};

const PASSWORD_KEY: &str = "password_sha256";

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS catalog (
    name TEXT PRIMARY KEY
);
CREATE TABLE IF NOT EXISTS records (
    collection TEXT NOT NULL,
    id TEXT NOT NULL,
    body TEXT NOT NULL,
    PRIMARY KEY (collection, id)
);
CREATE TABLE IF NOT EXISTS meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
";

#[derive(Debug)]
pub struct SqliteStore {
    location: PathBuf,
    read_only: bool,
    /// `None` once closed. The handle is released exactly once, by the owning
    /// `DatabaseReference` at dispose.
    conn: Mutex<Option<Connection>>,
}

impl SqliteStore {
    /// Open (or create, unless read-only) a store file and verify credentials.
    pub fn open<P: AsRef<Path>>(
        path: P,
        mode: ConnectionMode,
        password: Option<&str>,
    ) -> Result<SqliteStore, DocbaseError> {
        let path = path.as_ref();
        let read_only = matches!(mode, ConnectionMode::ReadOnly);

        let conn = if read_only {
            if !path.exists() {
                return Err(DocbaseError::NotFound(format!("{}", path.display())));
            }
            let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
            // A read-only open cannot create the schema, so its absence is
            // reported here rather than as a raw SQL error on first use.
            let tables: i64 = conn.query_row(
                "SELECT COUNT(*) FROM sqlite_master
                 WHERE type = 'table' AND name IN ('catalog', 'records', 'meta')",
                [],
                |row| row.get(0),
            )?;
            if tables < 3 {
                return Err(DocbaseError::Store(format!(
                    "{} holds no document store schema",
                    path.display()
                )));
            }
            conn
        } else {
            Connection::open(path)?
        };
        if matches!(mode, ConnectionMode::Exclusive) {
            conn.pragma_update(None, "locking_mode", "EXCLUSIVE")?;
        }
        if !read_only {
            conn.execute_batch(SCHEMA)?;
        }
        Self::check_password(&conn, password, read_only)?;

        tracing::debug!("Opened store {:?} in {:?} mode", path, mode);
        Ok(SqliteStore {
            location: path.to_path_buf(),
            read_only,
            conn: Mutex::new(Some(conn)),
        })
    }

    /// Probe whether a store file requires credentials, without opening it for use.
    /// Wrong-password is the only failure translated into `Ok(true)`; everything
    /// else (missing file, corruption) propagates.
    pub fn is_password_protected<P: AsRef<Path>>(path: P) -> Result<bool, DocbaseError> {
        match SqliteStore::open(path, ConnectionMode::ReadOnly, None) {
            Ok(store) => {
                store.close();
                Ok(false)
            }
            Err(DocbaseError::WrongPassword) => Ok(true),
            Err(other) => Err(other),
        }
    }

    fn check_password(
        conn: &Connection,
        password: Option<&str>,
        read_only: bool,
    ) -> Result<(), DocbaseError> {
        let stored = Self::stored_password(conn)?;
        match (stored, password) {
            (None, None) => Ok(()),
            (Some(stored), Some(given)) => {
                if stored == hash_password(given) {
                    Ok(())
                } else {
                    Err(DocbaseError::WrongPassword)
                }
            }
            (Some(_), None) => Err(DocbaseError::WrongPassword),
            (None, Some(given)) => {
                // A credential is only accepted for a file that has never held
                // data: that is the "create protected database" path. Supplying
                // one for an existing unprotected file is a credential mismatch.
                if !read_only && Self::is_empty_database(conn)? {
                    conn.execute(
                        "INSERT OR REPLACE INTO meta (key, value) VALUES (?1, ?2)",
                        params![PASSWORD_KEY, hash_password(given)],
                    )?;
                    Ok(())
                } else {
                    Err(DocbaseError::WrongPassword)
                }
            }
        }
    }

    fn stored_password(conn: &Connection) -> Result<Option<String>, DocbaseError> {
        let result = conn.query_row(
            "SELECT value FROM meta WHERE key = ?1",
            params![PASSWORD_KEY],
            |row| row.get::<_, String>(0),
        );
        match result {
            Ok(hash) => Ok(Some(hash)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(other) => Err(other.into()),
        }
    }

    fn is_empty_database(conn: &Connection) -> Result<bool, DocbaseError> {
        let collections: i64 =
            conn.query_row("SELECT COUNT(*) FROM catalog", [], |row| row.get(0))?;
        Ok(collections == 0)
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, DocbaseError>,
    ) -> Result<T, DocbaseError> {
        let guard = self.conn.lock();
        let conn = guard
            .as_ref()
            .ok_or_else(|| DocbaseError::Store("connection is closed".to_string()))?;
        f(conn)
    }

    fn guard_writable(&self) -> Result<(), DocbaseError> {
        if self.read_only {
            return Err(DocbaseError::PermissionDenied);
        }
        Ok(())
    }
}

/// Store identifiers are JSON values; their canonical JSON text is the row key.
fn encode_id(id: &Value) -> Result<String, DocbaseError> {
    Ok(serde_json::to_string(id)?)
}

fn hash_password(password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}

impl DataStore for SqliteStore {
    fn location(&self) -> &Path {
        &self.location
    }

    fn collection_names(&self) -> Result<Vec<String>, DocbaseError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT name FROM catalog ORDER BY rowid")?;
            let names = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<String>, _>>()?;
            Ok(names)
        })
    }

    fn enumerate(&self, collection: &str) -> Result<Vec<Record>, DocbaseError> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT body FROM records WHERE collection = ?1 ORDER BY rowid")?;
            let bodies = stmt
                .query_map(params![collection], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<String>, _>>()?;
            bodies
                .iter()
                .map(|body| Ok(serde_json::from_str::<Record>(body)?))
                .collect()
        })
    }

    fn fetch(&self, collection: &str, id: &Value) -> Result<Option<Record>, DocbaseError> {
        let key = encode_id(id)?;
        self.with_conn(|conn| {
            let body: Option<String> = conn
                .query_row(
                    "SELECT body FROM records WHERE collection = ?1 AND id = ?2",
                    params![collection, key],
                    |row| row.get(0),
                )
                .optional()?;
            match body {
                Some(body) => Ok(Some(serde_json::from_str::<Record>(&body)?)),
                None => Ok(None),
            }
        })
    }

    fn insert(&self, collection: &str, record: &Record) -> Result<Value, DocbaseError> {
        self.guard_writable()?;
        let id = record
            .get(ID_FIELD)
            .cloned()
            .unwrap_or_else(|| Value::String(Uuid::new_v4().to_string()));
        let key = encode_id(&id)?;
        let mut body = record.clone();
        body.insert(ID_FIELD.to_string(), id.clone());
        let body = serde_json::to_string(&Value::Object(body))?;

        self.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            tx.execute(
                "INSERT OR IGNORE INTO catalog (name) VALUES (?1)",
                params![collection],
            )?;
            tx.execute(
                "INSERT INTO records (collection, id, body) VALUES (?1, ?2, ?3)",
                params![collection, key, body],
            )
            .map_err(|err| match err {
                rusqlite::Error::SqliteFailure(e, _)
                    if e.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    DocbaseError::Store(format!(
                        "duplicate _id in collection {collection:?}: {id}"
                    ))
                }
                other => other.into(),
            })?;
            tx.commit()?;
            Ok(())
        })?;
        Ok(id)
    }

    fn update(&self, collection: &str, id: &Value, record: &Record) -> Result<(), DocbaseError> {
        self.guard_writable()?;
        let key = encode_id(id)?;
        let mut body = record.clone();
        body.insert(ID_FIELD.to_string(), id.clone());
        let body = serde_json::to_string(&Value::Object(body))?;

        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE records SET body = ?3 WHERE collection = ?1 AND id = ?2",
                params![collection, key, body],
            )?;
            if changed == 0 {
                return Err(DocbaseError::NotFound(format!(
                    "record {id} in {collection:?}"
                )));
            }
            Ok(())
        })
    }

    fn delete(&self, collection: &str, id: &Value) -> Result<(), DocbaseError> {
        self.guard_writable()?;
        let key = encode_id(id)?;
        self.with_conn(|conn| {
            let changed = conn.execute(
                "DELETE FROM records WHERE collection = ?1 AND id = ?2",
                params![collection, key],
            )?;
            if changed == 0 {
                return Err(DocbaseError::NotFound(format!(
                    "record {id} in {collection:?}"
                )));
            }
            Ok(())
        })
    }

    fn rename_collection(&self, from: &str, to: &str) -> Result<(), DocbaseError> {
        self.guard_writable()?;
        self.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            let taken: i64 = tx.query_row(
                "SELECT COUNT(*) FROM catalog WHERE name = ?1",
                params![to],
                |row| row.get(0),
            )?;
            if taken > 0 {
                return Err(DocbaseError::DuplicateName(to.to_string()));
            }
            let changed = tx.execute(
                "UPDATE catalog SET name = ?2 WHERE name = ?1",
                params![from, to],
            )?;
            if changed == 0 {
                return Err(DocbaseError::NotFound(format!("collection {from:?}")));
            }
            tx.execute(
                "UPDATE records SET collection = ?2 WHERE collection = ?1",
                params![from, to],
            )?;
            tx.commit()?;
            Ok(())
        })
    }

    fn drop_collection(&self, name: &str) -> Result<(), DocbaseError> {
        self.guard_writable()?;
        self.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            let changed = tx.execute("DELETE FROM catalog WHERE name = ?1", params![name])?;
            if changed == 0 {
                return Err(DocbaseError::NotFound(format!("collection {name:?}")));
            }
            tx.execute(
                "DELETE FROM records WHERE collection = ?1",
                params![name],
            )?;
            tx.commit()?;
            Ok(())
        })
    }

    fn upload_file(&self, id: &str, source: &Path) -> Result<Record, DocbaseError> {
        self.guard_writable()?;
        let bytes = fs::read(source)?;
        let (meta, chunks) = build_file_records(id, source, &bytes);
        self.insert(FILES_COLLECTION, &meta)?;
        for chunk in &chunks {
            self.insert(CHUNKS_COLLECTION, chunk)?;
        }
        Ok(meta)
    }

    fn file_exists(&self, id: &str) -> Result<bool, DocbaseError> {
        let wanted = Value::String(id.to_string());
        Ok(self.fetch(FILES_COLLECTION, &wanted)?.is_some())
    }

    fn read_file(&self, id: &str) -> Result<Vec<u8>, DocbaseError> {
        let rows = self.enumerate(CHUNKS_COLLECTION)?;
        reassemble_chunks(id, &rows)
    }

    fn save_file(&self, id: &str, target: &Path) -> Result<(), DocbaseError> {
        let bytes = self.read_file(id)?;
        fs::write(target, bytes)?;
        Ok(())
    }

    fn close(&self) {
        if let Some(conn) = self.conn.lock().take() {
            if let Err((_conn, err)) = conn.close() {
                tracing::warn!("Failed to close store {:?}: {err}", self.location);
            }
        }
    }
}
