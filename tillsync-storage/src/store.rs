//! Collection store: keyed records with non-unique secondary indices.
//!
//! Every record lives in one `records` table keyed by `(collection, pk)`.
//! Index entries live in `record_index`, one row per `(collection, index, pk)`,
//! written from the plaintext record at put time. When an encryptor is
//! configured the `body` column holds an envelope; index rows only ever hold
//! the fields the collection declares.

use crate::error::{StorageError, StorageResult};
use crate::schema::{self, CollectionSchema, IndexSpec, SCHEMA_VERSION};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Transaction, TransactionBehavior};
use serde_json::Value;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tillsync_crypto::{DataEncryptor, EncryptedEnvelope, KeyedEncryptor, PassthroughEncryptor};
use tracing::{debug, info, warn};

/// How long a writer waits on another context's lock before failing.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Keyed, versioned store backed by SQLite.
///
/// Cheap to clone; clones share one connection. Separate processes open
/// their own `LocalStore` on the same file and rely on SQLite locking.
#[derive(Clone)]
pub struct LocalStore {
    conn: Arc<Mutex<Connection>>,
    encryptor: Arc<dyn DataEncryptor>,
}

impl LocalStore {
    /// Opens or creates a store at the given path (no encryption).
    pub fn open(path: &Path) -> StorageResult<Self> {
        Self::open_with_encryptor(path, Arc::new(PassthroughEncryptor))
    }

    /// Opens an in-memory store (for testing).
    pub fn open_in_memory() -> StorageResult<Self> {
        Self::open_in_memory_with_encryptor(Arc::new(PassthroughEncryptor))
    }

    /// Opens a store that seals records through `encryptor`.
    pub fn open_with_encryptor(
        path: &Path,
        encryptor: Arc<dyn DataEncryptor>,
    ) -> StorageResult<Self> {
        let mut conn = open_connection(path)?;
        initialize_schema(&mut conn).map_err(classify_open_error)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            encryptor,
        })
    }

    pub fn open_in_memory_with_encryptor(encryptor: Arc<dyn DataEncryptor>) -> StorageResult<Self> {
        let mut conn = Connection::open_in_memory()?;
        initialize_schema(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            encryptor,
        })
    }

    /// Opens an encrypted store and loads (or creates) the device key.
    pub fn open_secure(path: &Path) -> StorageResult<Self> {
        let encryptor = Arc::new(KeyedEncryptor::new());
        let store = Self::open_with_encryptor(path, encryptor.clone())?;
        crate::keyring::bootstrap(&store, &encryptor)?;
        Ok(store)
    }

    /// Returns the schema version recorded in the database.
    pub fn schema_version(&self) -> StorageResult<u32> {
        let conn = self.conn()?;
        Ok(conn.query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    // ── Reads ──

    /// Gets one record by primary key. Decryption failures propagate.
    pub fn get(&self, collection: &str, key: &Value) -> StorageResult<Option<Value>> {
        let schema = collection_schema(collection)?;
        let pk = primary_key_text(schema, key)?;

        let body: Option<String> = {
            let conn = self.conn()?;
            conn.query_row(
                "SELECT body FROM records WHERE collection = ?1 AND pk = ?2",
                params![collection, pk],
                |row| row.get(0),
            )
            .optional()?
        };

        body.map(|b| self.open_body(&b)).transpose()
    }

    /// Gets every record in a collection, skipping undecryptable ones.
    pub fn get_all(&self, collection: &str) -> StorageResult<Vec<Value>> {
        collection_schema(collection)?;
        let rows = {
            let conn = self.conn()?;
            let mut stmt =
                conn.prepare("SELECT pk, body FROM records WHERE collection = ?1 ORDER BY pk")?;
            let rows = stmt
                .query_map(params![collection], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<Result<Vec<(String, String)>, _>>()?;
            rows
        };
        Ok(self.open_rows(collection, rows))
    }

    /// Gets every record whose `index` field equals `value`.
    pub fn get_by_index(
        &self,
        collection: &str,
        index: &str,
        value: &Value,
    ) -> StorageResult<Vec<Value>> {
        let schema = collection_schema(collection)?;
        index_spec(schema, index)?;

        let Some((text, num)) = index_key(value) else {
            return Ok(Vec::new());
        };

        let rows = {
            let conn = self.conn()?;
            let (sql, lookup): (&str, &dyn rusqlite::ToSql) = match &num {
                Some(n) => (
                    "SELECT r.pk, r.body FROM record_index i \
                     JOIN records r ON r.collection = i.collection AND r.pk = i.pk \
                     WHERE i.collection = ?1 AND i.index_name = ?2 AND i.num = ?3 \
                     ORDER BY r.pk",
                    n as &dyn rusqlite::ToSql,
                ),
                None => (
                    "SELECT r.pk, r.body FROM record_index i \
                     JOIN records r ON r.collection = i.collection AND r.pk = i.pk \
                     WHERE i.collection = ?1 AND i.index_name = ?2 AND i.value = ?3 \
                     ORDER BY r.pk",
                    &text as &dyn rusqlite::ToSql,
                ),
            };
            let mut stmt = conn.prepare(sql)?;
            let rows = stmt
                .query_map(params![collection, index, lookup], |row| {
                    Ok((row.get(0)?, row.get(1)?))
                })?
                .collect::<Result<Vec<(String, String)>, _>>()?;
            rows
        };
        Ok(self.open_rows(collection, rows))
    }

    /// Walks `index` in descending order and returns up to `limit` records,
    /// optionally keeping only records whose `field` equals the given value.
    ///
    /// Records without a value for `index` are not visited.
    pub fn latest_by_index(
        &self,
        collection: &str,
        index: &str,
        limit: usize,
        filter: Option<(&str, &Value)>,
    ) -> StorageResult<Vec<Value>> {
        let schema = collection_schema(collection)?;
        let spec = index_spec(schema, index)?;
        if !spec.ordered {
            debug!("latest_by_index on unordered index {collection}.{index}");
        }

        let rows = {
            let conn = self.conn()?;
            let mut stmt = conn.prepare(
                "SELECT r.pk, r.body FROM record_index i \
                 JOIN records r ON r.collection = i.collection AND r.pk = i.pk \
                 WHERE i.collection = ?1 AND i.index_name = ?2 \
                 ORDER BY i.num DESC, i.value DESC, r.pk DESC",
            )?;
            let rows = stmt
                .query_map(params![collection, index], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<Result<Vec<(String, String)>, _>>()?;
            rows
        };

        let mut out = Vec::new();
        for (pk, body) in rows {
            if out.len() >= limit {
                break;
            }
            let record = match self.open_body(&body) {
                Ok(record) => record,
                Err(e) => {
                    warn!("skipping record {pk} in {collection}: {e}");
                    continue;
                }
            };
            let keep = match filter {
                Some((field, expected)) => record.get(field) == Some(expected),
                None => true,
            };
            if keep {
                out.push(record);
            }
        }
        Ok(out)
    }

    /// Number of stored records, including ones this key cannot open.
    pub fn count(&self, collection: &str) -> StorageResult<usize> {
        collection_schema(collection)?;
        let conn = self.conn()?;
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM records WHERE collection = ?1",
            params![collection],
            |row| row.get(0),
        )?;
        Ok(n as usize)
    }

    // ── Writes ──

    /// Inserts or replaces a record.
    pub fn put(&self, collection: &str, record: &Value) -> StorageResult<()> {
        let schema = collection_schema(collection)?;
        let prepared = self.prepare(schema, record)?;

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        write_record(&tx, schema, &prepared)?;
        tx.commit()?;
        Ok(())
    }

    /// Inserts a record, failing with [`StorageError::Duplicate`] if the key exists.
    pub fn insert(&self, collection: &str, record: &Value) -> StorageResult<()> {
        let schema = collection_schema(collection)?;
        let prepared = self.prepare(schema, record)?;

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        if record_exists(&tx, collection, &prepared.pk)? {
            return Err(StorageError::Duplicate {
                collection: collection.to_string(),
                key: prepared.pk,
            });
        }
        write_record(&tx, schema, &prepared)?;
        tx.commit()?;
        Ok(())
    }

    /// Replaces an existing record. Returns false, writing nothing, if the
    /// key is absent.
    pub fn update(&self, collection: &str, record: &Value) -> StorageResult<bool> {
        let schema = collection_schema(collection)?;
        let prepared = self.prepare(schema, record)?;

        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        if !record_exists(&tx, collection, &prepared.pk)? {
            return Ok(false);
        }
        write_record(&tx, schema, &prepared)?;
        tx.commit()?;
        Ok(true)
    }

    /// Inserts or replaces a batch of records atomically.
    pub fn bulk_put(&self, collection: &str, records: &[Value]) -> StorageResult<()> {
        let schema = collection_schema(collection)?;
        let prepared = records
            .iter()
            .map(|r| self.prepare(schema, r))
            .collect::<StorageResult<Vec<_>>>()?;

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        for p in &prepared {
            write_record(&tx, schema, p)?;
        }
        tx.commit()?;
        debug!("bulk_put {} records into {collection}", prepared.len());
        Ok(())
    }

    /// Clears a collection and loads `records` in a single transaction.
    pub fn replace_all(&self, collection: &str, records: &[Value]) -> StorageResult<()> {
        let schema = collection_schema(collection)?;
        let prepared = records
            .iter()
            .map(|r| self.prepare(schema, r))
            .collect::<StorageResult<Vec<_>>>()?;

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        clear_collection(&tx, collection)?;
        for p in &prepared {
            write_record(&tx, schema, p)?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Deletes a record. Returns true if it existed.
    pub fn delete(&self, collection: &str, key: &Value) -> StorageResult<bool> {
        let schema = collection_schema(collection)?;
        let pk = primary_key_text(schema, key)?;

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM record_index WHERE collection = ?1 AND pk = ?2",
            params![collection, pk],
        )?;
        let removed = tx.execute(
            "DELETE FROM records WHERE collection = ?1 AND pk = ?2",
            params![collection, pk],
        )?;
        tx.commit()?;
        Ok(removed > 0)
    }

    /// Removes every record from a collection.
    pub fn clear(&self, collection: &str) -> StorageResult<()> {
        collection_schema(collection)?;
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        clear_collection(&tx, collection)?;
        tx.commit()?;
        Ok(())
    }

    // ── Raw access (bypasses the envelope) ──

    /// Reads the stored value without opening it.
    pub fn get_raw(&self, collection: &str, key: &Value) -> StorageResult<Option<Value>> {
        let schema = collection_schema(collection)?;
        let pk = primary_key_text(schema, key)?;
        let conn = self.conn()?;
        let body: Option<String> = conn
            .query_row(
                "SELECT body FROM records WHERE collection = ?1 AND pk = ?2",
                params![collection, pk],
                |row| row.get(0),
            )
            .optional()?;
        body.map(|b| serde_json::from_str(&b).map_err(StorageError::from))
            .transpose()
    }

    /// Writes `record` unencrypted unless its key already exists.
    /// Returns true if this call wrote it.
    pub fn put_raw_if_absent(&self, collection: &str, record: &Value) -> StorageResult<bool> {
        let schema = collection_schema(collection)?;
        let prepared = PreparedRecord::plain(schema, record)?;

        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        if record_exists(&tx, collection, &prepared.pk)? {
            return Ok(false);
        }
        write_record(&tx, schema, &prepared)?;
        tx.commit()?;
        Ok(true)
    }

    /// Writes `record` unencrypted, replacing any existing value.
    pub fn put_raw(&self, collection: &str, record: &Value) -> StorageResult<()> {
        let schema = collection_schema(collection)?;
        let prepared = PreparedRecord::plain(schema, record)?;

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        write_record(&tx, schema, &prepared)?;
        tx.commit()?;
        Ok(())
    }

    // ── Internals ──

    fn conn(&self) -> StorageResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StorageError::LockPoisoned)
    }

    fn prepare(&self, schema: &CollectionSchema, record: &Value) -> StorageResult<PreparedRecord> {
        let pk = primary_key_text(schema, record_key(schema, record)?)?;
        let stored = self
            .encryptor
            .seal(record, &schema.preserved_fields())
            .map_err(StorageError::from_seal)?;
        Ok(PreparedRecord {
            pk,
            body: serde_json::to_string(&stored)?,
            index_values: index_values(schema, record),
        })
    }

    fn open_body(&self, body: &str) -> StorageResult<Value> {
        let stored: Value = serde_json::from_str(body)?;
        self.encryptor.open(stored).map_err(StorageError::from_open)
    }

    /// Opens each row, logging and skipping the ones that fail.
    fn open_rows(&self, collection: &str, rows: Vec<(String, String)>) -> Vec<Value> {
        let mut out = Vec::with_capacity(rows.len());
        for (pk, body) in rows {
            match self.open_body(&body) {
                Ok(record) => out.push(record),
                Err(e) => warn!("skipping record {pk} in {collection}: {e}"),
            }
        }
        out
    }
}

/// A record ready to be written: sealed body plus plaintext index values.
struct PreparedRecord {
    pk: String,
    body: String,
    index_values: Vec<(&'static str, String, Option<f64>)>,
}

impl PreparedRecord {
    fn plain(schema: &CollectionSchema, record: &Value) -> StorageResult<Self> {
        Ok(Self {
            pk: primary_key_text(schema, record_key(schema, record)?)?,
            body: serde_json::to_string(record)?,
            index_values: index_values(schema, record),
        })
    }
}

fn collection_schema(name: &str) -> StorageResult<&'static CollectionSchema> {
    schema::find(name).ok_or_else(|| StorageError::UnknownCollection(name.to_string()))
}

fn index_spec<'a>(schema: &'a CollectionSchema, index: &str) -> StorageResult<&'a IndexSpec> {
    schema.index(index).ok_or_else(|| StorageError::UnknownIndex {
        collection: schema.name.to_string(),
        index: index.to_string(),
    })
}

fn record_key<'a>(schema: &CollectionSchema, record: &'a Value) -> StorageResult<&'a Value> {
    record
        .get(schema.key_path)
        .filter(|v| !v.is_null())
        .ok_or_else(|| StorageError::MissingKey {
            collection: schema.name.to_string(),
            key_path: schema.key_path.to_string(),
        })
}

/// Primary keys are strings or numbers, stored as their JSON text so that
/// `5` and `"5"` stay distinct.
fn primary_key_text(schema: &CollectionSchema, key: &Value) -> StorageResult<String> {
    match key {
        Value::String(_) | Value::Number(_) => Ok(key.to_string()),
        _ => Err(StorageError::MissingKey {
            collection: schema.name.to_string(),
            key_path: schema.key_path.to_string(),
        }),
    }
}

/// Encodes an index value as `(json_text, numeric)`. `null` is not indexable.
fn index_key(value: &Value) -> Option<(String, Option<f64>)> {
    match value {
        Value::Null => None,
        Value::Number(n) => Some((value.to_string(), n.as_f64())),
        _ => Some((value.to_string(), None)),
    }
}

fn index_values(
    schema: &CollectionSchema,
    source: &Value,
) -> Vec<(&'static str, String, Option<f64>)> {
    schema
        .indices
        .iter()
        .filter_map(|idx| {
            let (text, num) = index_key(source.get(idx.field)?)?;
            Some((idx.name, text, num))
        })
        .collect()
}

fn record_exists(tx: &Transaction<'_>, collection: &str, pk: &str) -> StorageResult<bool> {
    Ok(tx
        .query_row(
            "SELECT 1 FROM records WHERE collection = ?1 AND pk = ?2",
            params![collection, pk],
            |_| Ok(()),
        )
        .optional()?
        .is_some())
}

fn write_record(
    tx: &Transaction<'_>,
    schema: &CollectionSchema,
    record: &PreparedRecord,
) -> StorageResult<()> {
    tx.execute(
        "INSERT OR REPLACE INTO records (collection, pk, body) VALUES (?1, ?2, ?3)",
        params![schema.name, record.pk, record.body],
    )?;
    tx.execute(
        "DELETE FROM record_index WHERE collection = ?1 AND pk = ?2",
        params![schema.name, record.pk],
    )?;
    for (index, text, num) in &record.index_values {
        tx.execute(
            "INSERT INTO record_index (collection, index_name, value, num, pk) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![schema.name, index, text, num, record.pk],
        )?;
    }
    Ok(())
}

fn clear_collection(tx: &Transaction<'_>, collection: &str) -> StorageResult<()> {
    tx.execute(
        "DELETE FROM record_index WHERE collection = ?1",
        params![collection],
    )?;
    tx.execute("DELETE FROM records WHERE collection = ?1", params![collection])?;
    Ok(())
}

fn open_connection(path: &Path) -> StorageResult<Connection> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| {
            StorageError::Unavailable(format!("cannot create {}: {e}", parent.display()))
        })?;
    }

    let conn = Connection::open(path).map_err(|e| {
        StorageError::Unavailable(format!("cannot open {}: {e}", path.display()))
    })?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    let mode: String = conn
        .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))
        .map_err(classify_open_error)?;
    debug!("opened {} (journal_mode={mode})", path.display());
    Ok(conn)
}

/// Maps errors that mean "the platform will not let us persist" to
/// [`StorageError::Unavailable`].
fn classify_open_error(err: impl Into<StorageError>) -> StorageError {
    let err = err.into();
    if let StorageError::Database(ref db) = err {
        if matches!(
            db.sqlite_error_code(),
            Some(
                ErrorCode::ReadOnly
                    | ErrorCode::CannotOpen
                    | ErrorCode::PermissionDenied
                    | ErrorCode::DiskFull
                    | ErrorCode::SystemIoFailure
                    | ErrorCode::NotADatabase
            )
        ) {
            return StorageError::Unavailable(db.to_string());
        }
    }
    err
}

/// Creates tables and registers collections and indices.
///
/// Runs inside one IMMEDIATE transaction so concurrent opens from separate
/// contexts serialize on the write lock and converge on the same version.
fn initialize_schema(conn: &mut Connection) -> StorageResult<()> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    tx.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS collections (
            name TEXT PRIMARY KEY,
            key_path TEXT NOT NULL,
            since INTEGER NOT NULL
        );
        CREATE TABLE IF NOT EXISTS collection_indices (
            collection TEXT NOT NULL,
            index_name TEXT NOT NULL,
            field TEXT NOT NULL,
            ordered INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (collection, index_name)
        );
        CREATE TABLE IF NOT EXISTS records (
            collection TEXT NOT NULL,
            pk TEXT NOT NULL,
            body TEXT NOT NULL,
            PRIMARY KEY (collection, pk)
        );
        CREATE TABLE IF NOT EXISTS record_index (
            collection TEXT NOT NULL,
            index_name TEXT NOT NULL,
            value TEXT NOT NULL,
            num REAL,
            pk TEXT NOT NULL,
            PRIMARY KEY (collection, index_name, pk)
        );
        CREATE INDEX IF NOT EXISTS idx_record_index_value
            ON record_index(collection, index_name, value);
        CREATE INDEX IF NOT EXISTS idx_record_index_num
            ON record_index(collection, index_name, num, value);
        "#,
    )?;

    let current: u32 = tx.query_row("PRAGMA user_version", [], |row| row.get(0))?;

    for c in schema::collections() {
        tx.execute(
            "INSERT OR IGNORE INTO collections (name, key_path, since) VALUES (?1, ?2, ?3)",
            params![c.name, c.key_path, c.since],
        )?;
        for idx in c.indices {
            let added = tx.execute(
                "INSERT OR IGNORE INTO collection_indices (collection, index_name, field, ordered) \
                 VALUES (?1, ?2, ?3, ?4)",
                params![c.name, idx.name, idx.field, idx.ordered],
            )?;
            if added > 0 {
                let n = backfill_index(&tx, c, idx)?;
                if n > 0 {
                    info!("back-filled index {}.{} with {n} entries", c.name, idx.name);
                }
            }
        }
    }

    if current < SCHEMA_VERSION {
        tx.execute_batch(&format!("PRAGMA user_version = {SCHEMA_VERSION}"))?;
        info!("store schema upgraded from v{current} to v{SCHEMA_VERSION}");
    }

    tx.commit()?;
    Ok(())
}

/// Indexes existing records of `schema` under a newly declared index, using
/// the envelope's plaintext fields (or the record itself for legacy rows).
fn backfill_index(
    tx: &Transaction<'_>,
    schema: &CollectionSchema,
    idx: &IndexSpec,
) -> StorageResult<usize> {
    let rows = {
        let mut stmt = tx.prepare("SELECT pk, body FROM records WHERE collection = ?1")?;
        let rows = stmt
            .query_map(params![schema.name], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<(String, String)>, _>>()?;
        rows
    };

    let mut written = 0;
    for (pk, body) in rows {
        let Ok(stored) = serde_json::from_str::<Value>(&body) else {
            continue;
        };
        let source = match EncryptedEnvelope::from_value(&stored) {
            Some(env) => env.index_field(idx.field).cloned(),
            None => stored.get(idx.field).cloned(),
        };
        let Some((text, num)) = source.as_ref().and_then(index_key) else {
            continue;
        };
        tx.execute(
            "INSERT OR REPLACE INTO record_index (collection, index_name, value, num, pk) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![schema.name, idx.name, text, num, pk],
        )?;
        written += 1;
    }
    Ok(written)
}
