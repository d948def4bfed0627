use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use chrono::DateTime;
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::Type;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row, TransactionBehavior};

use super::counts;
use super::schema::{Schema, SCHEMA_VERSION};
use crate::error::{FlagError, Result};
use crate::flagging::{now_millis, FlagCount, Flagging, FlaggingId, OwnerKey, TargetRef};
use crate::store::{FlaggingFilter, Insertion, LedgerKey, LedgerStore, OwnerMatch};

const COLUMNS: &str = "id, flag_id, entity_type, entity_id, owner_key, uid, created, fields";

/// Connections per file-backed store. Readers run in parallel under WAL.
const POOL_SIZE: u32 = 8;

type PooledConn = PooledConnection<SqliteConnectionManager>;

/// SQLite-backed implementation of the LedgerStore trait.
///
/// Every write runs in a `BEGIN IMMEDIATE` transaction, so the existence
/// check and the insert/delete are serialized by the database itself and
/// stay correct when several processes share one file. Each call takes its
/// own pooled connection; a writer waiting on the database lock does not
/// hold up readers.
pub struct SqliteLedgerStore {
    pool: Pool<SqliteConnectionManager>,
}

impl SqliteLedgerStore {
    /// Open (or create) a database at the given path.
    ///
    /// `busy_timeout` bounds how long a writer waits for a competing one
    /// before failing with a persistence timeout. It also bounds the wait
    /// for a free pooled connection.
    pub fn open(path: &Path, busy_timeout: Duration) -> Result<Self> {
        let manager = SqliteConnectionManager::file(path).with_init(move |conn| conn.busy_timeout(busy_timeout));
        let pool = Pool::builder()
            .max_size(POOL_SIZE)
            .min_idle(Some(1))
            .connection_timeout(busy_timeout.max(Duration::from_millis(1)))
            .build(manager)
            .map_err(|e| FlagError::Storage(format!("open {}: {}", path.display(), e)))?;
        Self::init_with_pool(pool)
    }

    /// Create an in-memory database (for testing).
    ///
    /// Every in-memory connection is its own database, so the pool holds
    /// exactly one connection that is never recycled.
    pub fn open_in_memory() -> Result<Self> {
        let manager = SqliteConnectionManager::memory().with_init(|conn| conn.busy_timeout(Duration::from_secs(5)));
        let pool = Pool::builder()
            .max_size(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connection_timeout(Duration::from_secs(5))
            .build(manager)
            .map_err(|e| FlagError::Storage(format!("open_in_memory: {}", e)))?;
        Self::init_with_pool(pool)
    }

    fn init_with_pool(pool: Pool<SqliteConnectionManager>) -> Result<Self> {
        let store = Self { pool };
        let mut conn = store.conn()?;
        // WAL is stored in the database file, so once is enough.
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        Self::initialize(&mut conn)?;
        drop(conn);
        Ok(store)
    }

    fn initialize(conn: &mut Connection) -> Result<()> {
        // Two processes opening a fresh file must not both create the schema.
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let current_version = Self::schema_version(&tx).unwrap_or(0);

        if current_version == 0 {
            tx.execute_batch(Schema::create_tables())?;
            Self::set_schema_version(&tx, SCHEMA_VERSION)?;
        } else if current_version > SCHEMA_VERSION {
            return Err(FlagError::Storage(format!(
                "database schema version {} is newer than supported version {}",
                current_version, SCHEMA_VERSION
            )));
        }

        tx.commit()?;
        Ok(())
    }

    fn schema_version(conn: &Connection) -> Option<u32> {
        conn.query_row("SELECT MAX(version) FROM schema_version", [], |row| {
            row.get::<_, Option<u32>>(0)
        })
        .ok()
        .flatten()
    }

    fn set_schema_version(conn: &Connection, version: u32) -> Result<()> {
        conn.execute("INSERT INTO schema_version (version) VALUES (?1)", [version])?;
        Ok(())
    }

    fn conn(&self) -> Result<PooledConn> {
        self.pool
            .get()
            .map_err(|e| FlagError::PersistenceTimeout(format!("connection pool: {}", e)))
    }

    fn row_to_flagging(row: &Row<'_>) -> rusqlite::Result<Flagging> {
        let id: String = row.get(0)?;
        let owner_key: String = row.get(4)?;
        let uid: i64 = row.get(5)?;
        let created: i64 = row.get(6)?;
        let fields: String = row.get(7)?;

        let id = FlaggingId::parse(&id)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(e)))?;
        let owner = OwnerKey::parse_key(&owner_key).ok_or_else(|| {
            conversion_error(4, Type::Text, format!("bad owner key '{}'", owner_key))
        })?;
        let created_at = DateTime::from_timestamp_millis(created)
            .ok_or_else(|| conversion_error(6, Type::Integer, format!("bad timestamp {}", created)))?;
        let fields: BTreeMap<String, serde_json::Value> = serde_json::from_str(&fields)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(7, Type::Text, Box::new(e)))?;

        Ok(Flagging {
            id,
            flag_id: row.get(1)?,
            target: TargetRef::new(row.get::<_, String>(2)?, row.get::<_, String>(3)?),
            owner,
            created_by: uid as u64,
            created_at,
            fields,
        })
    }

    fn get_in(conn: &Connection, id: FlaggingId) -> Result<Option<Flagging>> {
        let sql = format!("SELECT {} FROM flaggings WHERE id = ?1", COLUMNS);
        Ok(conn
            .query_row(&sql, params![id.to_string()], Self::row_to_flagging)
            .optional()?)
    }

    fn find_in(conn: &Connection, key: &LedgerKey) -> Result<Vec<Flagging>> {
        let mut sql = format!(
            "SELECT {} FROM flaggings WHERE flag_id = ?1 AND entity_type = ?2 AND entity_id = ?3",
            COLUMNS
        );
        let mut values = vec![
            key.flag_id.clone(),
            key.target.entity_type.clone(),
            key.target.entity_id.clone(),
        ];
        if let OwnerMatch::Exact(owner) = key.owner {
            sql.push_str(" AND owner_key = ?4");
            values.push(owner.as_key());
        }
        sql.push_str(" ORDER BY created, rowid");

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(values.iter()), Self::row_to_flagging)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn insert_row(conn: &Connection, flagging: &Flagging) -> Result<()> {
        let fields = serde_json::to_string(&flagging.fields)?;
        conn.execute(
            "INSERT INTO flaggings (id, flag_id, entity_type, entity_id, owner_key, uid, created, fields)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                flagging.id.to_string(),
                flagging.flag_id,
                flagging.target.entity_type,
                flagging.target.entity_id,
                flagging.owner.as_key(),
                flagging.created_by as i64,
                flagging.created_at.timestamp_millis(),
                fields,
            ],
        )?;
        Ok(())
    }
}

fn conversion_error(idx: usize, ty: Type, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, ty, Box::new(FlagError::Storage(message)))
}

impl LedgerStore for SqliteLedgerStore {
    fn insert_if_absent(&self, key: &LedgerKey, candidate: Flagging) -> Result<Insertion> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        if let Some(existing) = Self::find_in(&tx, key)?.into_iter().next() {
            tx.commit()?;
            return Ok(Insertion::Existing(existing));
        }

        Self::insert_row(&tx, &candidate)?;
        counts::increment(
            &tx,
            &candidate.flag_id,
            &candidate.target,
            candidate.created_at.timestamp_millis(),
        )?;
        tx.commit()?;
        Ok(Insertion::Created(candidate))
    }

    fn delete_matching(&self, key: &LedgerKey) -> Result<Vec<Flagging>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let rows = Self::find_in(&tx, key)?;
        if rows.is_empty() {
            return Ok(rows);
        }
        for row in &rows {
            tx.execute("DELETE FROM flaggings WHERE id = ?1", params![row.id.to_string()])?;
        }
        counts::decrement(
            &tx,
            &key.flag_id,
            &key.target,
            rows.len() as u64,
            now_millis().timestamp_millis(),
        )?;
        tx.commit()?;
        Ok(rows)
    }

    fn delete_by_id(&self, id: FlaggingId) -> Result<Option<Flagging>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let Some(row) = Self::get_in(&tx, id)? else {
            return Ok(None);
        };
        tx.execute("DELETE FROM flaggings WHERE id = ?1", params![id.to_string()])?;
        counts::decrement(&tx, &row.flag_id, &row.target, 1, now_millis().timestamp_millis())?;
        tx.commit()?;
        Ok(Some(row))
    }

    fn get(&self, id: FlaggingId) -> Result<Option<Flagging>> {
        let conn = self.conn()?;
        Self::get_in(&conn, id)
    }

    fn find(&self, key: &LedgerKey) -> Result<Vec<Flagging>> {
        let conn = self.conn()?;
        Self::find_in(&conn, key)
    }

    fn list(&self, filter: &FlaggingFilter) -> Result<Vec<Flagging>> {
        let conn = self.conn()?;
        let (clause, values) = match filter {
            FlaggingFilter::Flag(flag_id) => ("flag_id = ?1", vec![flag_id.clone()]),
            FlaggingFilter::Target(target) => (
                "entity_type = ?1 AND entity_id = ?2",
                vec![target.entity_type.clone(), target.entity_id.clone()],
            ),
            FlaggingFilter::PersonalOwner(uid) => {
                ("owner_key = ?1", vec![OwnerKey::User(*uid).as_key()])
            }
        };
        let sql = format!(
            "SELECT {} FROM flaggings WHERE {} ORDER BY created, rowid",
            COLUMNS, clause
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(values.iter()), Self::row_to_flagging)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn update_fields(
        &self,
        id: FlaggingId,
        fields: BTreeMap<String, serde_json::Value>,
    ) -> Result<Flagging> {
        let conn = self.conn()?;
        let json = serde_json::to_string(&fields)?;
        let changed = conn.execute(
            "UPDATE flaggings SET fields = ?1 WHERE id = ?2",
            params![json, id.to_string()],
        )?;
        if changed == 0 {
            return Err(FlagError::FlaggingNotFound(id));
        }
        Self::get_in(&conn, id)?.ok_or(FlagError::FlaggingNotFound(id))
    }

    fn count(&self, flag_id: &str, target: &TargetRef) -> Result<u64> {
        let conn = self.conn()?;
        counts::get(&conn, flag_id, target)
    }

    fn counts_for_flag(&self, flag_id: &str) -> Result<Vec<FlagCount>> {
        let conn = self.conn()?;
        counts::for_flag(&conn, flag_id)
    }

    fn rebuild_counts(&self, flag_id: &str) -> Result<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let written = counts::rebuild(&tx, flag_id, now_millis().timestamp_millis())?;
        tx.commit()?;
        Ok(written)
    }
}
