//! SQLite database with Diesel ORM
//!
//! Owns the connection pool and the schema: the append-only measurement log,
//! its tombstone and override tables, the `batches_effective` view that merges
//! them, the tick cursor, component lifetime counters and the alarm log.
//! Schema is created with raw SQL at open time.

use crate::error::{Error, Result, APPEND_ONLY_MARKER};
use crate::lifetime::DEFAULT_TICK_KEY;
use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, CustomizeConnection, Pool, PooledConnection};
use diesel::sqlite::SqliteConnection;
use std::path::Path;
use std::time::Duration;

const DEFAULT_DB_PATH: &str = "ballwatch.db";

/// How long a writer waits on `BEGIN IMMEDIATE` before SQLite reports busy.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Text timestamp layout, identical to SQLite's `datetime('now')`.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

type DbPool = Pool<ConnectionManager<SqliteConnection>>;
pub(crate) type DbConn = PooledConnection<ConnectionManager<SqliteConnection>>;

/// Database connection wrapper with connection pool
#[derive(Clone)]
pub struct Database {
    pool: DbPool,
}

#[derive(Debug)]
struct ConnectionOptions {
    busy_timeout: Duration,
}

impl CustomizeConnection<SqliteConnection, diesel::r2d2::Error> for ConnectionOptions {
    fn on_acquire(&self, conn: &mut SqliteConnection) -> std::result::Result<(), diesel::r2d2::Error> {
        conn.batch_execute(&format!(
            "PRAGMA busy_timeout = {}; PRAGMA foreign_keys = ON;",
            self.busy_timeout.as_millis()
        ))
        .map_err(diesel::r2d2::Error::QueryError)
    }
}

pub(crate) fn format_timestamp(at: chrono::DateTime<chrono::Utc>) -> String {
    at.format(TIMESTAMP_FORMAT).to_string()
}

impl Database {
    /// Get the default database path
    pub fn db_path() -> std::path::PathBuf {
        std::path::PathBuf::from(DEFAULT_DB_PATH)
    }

    /// Open database at default path
    pub fn open() -> Result<Self> {
        Self::open_at(DEFAULT_DB_PATH)
    }

    /// Open database at specified path, creating the schema if needed
    pub fn open_at<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        let manager = ConnectionManager::<SqliteConnection>::new(&path_str);
        let pool = Pool::builder()
            .max_size(5)
            .connection_customizer(Box::new(ConnectionOptions { busy_timeout: BUSY_TIMEOUT }))
            .build(manager)
            .map_err(|e| Error::Connection(e.to_string()))?;

        let db = Self { pool };
        db.init_schema()?;
        tracing::debug!(path = %path_str, "database ready");
        Ok(db)
    }

    pub(crate) fn get_conn(&self) -> Result<DbConn> {
        Ok(self.pool.get()?)
    }

    fn init_schema(&self) -> Result<()> {
        let mut conn = self.get_conn()?;

        diesel::sql_query(r#"
            CREATE TABLE IF NOT EXISTS batches_raw (
                id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
                batch_code TEXT NOT NULL,
                date TEXT NOT NULL,
                time TEXT NOT NULL,
                shift INTEGER NOT NULL,
                steel_ball_type TEXT,
                power_kw REAL,
                steel_ball_kg REAL,
                voltage_ps REAL,
                impeller1_rpm REAL,
                impeller2_rpm REAL,
                current_ps REAL,
                current_impeller1 REAL,
                current_impeller2 REAL,
                current_dust REAL,
                current_main REAL,
                power_ps REAL,
                power_impeller1_kw REAL,
                power_impeller2_kw REAL,
                power_dust_kw REAL
            )
        "#).execute(&mut conn)?;

        diesel::sql_query(r#"
            CREATE TABLE IF NOT EXISTS batches_tombstone (
                id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
                raw_id INTEGER NOT NULL,
                deleted_at TEXT NOT NULL,
                deleted_by TEXT,
                reason TEXT,
                UNIQUE(raw_id),
                FOREIGN KEY (raw_id) REFERENCES batches_raw(id)
            )
        "#).execute(&mut conn)?;

        diesel::sql_query(r#"
            CREATE TABLE IF NOT EXISTS batches_override (
                id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
                raw_id INTEGER NOT NULL,
                updated_at TEXT NOT NULL,
                updated_by TEXT,
                reason TEXT,
                steel_ball_type TEXT,
                power_kw REAL,
                steel_ball_kg REAL,
                voltage_ps REAL,
                impeller1_rpm REAL,
                impeller2_rpm REAL,
                current_ps REAL,
                current_impeller1 REAL,
                current_impeller2 REAL,
                current_dust REAL,
                current_main REAL,
                power_ps REAL,
                power_impeller1_kw REAL,
                power_impeller2_kw REAL,
                power_dust_kw REAL,
                FOREIGN KEY (raw_id) REFERENCES batches_raw(id)
            )
        "#).execute(&mut conn)?;

        // Latest override per raw id wins, field by field.
        diesel::sql_query(r#"
            CREATE VIEW IF NOT EXISTS batches_effective AS
            WITH last_override AS (
                SELECT raw_id, MAX(id) AS max_id
                FROM batches_override
                GROUP BY raw_id
            )
            SELECT
                r.id,
                r.batch_code,
                r.date,
                r.time,
                r.shift,
                COALESCE(o.steel_ball_type, r.steel_ball_type) AS steel_ball_type,
                COALESCE(o.power_kw, r.power_kw) AS power_kw,
                COALESCE(o.steel_ball_kg, r.steel_ball_kg) AS steel_ball_kg,
                COALESCE(o.voltage_ps, r.voltage_ps) AS voltage_ps,
                COALESCE(o.impeller1_rpm, r.impeller1_rpm) AS impeller1_rpm,
                COALESCE(o.impeller2_rpm, r.impeller2_rpm) AS impeller2_rpm,
                COALESCE(o.current_ps, r.current_ps) AS current_ps,
                COALESCE(o.current_impeller1, r.current_impeller1) AS current_impeller1,
                COALESCE(o.current_impeller2, r.current_impeller2) AS current_impeller2,
                COALESCE(o.current_dust, r.current_dust) AS current_dust,
                COALESCE(o.current_main, r.current_main) AS current_main,
                COALESCE(o.power_ps, r.power_ps) AS power_ps,
                COALESCE(o.power_impeller1_kw, r.power_impeller1_kw) AS power_impeller1_kw,
                COALESCE(o.power_impeller2_kw, r.power_impeller2_kw) AS power_impeller2_kw,
                COALESCE(o.power_dust_kw, r.power_dust_kw) AS power_dust_kw
            FROM batches_raw r
            LEFT JOIN batches_tombstone t ON t.raw_id = r.id
            LEFT JOIN last_override lo ON lo.raw_id = r.id
            LEFT JOIN batches_override o ON o.id = lo.max_id
            WHERE t.raw_id IS NULL
        "#).execute(&mut conn)?;

        diesel::sql_query(format!(r#"
            CREATE TRIGGER IF NOT EXISTS trg_batches_raw_no_update
            BEFORE UPDATE ON batches_raw
            BEGIN
                SELECT RAISE(ABORT, 'UPDATE rejected: batches_raw is {APPEND_ONLY_MARKER}');
            END
        "#)).execute(&mut conn)?;

        diesel::sql_query(format!(r#"
            CREATE TRIGGER IF NOT EXISTS trg_batches_raw_no_delete
            BEFORE DELETE ON batches_raw
            BEGIN
                SELECT RAISE(ABORT, 'DELETE rejected: batches_raw is {APPEND_ONLY_MARKER}');
            END
        "#)).execute(&mut conn)?;

        diesel::sql_query(r#"
            CREATE TABLE IF NOT EXISTS tick_state (
                key TEXT PRIMARY KEY NOT NULL,
                last_tick_at INTEGER NOT NULL
            )
        "#).execute(&mut conn)?;

        diesel::sql_query(r#"
            CREATE TABLE IF NOT EXISTS component_life (
                id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
                component_name TEXT NOT NULL UNIQUE,
                accumulated_hours REAL NOT NULL DEFAULT 0,
                warning_hours REAL NOT NULL DEFAULT 0,
                last_reset_at TEXT
            )
        "#).execute(&mut conn)?;

        diesel::sql_query(r#"
            CREATE TABLE IF NOT EXISTS alarms (
                id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
                type TEXT NOT NULL,
                location TEXT NOT NULL DEFAULT '',
                start_time TEXT NOT NULL,
                end_time TEXT,
                details TEXT
            )
        "#).execute(&mut conn)?;

        // Create indexes
        diesel::sql_query("CREATE INDEX IF NOT EXISTS idx_batches_raw_date_time ON batches_raw(date, time)").execute(&mut conn)?;
        diesel::sql_query("CREATE INDEX IF NOT EXISTS idx_batches_raw_batch_code ON batches_raw(batch_code)").execute(&mut conn)?;
        diesel::sql_query("CREATE INDEX IF NOT EXISTS idx_batches_override_raw_id ON batches_override(raw_id, id)").execute(&mut conn)?;
        diesel::sql_query("CREATE INDEX IF NOT EXISTS idx_alarms_start_time ON alarms(start_time)").execute(&mut conn)?;
        // At most one open alarm per (type, location).
        diesel::sql_query("CREATE UNIQUE INDEX IF NOT EXISTS idx_alarms_open ON alarms(type, location) WHERE end_time IS NULL").execute(&mut conn)?;

        seed_tick_cursor(&mut conn, DEFAULT_TICK_KEY)?;
        Ok(())
    }

}

/// Start the cursor for `key` at the current instant. An existing cursor is left alone.
pub(crate) fn seed_tick_cursor(conn: &mut SqliteConnection, key: &str) -> Result<()> {
    use crate::schema::tick_state;

    let now_ms = chrono::Utc::now().timestamp_millis();
    diesel::insert_or_ignore_into(tick_state::table)
        .values((tick_state::key.eq(key), tick_state::last_tick_at.eq(now_ms)))
        .execute(conn)?;
    Ok(())
}

/// Id of the row just inserted on this connection.
pub(crate) fn last_insert_id(conn: &mut SqliteConnection) -> Result<i32> {
    let id: i32 = diesel::select(diesel::dsl::sql::<diesel::sql_types::Integer>("last_insert_rowid()"))
        .first(conn)?;
    Ok(id)
}
