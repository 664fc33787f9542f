use std::collections::HashSet;
use std::path::Path;
use std::sync::Mutex;

use rusqlite::{Connection, ToSql};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::error::AppError;

pub mod procs;

pub use procs::{ProcOutcome, ProcParams};

const MIGRATION_0001: (&str, &str) = (
    "0001_init.sql",
    include_str!(concat!(
        env!("CARGO_MANIFEST_DIR"),
        "/../../migrations/0001_init.sql"
    )),
);

const MIGRATION_0002: (&str, &str) = (
    "0002_healthcare.sql",
    include_str!(concat!(
        env!("CARGO_MANIFEST_DIR"),
        "/../../migrations/0002_healthcare.sql"
    )),
);

fn migrations() -> Vec<(&'static str, &'static str)> {
    vec![MIGRATION_0001, MIGRATION_0002]
}

/// Persistent-store facade shared by every component: typed queries via
/// `with_conn`, non-queries via `execute`, and remediation primitives via
/// `call_procedure`. One connection behind a mutex; each call is a single
/// round trip, no transaction spans manager and engine operations.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self, AppError> {
        let mut conn = Connection::open(path).map_err(|e| {
            AppError::new("DB_OPEN_FAILED", "Failed to open SQLite database")
                .with_details(e.to_string())
                .with_retryable(true)
        })?;
        migrate(&mut conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self, AppError> {
        let mut conn = Connection::open_in_memory().map_err(|e| {
            AppError::new("DB_OPEN_FAILED", "Failed to open in-memory SQLite database")
                .with_details(e.to_string())
                .with_retryable(true)
        })?;
        migrate(&mut conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run a typed row-mapping query (or any compound read) against the
    /// connection. The lock is held for the duration of the closure, which
    /// is what makes dedup-check-then-insert atomic within the process.
    pub fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, AppError>,
    ) -> Result<T, AppError> {
        let conn = self.conn.lock().unwrap();
        f(&conn)
    }

    /// Non-query operation: returns the affected row count.
    pub fn execute(&self, sql: &str, params: &[&dyn ToSql]) -> Result<usize, AppError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(sql, params)
            .map_err(|e| AppError::sql("DB_EXEC_FAILED", "Non-query execution failed", e))
    }

    /// Procedure-invocation operation. SQLite has no stored procedures, so
    /// the primitives are registered Rust procedures dispatched by name.
    /// An unknown name is a usage error, not an operational failure.
    pub fn call_procedure(&self, name: &str, params: &ProcParams) -> Result<ProcOutcome, AppError> {
        procs::call(self, name, params)
    }
}

pub fn migrate(conn: &mut Connection) -> Result<(), AppError> {
    // Track migrations by name, applying each exactly once, in order.
    conn.execute_batch(
        r#"
      PRAGMA foreign_keys = ON;
      CREATE TABLE IF NOT EXISTS _migrations (
        name TEXT PRIMARY KEY NOT NULL,
        applied_at TEXT NOT NULL
      );
    "#,
    )
    .map_err(|e| {
        AppError::sql(
            "DB_MIGRATIONS_TABLE_FAILED",
            "Failed to ensure migrations table exists",
            e,
        )
    })?;

    let applied: HashSet<String> = {
        let mut stmt = conn.prepare("SELECT name FROM _migrations").map_err(|e| {
            AppError::sql(
                "DB_MIGRATIONS_QUERY_FAILED",
                "Failed to query applied migrations",
                e,
            )
        })?;

        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(|e| {
                AppError::sql(
                    "DB_MIGRATIONS_QUERY_FAILED",
                    "Failed to read applied migrations",
                    e,
                )
            })?;

        let mut set = HashSet::new();
        for r in rows {
            set.insert(r.map_err(|e| {
                AppError::sql(
                    "DB_MIGRATIONS_QUERY_FAILED",
                    "Failed to read applied migration row",
                    e,
                )
            })?);
        }
        set
    };

    for (name, sql) in migrations() {
        if applied.contains(name) {
            continue;
        }

        let tx = conn.transaction().map_err(|e| {
            AppError::sql("DB_TX_FAILED", "Failed to start migration transaction", e)
        })?;

        tx.execute_batch(sql).map_err(|e| {
            AppError::sql("DB_MIGRATION_FAILED", format!("Migration {name} failed"), e)
        })?;

        tx.execute(
            "INSERT INTO _migrations(name, applied_at) VALUES (?1, strftime('%Y-%m-%dT%H:%M:%fZ','now'))",
            [name],
        )
        .map_err(|e| {
            AppError::sql(
                "DB_MIGRATION_FAILED",
                format!("Failed to record migration {name}"),
                e,
            )
        })?;

        tx.commit().map_err(|e| {
            AppError::sql("DB_TX_FAILED", "Failed to commit migration transaction", e)
        })?;
    }

    Ok(())
}

/// Current UTC time as an RFC3339 string, the storage format for every
/// timestamp column.
pub fn now_utc() -> Result<String, AppError> {
    OffsetDateTime::now_utc().format(&Rfc3339).map_err(|e| {
        AppError::new("TIME_FORMAT_FAILED", "Failed to format current time")
            .with_details(e.to_string())
    })
}
