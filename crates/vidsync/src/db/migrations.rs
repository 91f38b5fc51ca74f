//! Database migration system.
//!
//! Tracks applied migrations in a `_migrations` table and applies
//! pending ones in order, each inside its own transaction.

use rusqlite::Connection;

use super::error::DatabaseError;

/// A single migration definition.
struct Migration {
    version: u32,
    description: &'static str,
    sql: &'static str,
}

/// All migrations in order. Each is applied at most once.
const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "create_jobs_table",
        sql: include_str!("sql/001_create_jobs.sql"),
    },
    Migration {
        version: 2,
        description: "create_job_logs_table",
        sql: include_str!("sql/002_create_job_logs.sql"),
    },
    Migration {
        version: 3,
        description: "create_scheduler_settings_table",
        sql: include_str!("sql/003_create_scheduler_settings.sql"),
    },
    Migration {
        version: 4,
        description: "create_event_log_table",
        sql: include_str!("sql/004_create_event_log.sql"),
    },
];

/// Runs all pending migrations on the given connection.
pub fn run_all(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            description TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );",
    )?;

    let current_version: u32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM _migrations",
        [],
        |r| r.get(0),
    )?;

    for migration in MIGRATIONS {
        if migration.version <= current_version {
            continue;
        }

        log::info!(
            "Running migration v{}: {}",
            migration.version,
            migration.description
        );

        let batch = format!(
            "BEGIN;\n{}\nINSERT INTO _migrations (version, description) VALUES ({}, '{}');\nCOMMIT;",
            migration.sql, migration.version, migration.description
        );

        if let Err(e) = conn.execute_batch(&batch) {
            // Leave the connection usable for the caller.
            let _ = conn.execute_batch("ROLLBACK;");
            return Err(DatabaseError::Migration {
                version: migration.version,
                reason: e.to_string(),
            });
        }
    }

    Ok(())
}

/// Returns the highest migration version known to this build.
pub fn latest_version() -> u32 {
    MIGRATIONS.last().map(|m| m.version).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_exists(conn: &Connection, table: &str) -> bool {
        conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [table],
            |r| r.get::<_, u32>(0),
        )
        .map(|n| n == 1)
        .unwrap_or(false)
    }

    #[test]
    fn test_migrations_run_on_fresh_db() {
        let conn = Connection::open_in_memory().unwrap();
        run_all(&conn).unwrap();

        let count: u32 = conn
            .query_row("SELECT COUNT(*) FROM _migrations", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, MIGRATIONS.len() as u32);
        assert_eq!(latest_version(), 4);
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        run_all(&conn).unwrap();
        run_all(&conn).unwrap();

        let count: u32 = conn
            .query_row("SELECT COUNT(*) FROM _migrations", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, MIGRATIONS.len() as u32);
    }

    #[test]
    fn test_all_tables_created() {
        let conn = Connection::open_in_memory().unwrap();
        run_all(&conn).unwrap();

        for table in ["jobs", "job_logs", "scheduler_settings", "event_log"] {
            assert!(table_exists(&conn, table), "missing table {}", table);
        }
    }

    #[test]
    fn test_scheduler_settings_is_singleton() {
        let conn = Connection::open_in_memory().unwrap();
        run_all(&conn).unwrap();

        let second = conn.execute(
            "INSERT INTO scheduler_settings (id, interval_hours, timezone, updated_at)
             VALUES (2, 6, 'UTC', '2026-01-01T00:00:00Z')",
            [],
        );
        assert!(second.is_err());
    }
}
