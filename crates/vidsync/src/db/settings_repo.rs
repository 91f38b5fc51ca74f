//! Scheduler settings repository: the singleton `scheduler_settings` row.

use rusqlite::{params, OptionalExtension, Row};

use super::{Database, DatabaseError};

/// The raw settings row.
#[derive(Debug, Clone, PartialEq)]
pub struct SettingsRow {
    pub interval_hours: u32,
    pub timezone: String,
    pub is_active: bool,
    pub last_run: Option<String>,
    pub next_run: Option<String>,
    pub updated_at: String,
}

impl SettingsRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            interval_hours: row.get("interval_hours")?,
            timezone: row.get("timezone")?,
            is_active: row.get("is_active")?,
            last_run: row.get("last_run")?,
            next_run: row.get("next_run")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

/// Loads the settings row, if one was ever saved.
pub fn load(db: &Database) -> Result<Option<SettingsRow>, DatabaseError> {
    db.with_conn(|conn| {
        let row = conn
            .query_row(
                "SELECT * FROM scheduler_settings WHERE id = 1",
                [],
                SettingsRow::from_row,
            )
            .optional()?;
        Ok(row)
    })
}

/// Inserts or replaces the settings row.
pub fn save(db: &Database, settings: &SettingsRow) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO scheduler_settings
               (id, interval_hours, timezone, is_active, last_run, next_run, updated_at)
             VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
               interval_hours = excluded.interval_hours,
               timezone = excluded.timezone,
               is_active = excluded.is_active,
               last_run = excluded.last_run,
               next_run = excluded.next_run,
               updated_at = excluded.updated_at",
            params![
                settings.interval_hours,
                settings.timezone,
                settings.is_active,
                settings.last_run,
                settings.next_run,
                settings.updated_at,
            ],
        )?;
        Ok(())
    })
}
