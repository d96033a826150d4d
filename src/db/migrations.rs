use anyhow::{bail, Context, Result};
use log::info;
use rusqlite::Connection;

/// Schema steps in order. Step `n` (1-based) takes the database to
/// `user_version = n`.
const MIGRATIONS: &[(&str, &str)] = &[
    ("vehicle events", include_str!("schemas/schema_v1.sql")),
    ("microsecond timestamps", include_str!("schemas/schema_v2.sql")),
];

pub fn latest_version() -> i32 {
    MIGRATIONS.len() as i32
}

pub fn schema_version(conn: &Connection) -> Result<i32> {
    conn.pragma_query_value(None, "user_version", |row| row.get(0))
        .context("failed to read user_version pragma")
}

/// Bring the schema up to date. Each step commits on its own, so a failing
/// step leaves the database at the previous version. Returns the version
/// reached.
pub fn migrate(conn: &mut Connection) -> Result<i32> {
    let current = schema_version(conn)?;
    let latest = latest_version();
    if !(0..=latest).contains(&current) {
        bail!("event database schema v{current} is not supported (latest is v{latest})");
    }

    for (index, (name, sql)) in MIGRATIONS.iter().enumerate().skip(current as usize) {
        let version = index as i32 + 1;
        let tx = conn
            .transaction()
            .context("failed to open migration transaction")?;
        tx.execute_batch(sql)
            .with_context(|| format!("migration to v{version} ({name}) failed"))?;
        tx.pragma_update(None, "user_version", version)
            .context("failed to update user_version pragma")?;
        tx.commit()
            .with_context(|| format!("failed to commit migration to v{version}"))?;
        info!("Event store schema migrated to v{version} ({name})");
    }

    Ok(latest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_database_reaches_latest_and_stays_there() {
        let mut conn = Connection::open_in_memory().expect("open");
        assert_eq!(migrate(&mut conn).expect("first run"), latest_version());
        assert_eq!(migrate(&mut conn).expect("second run"), latest_version());
        assert_eq!(schema_version(&conn).expect("version"), latest_version());
    }

    #[test]
    fn refuses_unknown_schema_versions() {
        let mut conn = Connection::open_in_memory().expect("open");
        conn.pragma_update(None, "user_version", latest_version() + 1)
            .expect("set version");
        assert!(migrate(&mut conn).is_err());

        conn.pragma_update(None, "user_version", -1).expect("set version");
        assert!(migrate(&mut conn).is_err());
    }

    #[test]
    fn millisecond_rows_are_widened_in_place() {
        let mut conn = Connection::open_in_memory().expect("open");
        conn.execute_batch(MIGRATIONS[0].1).expect("v1 schema");
        conn.pragma_update(None, "user_version", 1).expect("set version");
        conn.execute(
            "INSERT INTO vehicle_events (timestamp, segment_filename, plate_text, confidence, inserted_at)
             VALUES ('2026-03-01T10:00:00.250Z', 'dashcam-20260301-100000.mp4', 'AB12CDE', 0.9,
                     '2026-03-01T10:00:01.000Z')",
            [],
        )
        .expect("insert v1 row");

        migrate(&mut conn).expect("migrate");

        let (timestamp, inserted_at): (String, String) = conn
            .query_row("SELECT timestamp, inserted_at FROM vehicle_events", [], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .expect("row");
        assert_eq!(timestamp, "2026-03-01T10:00:00.250000Z");
        assert_eq!(inserted_at, "2026-03-01T10:00:01.000000Z");

        let plate_hits: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM vehicle_events_fts WHERE plate_text LIKE '%12C%'",
                [],
                |row| row.get(0),
            )
            .expect("fts");
        assert_eq!(plate_hits, 1);
    }
}
