use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration, Local, Utc};
use log::{debug, info};
use rusqlite::{params, params_from_iter, types::Value, Row};

use crate::db::{
    connection::EventStore,
    helpers::{format_datetime, like_pattern, parse_datetime, parse_optional_datetime, to_i64, to_u64},
    models::{EventPage, EventQuery, EventStats, RecordOutcome, VehicleEvent},
};

const EVENT_COLUMNS: &str = "id, timestamp, segment_filename, latitude, longitude, plate_text, \
                             description, confidence, inserted_at";

fn row_to_event(row: &Row) -> Result<VehicleEvent> {
    let timestamp: String = row.get("timestamp")?;
    let plate_text: String = row.get("plate_text")?;

    Ok(VehicleEvent {
        id: Some(row.get("id")?),
        timestamp: parse_datetime(&timestamp, "timestamp")?,
        segment_filename: row.get("segment_filename")?,
        latitude: row.get("latitude")?,
        longitude: row.get("longitude")?,
        plate_text: (!plate_text.is_empty()).then_some(plate_text),
        description: row.get("description")?,
        confidence: row.get("confidence")?,
        inserted_at: parse_optional_datetime(row.get("inserted_at")?, "inserted_at")?,
    })
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|fragment| !fragment.is_empty())
}

/// WHERE clause and its bound values for a query's filters.
fn build_filters(query: &EventQuery) -> (String, Vec<Value>) {
    let mut clauses: Vec<&'static str> = Vec::new();
    let mut values: Vec<Value> = Vec::new();

    if let Some(from) = &query.from {
        clauses.push("timestamp >= ?");
        values.push(Value::Text(format_datetime(from)));
    }
    if let Some(to) = &query.to {
        clauses.push("timestamp <= ?");
        values.push(Value::Text(format_datetime(to)));
    }
    if let Some(plate) = non_empty(&query.plate) {
        clauses.push("id IN (SELECT rowid FROM vehicle_events_fts WHERE plate_text LIKE ?)");
        values.push(Value::Text(like_pattern(plate)));
    }
    for fragment in [&query.color, &query.make, &query.model]
        .into_iter()
        .filter_map(non_empty)
    {
        clauses.push("id IN (SELECT rowid FROM vehicle_events_fts WHERE description LIKE ?)");
        values.push(Value::Text(like_pattern(fragment)));
    }
    if let Some(segment) = non_empty(&query.segment_filename) {
        clauses.push("segment_filename = ?");
        values.push(Value::Text(segment.to_string()));
    }

    let where_clause = if clauses.is_empty() {
        "1 = 1".to_string()
    } else {
        clauses.join(" AND ")
    };
    (where_clause, values)
}

fn local_midnight() -> DateTime<Utc> {
    Local::now()
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .and_then(|naive| naive.and_local_timezone(Local).earliest())
        .map(|midnight| midnight.with_timezone(&Utc))
        .unwrap_or_else(|| Utc::now() - Duration::hours(24))
}

impl EventStore {
    /// Insert an event unless its `(timestamp, segment, plate)` triple is
    /// already stored.
    pub async fn record(&self, event: &VehicleEvent) -> Result<RecordOutcome> {
        if !(0.0..=1.0).contains(&event.confidence) {
            bail!("event confidence {} outside [0, 1]", event.confidence);
        }

        let record = event.clone();
        let inserted_at = Utc::now();
        self.with_connection(move |conn| {
            let tx = conn.transaction()?;
            let changed = tx
                .execute(
                    "INSERT OR IGNORE INTO vehicle_events (
                        timestamp,
                        segment_filename,
                        latitude,
                        longitude,
                        plate_text,
                        description,
                        confidence,
                        inserted_at
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        format_datetime(&record.timestamp),
                        record.segment_filename,
                        record.latitude,
                        record.longitude,
                        record.plate_text.as_deref().unwrap_or(""),
                        record.description,
                        record.confidence,
                        format_datetime(&inserted_at),
                    ],
                )
                .context("failed to insert vehicle event")?;
            tx.commit().context("failed to commit vehicle event")?;

            if changed == 0 {
                debug!(
                    "Duplicate event ignored: {} {:?} at {}",
                    record.segment_filename, record.plate_text, record.timestamp
                );
                Ok(RecordOutcome::DuplicateIgnored)
            } else {
                Ok(RecordOutcome::Inserted)
            }
        })
        .await
    }

    pub async fn query(&self, query: &EventQuery) -> Result<EventPage> {
        let (where_clause, values) = build_filters(query);
        let limit = to_i64(query.effective_limit() as u64)?;
        let order = query.order.as_sql();

        self.with_connection(move |conn| {
            let total: i64 = conn
                .query_row(
                    &format!("SELECT COUNT(*) FROM vehicle_events WHERE {where_clause}"),
                    params_from_iter(values.iter()),
                    |row| row.get(0),
                )
                .context("failed to count vehicle events")?;

            let mut stmt = conn.prepare(&format!(
                "SELECT {EVENT_COLUMNS}
                 FROM vehicle_events
                 WHERE {where_clause}
                 ORDER BY timestamp {order}, id {order}
                 LIMIT ?"
            ))?;

            let mut bound = values;
            bound.push(Value::Integer(limit));
            let mut rows = stmt.query(params_from_iter(bound.iter()))?;
            let mut events = Vec::new();
            while let Some(row) = rows.next()? {
                events.push(row_to_event(row)?);
            }

            Ok(EventPage {
                events,
                total: to_u64(total, "total")?,
            })
        })
        .await
    }

    /// Events tagged with one segment file, oldest first.
    pub async fn events_for_segment(&self, segment_filename: &str) -> Result<Vec<VehicleEvent>> {
        let segment_filename = segment_filename.to_string();
        self.with_connection(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {EVENT_COLUMNS}
                 FROM vehicle_events
                 WHERE segment_filename = ?1
                 ORDER BY timestamp ASC, id ASC"
            ))?;

            let mut rows = stmt.query(params![segment_filename])?;
            let mut events = Vec::new();
            while let Some(row) = rows.next()? {
                events.push(row_to_event(row)?);
            }
            Ok(events)
        })
        .await
    }

    /// Delete events older than `days` days. Returns the number removed.
    pub async fn prune_older_than(&self, days: u32) -> Result<u64> {
        let cutoff = Utc::now() - Duration::days(i64::from(days));
        self.prune_before(cutoff).await
    }

    pub async fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let deleted = self
            .with_connection(move |conn| {
                let tx = conn.transaction()?;
                let deleted = tx
                    .execute(
                        "DELETE FROM vehicle_events WHERE timestamp < ?1",
                        params![format_datetime(&cutoff)],
                    )
                    .context("failed to prune vehicle events")?;
                tx.commit().context("failed to commit prune")?;
                Ok(deleted as u64)
            })
            .await?;

        if deleted > 0 {
            info!("Pruned {deleted} events older than {cutoff}");
        }
        Ok(deleted)
    }

    /// Totals with "today" starting at local midnight.
    pub async fn stats(&self) -> Result<EventStats> {
        self.stats_since(local_midnight()).await
    }

    pub async fn stats_since(&self, today_start: DateTime<Utc>) -> Result<EventStats> {
        self.with_connection(move |conn| {
            let (total, unique_plates, latest): (i64, i64, Option<String>) = conn
                .query_row(
                    "SELECT COUNT(*),
                            COUNT(DISTINCT NULLIF(plate_text, '')),
                            MAX(timestamp)
                     FROM vehicle_events",
                    [],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .context("failed to read event totals")?;

            let today: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM vehicle_events WHERE timestamp >= ?1",
                    params![format_datetime(&today_start)],
                    |row| row.get(0),
                )
                .context("failed to count today's events")?;

            Ok(EventStats {
                total_events: to_u64(total, "total_events")?,
                today_events: to_u64(today, "today_events")?,
                unique_plates: to_u64(unique_plates, "unique_plates")?,
                latest_event: parse_optional_datetime(latest, "latest_event")?,
            })
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::SortOrder;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn open_store() -> (TempDir, EventStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = EventStore::open(dir.path().join("events.sqlite3")).expect("open store");
        (dir, store)
    }

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 7, 14, hour, minute, 0).unwrap()
    }

    #[tokio::test]
    async fn duplicate_insert_is_absorbed() {
        let (_dir, store) = open_store();
        let event = VehicleEvent::new(at(8, 0), "dashcam-20260714-080000.mp4", 0.91)
            .with_plate("ABC123")
            .with_position(37.77, -122.42);

        assert_eq!(store.record(&event).await.expect("first"), RecordOutcome::Inserted);
        assert_eq!(
            store.record(&event).await.expect("second"),
            RecordOutcome::DuplicateIgnored
        );

        let page = store.query(&EventQuery::default()).await.expect("query");
        assert_eq!(page.total, 1);
        let stored = &page.events[0];
        assert_eq!(stored.plate_text.as_deref(), Some("ABC123"));
        assert_eq!(stored.latitude, Some(37.77));
        assert!(stored.id.is_some());
        assert!(stored.inserted_at.is_some());
    }

    #[tokio::test]
    async fn plate_less_duplicates_are_absorbed() {
        let (_dir, store) = open_store();
        let event = VehicleEvent::new(at(8, 0), "seg.mp4", 0.7).with_description("white van");

        assert_eq!(store.record(&event).await.expect("first"), RecordOutcome::Inserted);
        assert_eq!(
            store.record(&event).await.expect("second"),
            RecordOutcome::DuplicateIgnored
        );
        let page = store.query(&EventQuery::default()).await.expect("query");
        assert_eq!(page.total, 1);
        assert!(page.events[0].plate_text.is_none());
    }

    #[tokio::test]
    async fn sightings_under_a_millisecond_apart_are_kept_apart() {
        let (_dir, store) = open_store();
        let first = at(8, 0) + Duration::microseconds(200);
        let second = at(8, 0) + Duration::microseconds(700);
        for timestamp in [first, second] {
            let event = VehicleEvent::new(timestamp, "seg.mp4", 0.8).with_plate("ABC123");
            assert_eq!(store.record(&event).await.expect("record"), RecordOutcome::Inserted);
        }

        let page = store
            .query(&EventQuery {
                order: SortOrder::Oldest,
                ..EventQuery::default()
            })
            .await
            .expect("query");
        let stamps: Vec<_> = page.events.iter().map(|e| e.timestamp).collect();
        assert_eq!(stamps, vec![first, second]);
    }

    #[tokio::test]
    async fn rejects_out_of_range_confidence() {
        let (_dir, store) = open_store();
        let event = VehicleEvent::new(at(8, 0), "seg.mp4", 1.4);
        assert!(store.record(&event).await.is_err());
    }

    async fn seed(store: &EventStore) {
        let events = [
            VehicleEvent::new(at(8, 0), "a.mp4", 0.9)
                .with_plate("ABC123")
                .with_description("red honda civic"),
            VehicleEvent::new(at(8, 5), "a.mp4", 0.8)
                .with_plate("XYZ789")
                .with_description("blue honda accord"),
            VehicleEvent::new(at(9, 0), "b.mp4", 0.95)
                .with_plate("ABD555")
                .with_description("red toyota corolla"),
            VehicleEvent::new(at(10, 0), "b.mp4", 0.6).with_description("red honda fit"),
        ];
        for event in &events {
            assert_eq!(store.record(event).await.expect("seed"), RecordOutcome::Inserted);
        }
    }

    #[tokio::test]
    async fn filters_are_and_composed() {
        let (_dir, store) = open_store();
        seed(&store).await;

        let page = store
            .query(&EventQuery {
                plate: Some("ab".into()),
                ..EventQuery::default()
            })
            .await
            .expect("plate query");
        assert_eq!(page.total, 2);

        let page = store
            .query(&EventQuery {
                color: Some("red".into()),
                make: Some("honda".into()),
                ..EventQuery::default()
            })
            .await
            .expect("description query");
        let plates: Vec<_> = page.events.iter().map(|e| e.plate_text.clone()).collect();
        assert_eq!(plates, vec![None, Some("ABC123".to_string())]);

        let page = store
            .query(&EventQuery {
                from: Some(at(8, 1)),
                to: Some(at(9, 30)),
                ..EventQuery::default()
            })
            .await
            .expect("range query");
        assert_eq!(page.total, 2);

        let page = store
            .query(&EventQuery {
                segment_filename: Some("b.mp4".into()),
                color: Some("red".into()),
                plate: Some("ABD".into()),
                ..EventQuery::default()
            })
            .await
            .expect("combined query");
        assert_eq!(page.total, 1);
        assert_eq!(page.events[0].plate_text.as_deref(), Some("ABD555"));
    }

    #[tokio::test]
    async fn limit_does_not_change_total() {
        let (_dir, store) = open_store();
        seed(&store).await;

        let page = store
            .query(&EventQuery {
                limit: Some(1),
                order: SortOrder::Oldest,
                ..EventQuery::default()
            })
            .await
            .expect("query");
        assert_eq!(page.total, 4);
        assert_eq!(page.events.len(), 1);
        assert_eq!(page.events[0].timestamp, at(8, 0));

        let newest = store.query(&EventQuery::default()).await.expect("query");
        assert_eq!(newest.events[0].timestamp, at(10, 0));
    }

    #[tokio::test]
    async fn events_for_segment_are_oldest_first() {
        let (_dir, store) = open_store();
        seed(&store).await;

        let events = store.events_for_segment("a.mp4").await.expect("segment");
        assert_eq!(events.len(), 2);
        assert!(events[0].timestamp < events[1].timestamp);
        assert!(store.events_for_segment("missing.mp4").await.expect("empty").is_empty());
    }

    #[tokio::test]
    async fn prune_removes_only_old_rows() {
        let (_dir, store) = open_store();
        let now = Utc::now();
        let old = VehicleEvent::new(now - Duration::days(40), "old.mp4", 0.9).with_plate("OLD1");
        let recent = VehicleEvent::new(now - Duration::days(1), "new.mp4", 0.9).with_plate("NEW1");
        store.record(&old).await.expect("old");
        store.record(&recent).await.expect("recent");

        assert_eq!(store.prune_older_than(30).await.expect("prune"), 1);
        assert_eq!(store.prune_older_than(30).await.expect("prune again"), 0);

        let page = store
            .query(&EventQuery {
                plate: Some("OLD".into()),
                ..EventQuery::default()
            })
            .await
            .expect("query");
        assert_eq!(page.total, 0);
    }

    #[tokio::test]
    async fn stats_count_today_and_distinct_plates() {
        let (_dir, store) = open_store();
        seed(&store).await;
        store
            .record(&VehicleEvent::new(at(11, 0), "c.mp4", 0.9).with_plate("ABC123"))
            .await
            .expect("repeat plate");

        let stats = store.stats_since(at(9, 0)).await.expect("stats");
        assert_eq!(stats.total_events, 5);
        assert_eq!(stats.today_events, 3);
        assert_eq!(stats.unique_plates, 3);
        assert_eq!(stats.latest_event, Some(at(11, 0)));

        let (_dir, empty) = open_store();
        let stats = empty.stats().await.expect("empty stats");
        assert_eq!(stats, EventStats::default());
    }
}
