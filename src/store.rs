//! # Session Store
//!
//! Durable, crash-safe SQLite persistence for the active session, its
//! ordered route, and the pending upload queue.
//!
//! Every mutation that touches more than one table runs in a single
//! transaction: a kept point writes the route point, its pending-queue
//! entry, and the updated session counters together, so a crash between
//! writes cannot leave the three views disagreeing. On process start,
//! [`SessionStore::restore`] is the sole input for resuming a session and
//! its uploads.
//!
//! At most one non-terminal session is durable at a time per device.

use log::{info, warn};
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{CaptureError, Result};
use crate::{GeoPoint, RoutePoint, Session, SessionStatus};

/// A session reconstructed from durable state on process start.
#[derive(Debug, Clone)]
pub struct RestoredSession {
    pub session: Session,
    /// Full ordered route, needed for UI and the distance recompute.
    pub route: Vec<RoutePoint>,
    /// Sequence numbers still awaiting upload confirmation, in order.
    pub pending: Vec<u32>,
    /// Next sequence number to assign.
    pub next_sequence: u32,
}

/// SQLite-backed persistence for session, route, and upload queue.
pub struct SessionStore {
    db: Connection,
}

impl SessionStore {
    /// Open (or create) the store at the given database path.
    pub fn new(db_path: &str) -> Result<Self> {
        let db = Connection::open(db_path)?;
        Self::init_schema(&db)?;
        Ok(Self { db })
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory() -> Result<Self> {
        let db = Connection::open_in_memory()?;
        Self::init_schema(&db)?;
        Ok(Self { db })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            -- Session header (at most one non-terminal row)
            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                started_at_ms INTEGER NOT NULL,
                ended_at_ms INTEGER,
                start_lat REAL,
                start_lng REAL,
                end_lat REAL,
                end_lng REAL,
                distance_miles REAL NOT NULL DEFAULT 0,
                duration_secs INTEGER NOT NULL DEFAULT 0,
                point_count INTEGER NOT NULL DEFAULT 0,
                lead_count INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL
            );

            -- Kept GPS samples, ordered by sequence within a session
            CREATE TABLE IF NOT EXISTS route_points (
                session_id TEXT NOT NULL,
                sequence INTEGER NOT NULL,
                latitude REAL NOT NULL,
                longitude REAL NOT NULL,
                accuracy REAL,
                altitude REAL,
                heading REAL,
                speed REAL,
                captured_at_ms INTEGER NOT NULL,
                PRIMARY KEY (session_id, sequence),
                FOREIGN KEY (session_id) REFERENCES sessions(id) ON DELETE CASCADE
            );

            -- Points not yet confirmed uploaded; removed only on batch ack
            CREATE TABLE IF NOT EXISTS pending_uploads (
                session_id TEXT NOT NULL,
                sequence INTEGER NOT NULL,
                PRIMARY KEY (session_id, sequence)
            );

            CREATE INDEX IF NOT EXISTS idx_sessions_status ON sessions(status);

            PRAGMA foreign_keys = ON;
        "#,
        )?;
        Ok(())
    }

    // ========================================================================
    // Session Header
    // ========================================================================

    /// Persist a freshly created session.
    pub fn create_session(&self, session: &Session) -> Result<()> {
        self.db.execute(
            "INSERT INTO sessions (id, owner_id, started_at_ms, ended_at_ms,
                start_lat, start_lng, end_lat, end_lng,
                distance_miles, duration_secs, point_count, lead_count, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                session.id,
                session.owner_id,
                session.started_at_ms,
                session.ended_at_ms,
                session.start_point.map(|p| p.latitude),
                session.start_point.map(|p| p.longitude),
                session.end_point.map(|p| p.latitude),
                session.end_point.map(|p| p.longitude),
                session.distance_miles,
                session.duration_secs,
                session.point_count,
                session.lead_count,
                session.status.as_str(),
            ],
        )?;
        Ok(())
    }

    /// Rewrite the session header (status changes, finalized totals).
    pub fn update_session(&self, session: &Session) -> Result<()> {
        self.db.execute(
            "UPDATE sessions SET ended_at_ms = ?2,
                start_lat = ?3, start_lng = ?4, end_lat = ?5, end_lng = ?6,
                distance_miles = ?7, duration_secs = ?8,
                point_count = ?9, lead_count = ?10, status = ?11
             WHERE id = ?1",
            params![
                session.id,
                session.ended_at_ms,
                session.start_point.map(|p| p.latitude),
                session.start_point.map(|p| p.longitude),
                session.end_point.map(|p| p.latitude),
                session.end_point.map(|p| p.longitude),
                session.distance_miles,
                session.duration_secs,
                session.point_count,
                session.lead_count,
                session.status.as_str(),
            ],
        )?;
        Ok(())
    }

    /// Increment the session's lead count; returns the new count.
    pub fn increment_lead_count(&self, session_id: &str) -> Result<u32> {
        self.db.execute(
            "UPDATE sessions SET lead_count = lead_count + 1 WHERE id = ?1",
            params![session_id],
        )?;
        let count: u32 = self.db.query_row(
            "SELECT lead_count FROM sessions WHERE id = ?1",
            params![session_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    // ========================================================================
    // Route Points & Pending Queue
    // ========================================================================

    /// Append a kept point: route list, pending queue, and updated session
    /// counters are written in one transaction.
    pub fn append_point(&mut self, point: &RoutePoint, session: &Session) -> Result<()> {
        let tx = self.db.transaction()?;
        tx.execute(
            "INSERT INTO route_points (session_id, sequence, latitude, longitude,
                accuracy, altitude, heading, speed, captured_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                point.session_id,
                point.sequence,
                point.latitude,
                point.longitude,
                point.accuracy,
                point.altitude,
                point.heading,
                point.speed,
                point.captured_at_ms,
            ],
        )?;
        tx.execute(
            "INSERT INTO pending_uploads (session_id, sequence) VALUES (?1, ?2)",
            params![point.session_id, point.sequence],
        )?;
        tx.execute(
            "UPDATE sessions SET distance_miles = ?2, point_count = ?3 WHERE id = ?1",
            params![session.id, session.distance_miles, session.point_count],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// The full ordered route for a session.
    pub fn route(&self, session_id: &str) -> Result<Vec<RoutePoint>> {
        Ok(self.route_rows(session_id)?)
    }

    fn route_rows(&self, session_id: &str) -> rusqlite::Result<Vec<RoutePoint>> {
        let mut stmt = self.db.prepare(
            "SELECT session_id, sequence, latitude, longitude,
                    accuracy, altitude, heading, speed, captured_at_ms
             FROM route_points WHERE session_id = ?1 ORDER BY sequence",
        )?;
        let rows = stmt.query_map(params![session_id], row_to_point)?.collect();
        rows
    }

    fn pending_sequences(&self, session_id: &str) -> rusqlite::Result<Vec<u32>> {
        let mut stmt = self.db.prepare(
            "SELECT sequence FROM pending_uploads WHERE session_id = ?1 ORDER BY sequence",
        )?;
        let rows = stmt
            .query_map(params![session_id], |row| row.get::<_, u32>(0))?
            .collect();
        rows
    }

    /// Up to `limit` pending points in queue order, joined to their payloads.
    pub fn pending_batch(&self, session_id: &str, limit: usize) -> Result<Vec<RoutePoint>> {
        let mut stmt = self.db.prepare(
            "SELECT p.session_id, p.sequence, p.latitude, p.longitude,
                    p.accuracy, p.altitude, p.heading, p.speed, p.captured_at_ms
             FROM pending_uploads q
             JOIN route_points p
               ON p.session_id = q.session_id AND p.sequence = q.sequence
             WHERE q.session_id = ?1
             ORDER BY q.sequence
             LIMIT ?2",
        )?;
        let points = stmt
            .query_map(params![session_id, limit as i64], row_to_point)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(points)
    }

    /// Remove exactly the acknowledged sequences from the pending queue.
    pub fn remove_pending(&mut self, session_id: &str, sequences: &[u32]) -> Result<()> {
        let tx = self.db.transaction()?;
        for seq in sequences {
            tx.execute(
                "DELETE FROM pending_uploads WHERE session_id = ?1 AND sequence = ?2",
                params![session_id, seq],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Number of points still awaiting upload confirmation.
    pub fn pending_count(&self, session_id: &str) -> Result<usize> {
        let count: i64 = self.db.query_row(
            "SELECT COUNT(*) FROM pending_uploads WHERE session_id = ?1",
            params![session_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    // ========================================================================
    // Restore & Clear
    // ========================================================================

    /// Reconstruct the active/paused session, if one is durable.
    ///
    /// Returns the full route so the caller can recompute distance and
    /// rebuild throttle state from it rather than trusting the stored
    /// header. Malformed rows, including columns that no longer decode to
    /// their expected type, yield `RestoreCorrupted`, which callers treat
    /// as "no session to restore".
    pub fn restore(&self) -> Result<Option<RestoredSession>> {
        let row = self
            .db
            .query_row(
                "SELECT id, owner_id, started_at_ms, ended_at_ms,
                        start_lat, start_lng, end_lat, end_lng,
                        distance_miles, duration_secs, point_count, lead_count, status
                 FROM sessions
                 ORDER BY started_at_ms DESC
                 LIMIT 1",
                [],
                row_to_session,
            )
            .optional()
            .map_err(corrupted_on_decode)?;

        let session = match row {
            Some(Ok(session)) if session.status.is_terminal() => return Ok(None),
            Some(Ok(session)) => session,
            Some(Err(message)) => {
                return Err(CaptureError::RestoreCorrupted { message });
            }
            None => return Ok(None),
        };

        let route = self.route_rows(&session.id).map_err(corrupted_on_decode)?;
        let pending = self
            .pending_sequences(&session.id)
            .map_err(corrupted_on_decode)?;

        // Pending entries must reference real route points
        let max_seq = route.last().map(|p| p.sequence).unwrap_or(0);
        if pending.iter().any(|&seq| seq > max_seq || seq == 0) {
            return Err(CaptureError::RestoreCorrupted {
                message: format!(
                    "pending queue references unknown sequence (max {})",
                    max_seq
                ),
            });
        }

        let next_sequence = max_seq + 1;
        info!(
            "[SessionStore] Restored session {}: {} points, {} pending, status {}",
            session.id,
            route.len(),
            pending.len(),
            session.status.as_str()
        );

        Ok(Some(RestoredSession {
            session,
            route,
            pending,
            next_sequence,
        }))
    }

    /// Delete all durable state for a session.
    pub fn clear(&mut self, session_id: &str) -> Result<()> {
        let tx = self.db.transaction()?;
        tx.execute(
            "DELETE FROM pending_uploads WHERE session_id = ?1",
            params![session_id],
        )?;
        tx.execute(
            "DELETE FROM route_points WHERE session_id = ?1",
            params![session_id],
        )?;
        tx.execute("DELETE FROM sessions WHERE id = ?1", params![session_id])?;
        tx.commit()?;
        Ok(())
    }

    /// Drop any durable session state whatever its status. Used when a
    /// corrupted restore means the stored data cannot be trusted.
    pub fn clear_all(&mut self) -> Result<()> {
        warn!("[SessionStore] Clearing all durable session state");
        self.db.execute_batch(
            "DELETE FROM pending_uploads;
             DELETE FROM route_points;
             DELETE FROM sessions;",
        )?;
        Ok(())
    }
}

/// Classify a restore-path SQL failure: a column that no longer decodes
/// means the stored bytes cannot be trusted and the session is discarded,
/// while connection-level failures still surface as persistence errors.
fn corrupted_on_decode(err: rusqlite::Error) -> CaptureError {
    match err {
        rusqlite::Error::InvalidColumnType(..)
        | rusqlite::Error::FromSqlConversionFailure(..)
        | rusqlite::Error::IntegralValueOutOfRange(..)
        | rusqlite::Error::Utf8Error(..) => CaptureError::RestoreCorrupted {
            message: err.to_string(),
        },
        other => other.into(),
    }
}

fn row_to_point(row: &rusqlite::Row<'_>) -> rusqlite::Result<RoutePoint> {
    Ok(RoutePoint {
        session_id: row.get(0)?,
        sequence: row.get(1)?,
        latitude: row.get(2)?,
        longitude: row.get(3)?,
        accuracy: row.get(4)?,
        altitude: row.get(5)?,
        heading: row.get(6)?,
        speed: row.get(7)?,
        captured_at_ms: row.get(8)?,
    })
}

/// Map a header row; an unknown status string is reported as a corruption
/// message rather than a SQL error.
fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<std::result::Result<Session, String>> {
    let status_str: String = row.get(12)?;
    let status = match SessionStatus::parse(&status_str) {
        Some(status) => status,
        None => return Ok(Err(format!("unknown session status '{}'", status_str))),
    };

    let start_point = match (row.get::<_, Option<f64>>(4)?, row.get::<_, Option<f64>>(5)?) {
        (Some(lat), Some(lng)) => Some(GeoPoint::new(lat, lng)),
        _ => None,
    };
    let end_point = match (row.get::<_, Option<f64>>(6)?, row.get::<_, Option<f64>>(7)?) {
        (Some(lat), Some(lng)) => Some(GeoPoint::new(lat, lng)),
        _ => None,
    };

    Ok(Ok(Session {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        started_at_ms: row.get(2)?,
        ended_at_ms: row.get(3)?,
        start_point,
        end_point,
        distance_miles: row.get(8)?,
        duration_secs: row.get(9)?,
        point_count: row.get(10)?,
        lead_count: row.get(11)?,
        status,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Position;

    fn store_with_session() -> (SessionStore, Session) {
        let store = SessionStore::in_memory().unwrap();
        let session = Session::new("tenant-1", 1_700_000_000_000, Some(GeoPoint::new(41.8781, -87.6298)));
        store.create_session(&session).unwrap();
        (store, session)
    }

    fn kept_point(session: &Session, seq: u32) -> RoutePoint {
        let pos = Position::new(
            41.8781 + seq as f64 * 0.0004,
            -87.6298,
            1_700_000_000_000 + seq as i64 * 10_000,
        );
        RoutePoint::from_position(&session.id, seq, &pos)
    }

    #[test]
    fn test_append_and_route() {
        let (mut store, mut session) = store_with_session();

        for seq in 1..=3 {
            session.point_count = seq;
            store
                .append_point(&kept_point(&session, seq), &session)
                .unwrap();
        }

        let route = store.route(&session.id).unwrap();
        assert_eq!(route.len(), 3);
        assert_eq!(route[0].sequence, 1);
        assert_eq!(route[2].sequence, 3);
        assert_eq!(store.pending_count(&session.id).unwrap(), 3);
    }

    #[test]
    fn test_pending_batch_order_and_removal() {
        let (mut store, mut session) = store_with_session();
        for seq in 1..=5 {
            session.point_count = seq;
            store
                .append_point(&kept_point(&session, seq), &session)
                .unwrap();
        }

        let batch = store.pending_batch(&session.id, 3).unwrap();
        assert_eq!(
            batch.iter().map(|p| p.sequence).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );

        store.remove_pending(&session.id, &[1, 2, 3]).unwrap();
        assert_eq!(store.pending_count(&session.id).unwrap(), 2);

        // Route list is untouched by queue removal
        assert_eq!(store.route(&session.id).unwrap().len(), 5);
    }

    #[test]
    fn test_restore_round_trip() {
        let (mut store, mut session) = store_with_session();
        for seq in 1..=4 {
            session.point_count = seq;
            store
                .append_point(&kept_point(&session, seq), &session)
                .unwrap();
        }
        store.remove_pending(&session.id, &[1]).unwrap();

        let restored = store.restore().unwrap().expect("session should restore");
        assert_eq!(restored.session.id, session.id);
        assert_eq!(restored.route.len(), 4);
        assert_eq!(restored.pending, vec![2, 3, 4]);
        assert_eq!(restored.next_sequence, 5);
    }

    #[test]
    fn test_restore_empty_store() {
        let store = SessionStore::in_memory().unwrap();
        assert!(store.restore().unwrap().is_none());
    }

    #[test]
    fn test_terminal_session_not_restored() {
        let (store, mut session) = store_with_session();
        session.status = SessionStatus::Completed;
        store.update_session(&session).unwrap();
        assert!(store.restore().unwrap().is_none());
    }

    #[test]
    fn test_restore_corrupted_status() {
        let (store, session) = store_with_session();
        store
            .db
            .execute(
                "UPDATE sessions SET status = 'garbled' WHERE id = ?1",
                params![session.id],
            )
            .unwrap();

        assert!(matches!(
            store.restore(),
            Err(CaptureError::RestoreCorrupted { .. })
        ));
    }

    #[test]
    fn test_restore_garbled_column_is_corruption() {
        let (store, session) = store_with_session();
        // SQLite's loose typing lets a text value land in an INTEGER
        // column; that must read as corruption, not a SQL error
        store
            .db
            .execute(
                "UPDATE sessions SET started_at_ms = 'not-a-number' WHERE id = ?1",
                params![session.id],
            )
            .unwrap();

        assert!(matches!(
            store.restore(),
            Err(CaptureError::RestoreCorrupted { .. })
        ));
    }

    #[test]
    fn test_restore_corrupted_pending() {
        let (store, session) = store_with_session();
        store
            .db
            .execute(
                "INSERT INTO pending_uploads (session_id, sequence) VALUES (?1, 99)",
                params![session.id],
            )
            .unwrap();

        assert!(matches!(
            store.restore(),
            Err(CaptureError::RestoreCorrupted { .. })
        ));
    }

    #[test]
    fn test_lead_count_increment() {
        let (store, session) = store_with_session();
        assert_eq!(store.increment_lead_count(&session.id).unwrap(), 1);
        assert_eq!(store.increment_lead_count(&session.id).unwrap(), 2);
    }

    #[test]
    fn test_clear() {
        let (mut store, mut session) = store_with_session();
        session.point_count = 1;
        store
            .append_point(&kept_point(&session, 1), &session)
            .unwrap();

        store.clear(&session.id).unwrap();
        assert!(store.restore().unwrap().is_none());
        assert_eq!(store.pending_count(&session.id).unwrap(), 0);
    }
}
