/// On-disk journal of relay records.
///
/// Lets a device that reboots mid-emergency keep relaying what it held:
/// unexpired records and the local sequence counter survive a restart.
/// Messages are stored as MessagePack blobs; bookkeeping columns are
/// plain SQLite values so expired rows can be purged with one statement.
use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::MeshError;
use crate::message::Message;
use crate::store::RelayRecord;
use crate::types::{DeviceId, MessageId, RelayStatus};

const SEQUENCE_KEY: &str = "local_sequence";

pub struct MessageJournal {
    db: Connection,
}

impl MessageJournal {
    /// Open (or create) a journal file.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, MeshError> {
        Self::init(Connection::open(path)?)
    }

    /// Volatile journal, for tests and the simulator.
    pub fn open_in_memory() -> Result<Self, MeshError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(db: Connection) -> Result<Self, MeshError> {
        db.execute(
            "CREATE TABLE IF NOT EXISTS relay_records (
                id BLOB PRIMARY KEY,
                message BLOB NOT NULL,
                status INTEGER NOT NULL,
                delivered_local INTEGER NOT NULL DEFAULT 0,
                local_origin INTEGER NOT NULL DEFAULT 0,
                received_from BLOB NOT NULL,
                forwarded_to BLOB NOT NULL,
                expires_at INTEGER NOT NULL
            )",
            [],
        )?;
        db.execute(
            "CREATE INDEX IF NOT EXISTS idx_records_expires ON relay_records(expires_at)",
            [],
        )?;
        db.execute(
            "CREATE TABLE IF NOT EXISTS meta (
                key TEXT PRIMARY KEY,
                value INTEGER NOT NULL
            )",
            [],
        )?;
        Ok(Self { db })
    }

    /// Insert or overwrite a record. In-flight reservations are not kept.
    pub fn save(&self, record: &RelayRecord) -> Result<(), MeshError> {
        let received: Vec<DeviceId> = record.received_from.iter().copied().collect();
        let forwarded: Vec<DeviceId> = record.forwarded_to.iter().copied().collect();
        self.db.execute(
            "INSERT OR REPLACE INTO relay_records
                (id, message, status, delivered_local, local_origin, received_from, forwarded_to, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                record.id().as_bytes().as_slice(),
                record.message.to_bytes()?,
                record.status.as_i64(),
                record.delivered_local as i32,
                record.local_origin as i32,
                rmp_serde::to_vec(&received)?,
                rmp_serde::to_vec(&forwarded)?,
                to_sql_time(record.message.expires_at),
            ],
        )?;
        Ok(())
    }

    pub fn remove(&self, id: &MessageId) -> Result<(), MeshError> {
        self.db.execute(
            "DELETE FROM relay_records WHERE id = ?1",
            [id.as_bytes().as_slice()],
        )?;
        Ok(())
    }

    /// Delete rows whose window closed at or before `now`.
    pub fn purge_expired(&self, now: u64) -> Result<usize, MeshError> {
        let n = self.db.execute(
            "DELETE FROM relay_records WHERE expires_at <= ?1",
            [to_sql_time(now)],
        )?;
        Ok(n)
    }

    /// Every unexpired record, oldest expiry first.
    ///
    /// Rows that no longer decode are skipped with a warning.
    pub fn load_live(&self, now: u64) -> Result<Vec<RelayRecord>, MeshError> {
        let mut stmt = self.db.prepare(
            "SELECT message, status, delivered_local, local_origin, received_from, forwarded_to
             FROM relay_records WHERE expires_at > ?1 ORDER BY expires_at",
        )?;
        let rows = stmt
            .query_map([to_sql_time(now)], |row| {
                Ok((
                    row.get::<_, Vec<u8>>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i32>(2)? != 0,
                    row.get::<_, i32>(3)? != 0,
                    row.get::<_, Vec<u8>>(4)?,
                    row.get::<_, Vec<u8>>(5)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut records = Vec::with_capacity(rows.len());
        for (message, status, delivered_local, local_origin, received, forwarded) in rows {
            match decode_row(&message, status, &received, &forwarded) {
                Ok((message, status, received_from, forwarded_to)) => records.push(RelayRecord {
                    message,
                    received_from,
                    forwarded_to,
                    in_flight: Default::default(),
                    status,
                    delivered_local,
                    local_origin,
                }),
                Err(e) => tracing::warn!("journal: skipping unreadable record: {e}"),
            }
        }
        Ok(records)
    }

    pub fn len(&self) -> Result<usize, MeshError> {
        let n: i64 = self
            .db
            .query_row("SELECT COUNT(*) FROM relay_records", [], |row| row.get(0))?;
        Ok(n as usize)
    }

    pub fn is_empty(&self) -> Result<bool, MeshError> {
        Ok(self.len()? == 0)
    }

    // ── Sequence counter ──────────────────────────────────────────────

    /// Last sequence number used for a local message (0 if none).
    pub fn load_sequence(&self) -> Result<u64, MeshError> {
        let value: Option<i64> = self
            .db
            .query_row(
                "SELECT value FROM meta WHERE key = ?1",
                [SEQUENCE_KEY],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value.map(|v| v as u64).unwrap_or(0))
    }

    pub fn save_sequence(&self, sequence: u64) -> Result<(), MeshError> {
        self.db.execute(
            "INSERT OR REPLACE INTO meta (key, value) VALUES (?1, ?2)",
            params![SEQUENCE_KEY, sequence as i64],
        )?;
        Ok(())
    }
}

type DecodedRow = (
    Message,
    RelayStatus,
    std::collections::BTreeSet<DeviceId>,
    std::collections::BTreeSet<DeviceId>,
);

fn decode_row(
    message: &[u8],
    status: i64,
    received: &[u8],
    forwarded: &[u8],
) -> Result<DecodedRow, MeshError> {
    let message = Message::from_bytes_with_limit(message, usize::MAX)?;
    let status = RelayStatus::from_i64(status).ok_or_else(|| MeshError::Malformed {
        reason: format!("unknown relay status {status}"),
    })?;
    let received: Vec<DeviceId> = rmp_serde::from_slice(received)?;
    let forwarded: Vec<DeviceId> = rmp_serde::from_slice(forwarded)?;
    Ok((
        message,
        status,
        received.into_iter().collect(),
        forwarded.into_iter().collect(),
    ))
}

/// SQLite integers are signed; clamp far-future timestamps.
fn to_sql_time(ms: u64) -> i64 {
    i64::try_from(ms).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageBuilder;
    use crate::store::MessageStore;
    use crate::types::MessageKind;

    fn device(seed: u8) -> DeviceId {
        DeviceId::from_bytes([seed; 16])
    }

    fn record(seq: u64, validity: u64) -> RelayRecord {
        let m = MessageBuilder::new(device(1), MessageKind::Sos, b"trapped, 2 people".to_vec())
            .sequence(seq)
            .created_at(1_000)
            .validity_ms(validity)
            .build();
        let mut store = MessageStore::new();
        store.put(m.clone(), 1_000).unwrap();
        store.record_received_from(&m.id, device(2));
        store.mark_forwarded(&m.id, device(3));
        store.get(&m.id).unwrap().clone()
    }

    #[test]
    fn save_and_load() {
        let journal = MessageJournal::open_in_memory().unwrap();
        let r = record(1, 10_000);
        journal.save(&r).unwrap();

        let loaded = journal.load_live(2_000).unwrap();
        assert_eq!(loaded, vec![r]);
    }

    #[test]
    fn save_overwrites() {
        let journal = MessageJournal::open_in_memory().unwrap();
        let mut r = record(1, 10_000);
        journal.save(&r).unwrap();
        r.status = RelayStatus::ExternallyDelivered;
        journal.save(&r).unwrap();

        assert_eq!(journal.len().unwrap(), 1);
        assert_eq!(
            journal.load_live(2_000).unwrap()[0].status,
            RelayStatus::ExternallyDelivered
        );
    }

    #[test]
    fn expired_rows_not_loaded_and_purged() {
        let journal = MessageJournal::open_in_memory().unwrap();
        journal.save(&record(1, 500)).unwrap();
        journal.save(&record(2, 10_000)).unwrap();

        assert_eq!(journal.load_live(2_000).unwrap().len(), 1);
        assert_eq!(journal.purge_expired(2_000).unwrap(), 1);
        assert_eq!(journal.len().unwrap(), 1);
    }

    #[test]
    fn remove_deletes_row() {
        let journal = MessageJournal::open_in_memory().unwrap();
        let r = record(1, 10_000);
        journal.save(&r).unwrap();
        journal.remove(&r.id()).unwrap();
        assert!(journal.is_empty().unwrap());
    }

    #[test]
    fn sequence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.db");
        {
            let journal = MessageJournal::open(&path).unwrap();
            assert_eq!(journal.load_sequence().unwrap(), 0);
            journal.save_sequence(41).unwrap();
            journal.save(&record(1, u64::MAX / 2)).unwrap();
        }
        let journal = MessageJournal::open(&path).unwrap();
        assert_eq!(journal.load_sequence().unwrap(), 41);
        assert_eq!(journal.load_live(2_000).unwrap().len(), 1);
    }
}
