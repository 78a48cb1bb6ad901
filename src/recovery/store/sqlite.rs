//! SQLite implementation of the snapshot store.
//!
//! Each snapshot is a row in `snaps` plus one row per accumulator in
//! `states`. The recovery pointer is the single row of `latest`. All
//! three are written in one transaction, so the pointer can never
//! reference a partially written snapshot.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OpenFlags, OptionalExtension};
use rusqlite_migration::{Migrations, M};
use serde::{Deserialize, Serialize};

use super::SnapshotStore;
use crate::errors::{EngineError, EngineException, EngineResult};
use crate::recovery::model::*;

/// Everything about a snapshot that does not get its own column.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SnapshotMeta {
    schema: StateSchema,
    mode: CheckpointMode,
}

// The `'static` lifetime within [`Migrations`] is saying that the
// [`str`]s composing the migrations are `'static`.
fn get_migrations() -> Migrations<'static> {
    Migrations::new(vec![
        M::up(
            "CREATE TABLE snaps ( \
             created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP, \
             checkpoint_id INTEGER NOT NULL PRIMARY KEY, \
             source_offset INTEGER NOT NULL CHECK (source_offset >= 0), \
             format_version INTEGER NOT NULL, \
             taken_at TEXT NOT NULL, \
             meta TEXT NOT NULL \
             ) STRICT",
        ),
        // No foreign key to `snaps`: rows of a replaced snapshot are
        // deleted explicitly in the same transaction.
        M::up(
            "CREATE TABLE states ( \
             checkpoint_id INTEGER NOT NULL, \
             state_name TEXT NOT NULL, \
             state_key TEXT NOT NULL, \
             ser_state BLOB NOT NULL, \
             PRIMARY KEY (checkpoint_id, state_name, state_key) \
             ) STRICT",
        ),
        M::up(
            "CREATE TABLE latest ( \
             id INTEGER NOT NULL PRIMARY KEY CHECK (id = 0), \
             checkpoint_id INTEGER NOT NULL \
             ) STRICT",
        ),
    ])
}

#[test]
fn migrations_valid() -> rusqlite_migration::Result<()> {
    get_migrations().validate()
}

/// Setup our connection-level pragmas. Run this on each connection.
fn setup_conn(conn: &mut Connection) -> EngineResult<()> {
    // These are recommended by Litestream.
    conn.pragma_update(None, "journal_mode", "WAL")
        .reraise("error setting WAL journal mode")?;
    conn.pragma_update(None, "busy_timeout", "5000")
        .reraise("error setting busy timeout")?;
    get_migrations()
        .to_latest(conn)
        .reraise("error migrating snapshot database")
}

/// Snapshot store backed by a SQLite database file.
#[derive(Debug)]
pub struct SqliteSnapshotStore {
    conn: Connection,
}

impl SqliteSnapshotStore {
    /// Open or create the database at `path`.
    pub fn open(path: &Path) -> EngineResult<Self> {
        tracing::info!("Opening snapshot store at {path:?}");
        let mut conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .reraise(&format!("error opening snapshot store at {path:?}"))?;
        setup_conn(&mut conn)?;
        Ok(Self { conn })
    }

    /// Database only living as long as this store.
    pub fn open_in_memory() -> EngineResult<Self> {
        let mut conn =
            Connection::open_in_memory().reraise("error opening in-memory snapshot store")?;
        setup_conn(&mut conn)?;
        Ok(Self { conn })
    }

    fn latest_id(&self) -> EngineResult<Option<CheckpointId>> {
        self.conn
            .query_row(
                "SELECT checkpoint_id FROM latest WHERE id = 0",
                (),
                |row| row.get(0).map(CheckpointId),
            )
            .optional()
            .reraise("error reading recovery pointer")
    }

    fn load(&self, id: CheckpointId) -> EngineResult<PersistedSnapshot> {
        let row: Option<(u64, u32, String, String)> = self
            .conn
            .query_row(
                "SELECT source_offset, format_version, taken_at, meta \
                 FROM snaps \
                 WHERE checkpoint_id = ?1",
                (id.0,),
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()
            .reraise("error reading snapshot")?;
        let (source_offset, format_version, taken_at, meta) = row.ok_or_else(|| {
            EngineError::CorruptSnapshot(format!(
                "recovery pointer references missing snapshot {id}"
            ))
        })?;
        let taken_at = DateTime::parse_from_rfc3339(&taken_at)
            .reraise("error parsing snapshot timestamp")?
            .with_timezone(&Utc);
        let meta: SnapshotMeta =
            serde_json::from_str(&meta).reraise("error decoding snapshot metadata")?;

        let mut stmt = self
            .conn
            .prepare(
                "SELECT state_name, state_key, ser_state \
                 FROM states \
                 WHERE checkpoint_id = ?1",
            )
            .reraise("error preparing state query")?;
        let rows = stmt
            .query_map((id.0,), |row| {
                Ok((
                    StateName(row.get(0)?),
                    StateKey(row.get(1)?),
                    StateBytes(row.get(2)?),
                ))
            })
            .reraise("error reading states")?;
        let mut states: BTreeMap<StateName, BTreeMap<StateKey, StateBytes>> = meta
            .schema
            .states
            .iter()
            .map(|(name, _discipline)| (name.clone(), BTreeMap::new()))
            .collect();
        for row in rows {
            let (name, key, bytes) = row.reraise("error unpacking state row")?;
            states.entry(name).or_default().insert(key, bytes);
        }

        Ok(PersistedSnapshot {
            format_version,
            schema: meta.schema,
            checkpoint_id: id,
            source_offset: SourceOffset(source_offset),
            mode: meta.mode,
            taken_at,
            states,
        })
    }

    /// Ids of every stored snapshot, oldest first.
    pub fn checkpoint_ids(&self) -> EngineResult<Vec<CheckpointId>> {
        let mut stmt = self
            .conn
            .prepare("SELECT checkpoint_id FROM snaps ORDER BY checkpoint_id")
            .reraise("error preparing snapshot listing")?;
        let ids = stmt
            .query_map((), |row| row.get(0).map(CheckpointId))
            .reraise("error listing snapshots")?
            .collect::<Result<Vec<_>, _>>()
            .reraise("error unpacking snapshot id")?;
        Ok(ids)
    }
}

impl SnapshotStore for SqliteSnapshotStore {
    fn write(&mut self, snapshot: &PersistedSnapshot) -> EngineResult<()> {
        let meta = serde_json::to_string(&SnapshotMeta {
            schema: snapshot.schema.clone(),
            mode: snapshot.mode,
        })
        .map_err(|err| EngineError::Store(format!("error encoding snapshot metadata: {err}")))?;
        let id = snapshot.checkpoint_id;

        let txn = self
            .conn
            .transaction()
            .reraise("error starting snapshot transaction")?;
        txn.execute("DELETE FROM states WHERE checkpoint_id = ?1", (id.0,))
            .reraise("error clearing replaced states")?;
        txn.execute(
            "INSERT INTO snaps (checkpoint_id, source_offset, format_version, taken_at, meta) \
             VALUES (?1, ?2, ?3, ?4, ?5) \
             ON CONFLICT (checkpoint_id) DO UPDATE \
             SET source_offset = EXCLUDED.source_offset, \
             format_version = EXCLUDED.format_version, \
             taken_at = EXCLUDED.taken_at, \
             meta = EXCLUDED.meta",
            (
                id.0,
                snapshot.source_offset.0,
                snapshot.format_version,
                snapshot.taken_at.to_rfc3339(),
                meta,
            ),
        )
        .reraise("error writing snapshot row")?;
        {
            let mut stmt = txn
                .prepare(
                    "INSERT INTO states (checkpoint_id, state_name, state_key, ser_state) \
                     VALUES (?1, ?2, ?3, ?4)",
                )
                .reraise("error preparing state insert")?;
            for (name, keyed) in &snapshot.states {
                for (key, bytes) in keyed {
                    tracing::trace!("Writing {name}/{key} for snapshot {id}");
                    stmt.execute((id.0, &name.0, &key.0, &bytes.0))
                        .reraise("error writing state row")?;
                }
            }
        }
        txn.execute(
            "INSERT INTO latest (id, checkpoint_id) VALUES (0, ?1) \
             ON CONFLICT (id) DO UPDATE \
             SET checkpoint_id = EXCLUDED.checkpoint_id",
            (id.0,),
        )
        .reraise("error moving recovery pointer")?;
        txn.commit().reraise("error committing snapshot")
    }

    fn load_latest(&self) -> EngineResult<Option<PersistedSnapshot>> {
        match self.latest_id()? {
            None => Ok(None),
            Some(id) => self.load(id).map(Some),
        }
    }

    fn gc(&mut self, retain: usize) -> EngineResult<()> {
        let retain = retain.max(1);
        let txn = self
            .conn
            .transaction()
            .reraise("error starting GC transaction")?;
        let garbage = "SELECT checkpoint_id FROM snaps \
                       WHERE checkpoint_id NOT IN ( \
                       SELECT checkpoint_id FROM snaps ORDER BY checkpoint_id DESC LIMIT ?1 \
                       ) \
                       AND checkpoint_id NOT IN (SELECT checkpoint_id FROM latest)";
        let removed = txn
            .execute(
                &format!("DELETE FROM states WHERE checkpoint_id IN ({garbage})"),
                (retain,),
            )
            .reraise("error deleting old states")?;
        txn.execute(&format!("DELETE FROM snaps WHERE checkpoint_id IN ({garbage})"), (retain,))
            .reraise("error deleting old snapshots")?;
        txn.commit().reraise("error committing GC")?;
        tracing::trace!("GC removed {removed} state rows");
        Ok(())
    }
}
