//! SQLite-backed node state: instance identity, vector clock, write-ahead
//! log and the replicated spaces.
//!
//! One file per node (`<data_dir>/node.db`), WAL journal mode.
//! Every op runs in a single transaction together with its log entry and
//! clock update, so the three never disagree.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use meshcheck_protocol::{InstanceId, LogEntry, Lsn, Op, Record, Snapshot, VClock};
use rusqlite::{params, Connection, OptionalExtension, Transaction};

use crate::{Result, SimError};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS meta (
    key   TEXT PRIMARY KEY,
    value INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS vclock (
    instance_id INTEGER PRIMARY KEY,
    lsn         INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS wal (
    seq    INTEGER PRIMARY KEY AUTOINCREMENT,
    origin INTEGER NOT NULL,
    lsn    INTEGER NOT NULL,
    op     TEXT NOT NULL,
    UNIQUE (origin, lsn)
);
CREATE TABLE IF NOT EXISTS members (
    instance_id INTEGER PRIMARY KEY,
    name        TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS spaces (
    name TEXT PRIMARY KEY
);
CREATE TABLE IF NOT EXISTS records (
    space  TEXT NOT NULL,
    row    INTEGER NOT NULL,
    origin INTEGER NOT NULL,
    PRIMARY KEY (space, row)
);
";

const META_INSTANCE_ID: &str = "instance_id";
const META_MASTER_ID: &str = "master_id";
const META_NEXT_ID: &str = "next_id";

/// How an op is being applied: a local write must respect uniqueness, a
/// replicated one is applied leniently.
#[derive(Clone, Copy, PartialEq)]
enum Origin {
    Local,
    Remote,
}

pub struct SqliteStore {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl SqliteStore {
    /// Open (or create) the node database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;",
        )?;
        conn.execute_batch(SCHEMA)?;
        tracing::debug!(path = %path.display(), "store opened");
        Ok(Self {
            conn: Mutex::new(conn),
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| SimError::LockPoisoned)
    }

    pub fn instance_id(&self) -> Result<Option<InstanceId>> {
        let conn = self.lock()?;
        read_meta(&conn, META_INSTANCE_ID)
    }

    pub fn master_id(&self) -> Result<Option<InstanceId>> {
        let conn = self.lock()?;
        read_meta(&conn, META_MASTER_ID)
    }

    fn require_id(conn: &Connection) -> Result<InstanceId> {
        read_meta(conn, META_INSTANCE_ID)?.ok_or(SimError::NotBootstrapped)
    }

    /// Initialise a fresh master: instance id 1, allocator at 2.
    /// Returns the existing id if the store was already bootstrapped.
    pub fn init_master(&self, name: &str) -> Result<InstanceId> {
        let mut conn = self.lock()?;
        if let Some(id) = read_meta(&conn, META_INSTANCE_ID)? {
            return Ok(id);
        }
        let tx = conn.transaction()?;
        write_meta(&tx, META_INSTANCE_ID, 1)?;
        write_meta(&tx, META_MASTER_ID, 1)?;
        write_meta(&tx, META_NEXT_ID, 2)?;
        let register = Op::Register {
            instance_id: 1,
            name: name.to_string(),
        };
        apply_op(&tx, &register, Origin::Local)?;
        append_local(&tx, 1, &register)?;
        tx.commit()?;
        Ok(1)
    }

    /// Allocate an instance id for a joining replica and log its registration.
    /// Returns the new id together with a snapshot that includes the entry.
    pub fn register_replica(&self, name: &str) -> Result<(InstanceId, InstanceId, Snapshot)> {
        let mut conn = self.lock()?;
        let own = Self::require_id(&conn)?;
        let master = read_meta(&conn, META_MASTER_ID)?.unwrap_or(own);
        if master != own {
            return Err(SimError::Command(format!(
                "instance {own} is not the master (master is {master})"
            )));
        }
        let next: InstanceId = read_meta(&conn, META_NEXT_ID)?.unwrap_or(2);

        let register = Op::Register {
            instance_id: next,
            name: name.to_string(),
        };
        let tx = conn.transaction()?;
        write_meta(&tx, META_NEXT_ID, next + 1)?;
        apply_op(&tx, &register, Origin::Local)?;
        append_local(&tx, own, &register)?;
        tx.commit()?;

        let snapshot = snapshot_locked(&conn)?;
        Ok((next, master, snapshot))
    }

    /// Adopt an identity assigned by the master and replay its snapshot.
    pub fn bootstrap(
        &self,
        instance_id: InstanceId,
        master_id: InstanceId,
        snapshot: &Snapshot,
    ) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        write_meta(&tx, META_INSTANCE_ID, instance_id)?;
        write_meta(&tx, META_MASTER_ID, master_id)?;
        for entry in &snapshot.entries {
            apply_remote_tx(&tx, instance_id, entry)?;
        }
        for (id, lsn) in snapshot.vclock.iter() {
            raise_clock(&tx, id, lsn)?;
        }
        tx.execute(
            "INSERT OR IGNORE INTO vclock (instance_id, lsn) VALUES (?1, 0)",
            params![instance_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn vclock(&self) -> Result<VClock> {
        let conn = self.lock()?;
        vclock_locked(&conn)
    }

    /// Mark an origin as known (clock entry defined at its current value).
    pub fn define_origin(&self, id: InstanceId) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR IGNORE INTO vclock (instance_id, lsn) VALUES (?1, 0)",
            params![id],
        )?;
        Ok(())
    }

    /// Apply a locally originated op: next lsn for this instance.
    pub fn apply_local(&self, op: Op) -> Result<LogEntry> {
        let mut conn = self.lock()?;
        let own = Self::require_id(&conn)?;
        let tx = conn.transaction()?;
        apply_op(&tx, &op, Origin::Local)?;
        let entry = append_local(&tx, own, &op)?;
        tx.commit()?;
        Ok(entry)
    }

    /// Apply a replicated entry. Returns false if it was already applied.
    pub fn apply_remote(&self, entry: &LogEntry) -> Result<bool> {
        let mut conn = self.lock()?;
        let own = Self::require_id(&conn)?;
        let tx = conn.transaction()?;
        let applied = apply_remote_tx(&tx, own, entry)?;
        tx.commit()?;
        Ok(applied)
    }

    /// Log entries the holder of `vclock` has not seen, in local apply order.
    pub fn entries_since(&self, vclock: &VClock, limit: u32) -> Result<(Vec<LogEntry>, bool)> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT origin, lsn, op FROM wal ORDER BY seq")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, InstanceId>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut entries = Vec::new();
        let mut has_more = false;
        for row in rows {
            let (origin, lsn, op) = row?;
            let lsn = lsn as Lsn;
            if lsn <= vclock.lsn(origin) {
                continue;
            }
            if entries.len() >= limit as usize {
                has_more = true;
                break;
            }
            entries.push(LogEntry {
                origin,
                lsn,
                op: serde_json::from_str(&op)?,
            });
        }
        Ok((entries, has_more))
    }

    pub fn snapshot(&self) -> Result<Snapshot> {
        let conn = self.lock()?;
        snapshot_locked(&conn)
    }

    pub fn create_space(&self, space: &str) -> Result<LogEntry> {
        self.apply_local(Op::CreateSpace {
            space: space.to_string(),
        })
    }

    pub fn insert(&self, space: &str, record: Record) -> Result<LogEntry> {
        self.apply_local(Op::Insert {
            space: space.to_string(),
            record,
        })
    }

    pub fn space_len(&self, space: &str) -> Result<u64> {
        let conn = self.lock()?;
        require_space(&conn, space)?;
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM records WHERE space = ?1",
            params![space],
            |row| row.get(0),
        )?;
        Ok(n as u64)
    }

    pub fn select(&self, space: &str) -> Result<Vec<Record>> {
        let conn = self.lock()?;
        require_space(&conn, space)?;
        let mut stmt =
            conn.prepare("SELECT row, origin FROM records WHERE space = ?1 ORDER BY row")?;
        let rows = stmt.query_map(params![space], |row| {
            Ok(Record {
                row: row.get::<_, i64>(0)? as u64,
                origin: row.get(1)?,
            })
        })?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(SimError::from)
    }

    pub fn members(&self) -> Result<Vec<(InstanceId, String)>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT instance_id, name FROM members ORDER BY instance_id")?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(SimError::from)
    }
}

// ============================================================================
// Helpers (connection already locked)
// ============================================================================

fn read_meta(conn: &Connection, key: &str) -> Result<Option<InstanceId>> {
    let value = conn
        .query_row("SELECT value FROM meta WHERE key = ?1", params![key], |row| {
            row.get::<_, InstanceId>(0)
        })
        .optional()?;
    Ok(value)
}

fn write_meta(tx: &Transaction<'_>, key: &str, value: InstanceId) -> Result<()> {
    tx.execute(
        "INSERT OR REPLACE INTO meta (key, value) VALUES (?1, ?2)",
        params![key, value],
    )?;
    Ok(())
}

fn vclock_locked(conn: &Connection) -> Result<VClock> {
    let mut stmt = conn.prepare("SELECT instance_id, lsn FROM vclock")?;
    let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, InstanceId>(0)?, row.get::<_, i64>(1)? as Lsn))
    })?;
    let mut clock = VClock::new();
    for row in rows {
        let (id, lsn) = row?;
        clock.define(id);
        clock.advance(id, lsn);
    }
    Ok(clock)
}

fn snapshot_locked(conn: &Connection) -> Result<Snapshot> {
    let vclock = vclock_locked(conn)?;
    let mut stmt = conn.prepare("SELECT origin, lsn, op FROM wal ORDER BY seq")?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, InstanceId>(0)?,
            row.get::<_, i64>(1)?,
            row.get::<_, String>(2)?,
        ))
    })?;
    let mut entries = Vec::new();
    for row in rows {
        let (origin, lsn, op) = row?;
        entries.push(LogEntry {
            origin,
            lsn: lsn as Lsn,
            op: serde_json::from_str(&op)?,
        });
    }
    Ok(Snapshot { vclock, entries })
}

fn current_lsn(tx: &Transaction<'_>, id: InstanceId) -> Result<Option<Lsn>> {
    let lsn = tx
        .query_row(
            "SELECT lsn FROM vclock WHERE instance_id = ?1",
            params![id],
            |row| row.get::<_, i64>(0),
        )
        .optional()?;
    Ok(lsn.map(|l| l as Lsn))
}

fn raise_clock(tx: &Transaction<'_>, id: InstanceId, lsn: Lsn) -> Result<()> {
    tx.execute(
        "INSERT INTO vclock (instance_id, lsn) VALUES (?1, ?2)
         ON CONFLICT(instance_id) DO UPDATE SET lsn = MAX(lsn, excluded.lsn)",
        params![id, lsn as i64],
    )?;
    Ok(())
}

fn append_local(tx: &Transaction<'_>, own: InstanceId, op: &Op) -> Result<LogEntry> {
    let lsn = current_lsn(tx, own)?.unwrap_or(0) + 1;
    tx.execute(
        "INSERT INTO wal (origin, lsn, op) VALUES (?1, ?2, ?3)",
        params![own, lsn as i64, serde_json::to_string(op)?],
    )?;
    raise_clock(tx, own, lsn)?;
    Ok(LogEntry {
        origin: own,
        lsn,
        op: op.clone(),
    })
}

fn apply_remote_tx(tx: &Transaction<'_>, own: InstanceId, entry: &LogEntry) -> Result<bool> {
    if entry.origin == own {
        return Ok(false);
    }
    if let Some(current) = current_lsn(tx, entry.origin)? {
        if entry.lsn <= current {
            return Ok(false);
        }
    }
    apply_op(tx, &entry.op, Origin::Remote)?;
    tx.execute(
        "INSERT OR IGNORE INTO wal (origin, lsn, op) VALUES (?1, ?2, ?3)",
        params![entry.origin, entry.lsn as i64, serde_json::to_string(&entry.op)?],
    )?;
    raise_clock(tx, entry.origin, entry.lsn)?;
    Ok(true)
}

fn require_space(conn: &Connection, space: &str) -> Result<()> {
    let exists = conn
        .query_row("SELECT 1 FROM spaces WHERE name = ?1", params![space], |_| Ok(()))
        .optional()?;
    if exists.is_none() {
        return Err(SimError::Command(format!("space '{space}' does not exist")));
    }
    Ok(())
}

fn apply_op(tx: &Transaction<'_>, op: &Op, origin: Origin) -> Result<()> {
    match op {
        Op::Register { instance_id, name } => {
            tx.execute(
                "INSERT OR REPLACE INTO members (instance_id, name) VALUES (?1, ?2)",
                params![instance_id, name],
            )?;
            // Keep the allocator ahead of every registered id.
            let next: InstanceId = read_meta(tx, META_NEXT_ID)?.unwrap_or(2);
            if *instance_id >= next {
                write_meta(tx, META_NEXT_ID, instance_id + 1)?;
            }
        }
        Op::CreateSpace { space } => {
            let inserted = tx.execute(
                "INSERT OR IGNORE INTO spaces (name) VALUES (?1)",
                params![space],
            )?;
            if inserted == 0 && origin == Origin::Local {
                return Err(SimError::Command(format!("space '{space}' already exists")));
            }
        }
        Op::Insert { space, record } => {
            match origin {
                Origin::Local => require_space(tx, space)?,
                Origin::Remote => {
                    tx.execute(
                        "INSERT OR IGNORE INTO spaces (name) VALUES (?1)",
                        params![space],
                    )?;
                }
            }
            let inserted = tx.execute(
                "INSERT OR IGNORE INTO records (space, row, origin) VALUES (?1, ?2, ?3)",
                params![space, record.row as i64, record.origin],
            )?;
            if inserted == 0 {
                match origin {
                    Origin::Local => {
                        return Err(SimError::Command(format!(
                            "duplicate key {} in space '{space}'",
                            record.row
                        )))
                    }
                    Origin::Remote => tracing::warn!(
                        space = space.as_str(),
                        row = record.row,
                        "replicated insert conflicts with an existing row, keeping local"
                    ),
                }
            }
        }
    }
    Ok(())
}
