use std::path::Path;
use std::sync::Mutex;

use rusqlite::{Connection, OptionalExtension, params};

use crate::config::{FirewallRule, MachineStatus, RuntimeState, VmSpec};
use crate::error::{Error, Result};

use super::{MachineRow, MachineStore, RunningVm, RuntimeUpdate, Transition, VmRecord};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS machines (
    id            TEXT PRIMARY KEY,
    name          TEXT NOT NULL,
    internal_name TEXT NOT NULL UNIQUE,
    os            TEXT NOT NULL,
    status        TEXT NOT NULL,
    version       INTEGER NOT NULL DEFAULT 1,
    spec          TEXT NOT NULL,
    runtime       TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS firewall_rules (
    id       TEXT PRIMARY KEY,
    vm_id    TEXT,
    priority INTEGER NOT NULL,
    rule     TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_firewall_rules_vm ON firewall_rules (vm_id);
";

/// SQLite-backed [`MachineStore`].
///
/// The connection is guarded by a mutex; the status compare-and-swap runs
/// inside a transaction so concurrent writers observe a consistent
/// `(status, version)` tuple.
#[derive(Debug)]
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and apply the schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref()).map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (used by tests).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Insert a firewall rule. `vm_id = None` stores a department-wide rule.
    pub fn insert_firewall_rule(&self, vm_id: Option<&str>, rule: &FirewallRule) -> Result<()> {
        let conn = self.lock()?;
        let body = serde_json::to_string(rule).map_err(encode_err)?;
        conn.execute(
            "INSERT OR REPLACE INTO firewall_rules (id, vm_id, priority, rule)
             VALUES (?1, ?2, ?3, ?4)",
            params![rule.id, vm_id, rule.priority, body],
        )
        .map_err(db_err)?;
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| Error::DatabaseError {
            message: "sqlite connection mutex poisoned".to_string(),
        })
    }

    fn load_runtime(&self, conn: &Connection, id: &str) -> Result<Option<RuntimeState>> {
        let raw: Option<String> = conn
            .query_row(
                "SELECT runtime FROM machines WHERE id = ?1",
                [id],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw).map_err(decode_err)?)),
            None => Ok(None),
        }
    }

    fn store_runtime(&self, conn: &Connection, id: &str, runtime: &RuntimeState) -> Result<()> {
        let body = serde_json::to_string(runtime).map_err(encode_err)?;
        conn.execute(
            "UPDATE machines SET runtime = ?1 WHERE id = ?2",
            params![body, id],
        )
        .map_err(db_err)?;
        Ok(())
    }
}

fn db_err(err: rusqlite::Error) -> Error {
    Error::DatabaseError {
        message: err.to_string(),
    }
}

fn encode_err(err: serde_json::Error) -> Error {
    Error::DatabaseError {
        message: format!("failed to encode record: {err}"),
    }
}

fn decode_err(err: serde_json::Error) -> Error {
    Error::DatabaseError {
        message: format!("failed to decode record: {err}"),
    }
}

fn parse_status(raw: &str, id: &str) -> Result<MachineStatus> {
    MachineStatus::parse(raw).ok_or_else(|| Error::DatabaseError {
        message: format!("machine `{id}` has unknown status `{raw}`"),
    })
}

/// Raw column tuple read by the record queries; decoded outside the
/// rusqlite closure so serde errors map to our error type.
type RawRecord = (String, String, String, String, String, i64, String, String);

fn read_raw_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRecord> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
    ))
}

fn decode_record(raw: RawRecord) -> Result<VmRecord> {
    let (id, name, internal_name, os, status_raw, version, spec_raw, runtime_raw) = raw;
    let status = parse_status(&status_raw, &id)?;
    let spec: VmSpec = serde_json::from_str(&spec_raw).map_err(decode_err)?;
    let runtime: RuntimeState = serde_json::from_str(&runtime_raw).map_err(decode_err)?;
    Ok(VmRecord {
        id,
        name,
        internal_name,
        os,
        version,
        status,
        spec,
        runtime,
    })
}

const SELECT_RECORD: &str =
    "SELECT id, name, internal_name, os, status, version, spec, runtime FROM machines";

impl MachineStore for SqliteStore {
    fn insert_machine(&self, record: &VmRecord) -> Result<()> {
        let conn = self.lock()?;
        let spec = serde_json::to_string(&record.spec).map_err(encode_err)?;
        let runtime = serde_json::to_string(&record.runtime).map_err(encode_err)?;
        conn.execute(
            "INSERT INTO machines (id, name, internal_name, os, status, version, spec, runtime)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                record.id,
                record.name,
                record.internal_name,
                record.os,
                record.status.as_str(),
                record.version,
                spec,
                runtime
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    fn find_machine(&self, id: &str) -> Result<Option<MachineRow>> {
        let conn = self.lock()?;
        let row: Option<(String, String)> = conn
            .query_row(
                "SELECT id, status FROM machines WHERE id = ?1",
                [id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(db_err)?;
        match row {
            Some((id, status_raw)) => {
                let status = parse_status(&status_raw, &id)?;
                Ok(Some(MachineRow { id, status }))
            }
            None => Ok(None),
        }
    }

    fn update_machine_status(&self, id: &str, status: MachineStatus) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE machines SET status = ?1 WHERE id = ?2",
            params![status.as_str(), id],
        )
        .map_err(db_err)?;
        Ok(())
    }

    fn find_running_vms(&self) -> Result<Vec<RunningVm>> {
        let conn = self.lock()?;
        let mut statement = conn
            .prepare("SELECT id, status, runtime FROM machines WHERE status = 'running'")
            .map_err(db_err)?;
        let rows = statement
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })
            .map_err(db_err)?;

        let mut running = Vec::new();
        for row in rows {
            let (id, status_raw, runtime_raw) = row.map_err(db_err)?;
            let status = parse_status(&status_raw, &id)?;
            let runtime: RuntimeState =
                serde_json::from_str(&runtime_raw).map_err(decode_err)?;
            running.push(RunningVm {
                id,
                status,
                qemu_pid: runtime.qemu_pid,
                tap_device: runtime.tap_device,
                monitor_socket: runtime.monitor_socket,
                guest_agent_socket: runtime.guest_agent_socket,
                host_agent_socket: runtime.host_agent_socket,
            });
        }
        Ok(running)
    }

    fn clear_machine_configuration(&self, id: &str) -> Result<()> {
        let conn = self.lock()?;
        if self.load_runtime(&conn, id)?.is_some() {
            self.store_runtime(&conn, id, &RuntimeState::default())?;
        }
        Ok(())
    }

    fn clear_volatile_machine_configuration(&self, id: &str) -> Result<()> {
        let conn = self.lock()?;
        if let Some(mut runtime) = self.load_runtime(&conn, id)? {
            runtime.clear_volatile();
            self.store_runtime(&conn, id, &runtime)?;
        }
        Ok(())
    }

    fn find_machine_with_config(&self, id: &str) -> Result<Option<VmRecord>> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                &format!("{SELECT_RECORD} WHERE id = ?1"),
                [id],
                read_raw_record,
            )
            .optional()
            .map_err(db_err)?;
        row.map(decode_record).transpose()
    }

    fn update_machine_configuration(&self, id: &str, update: &RuntimeUpdate) -> Result<()> {
        let conn = self.lock()?;
        let mut runtime = self
            .load_runtime(&conn, id)?
            .ok_or_else(|| Error::VmNotFound { vm: id.to_string() })?;
        update.apply_to(&mut runtime);
        self.store_runtime(&conn, id, &runtime)
    }

    fn transition_vm_status(
        &self,
        id: &str,
        expected_status: MachineStatus,
        new_status: MachineStatus,
        expected_version: i64,
    ) -> Result<Transition> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(db_err)?;

        let observed: Option<(String, i64)> = tx
            .query_row(
                "SELECT status, version FROM machines WHERE id = ?1",
                [id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(db_err)?;
        let (status_raw, version) =
            observed.ok_or_else(|| Error::VmNotFound { vm: id.to_string() })?;

        if version != expected_version {
            return Err(Error::VersionConflict { vm: id.to_string() });
        }
        let status = parse_status(&status_raw, id)?;
        if status != expected_status {
            return Err(Error::InvalidState {
                vm: id.to_string(),
                expected: expected_status.as_str().to_string(),
                actual: status.as_str().to_string(),
            });
        }

        let changed = tx
            .execute(
                "UPDATE machines SET status = ?1, version = version + 1
                 WHERE id = ?2 AND status = ?3 AND version = ?4",
                params![
                    new_status.as_str(),
                    id,
                    expected_status.as_str(),
                    expected_version
                ],
            )
            .map_err(db_err)?;
        if changed != 1 {
            return Err(Error::VersionConflict { vm: id.to_string() });
        }

        let raw = tx
            .query_row(
                &format!("{SELECT_RECORD} WHERE id = ?1"),
                [id],
                read_raw_record,
            )
            .map_err(db_err)?;
        tx.commit().map_err(db_err)?;

        let record = decode_record(raw)?;
        Ok(Transition {
            new_version: record.version,
            record,
        })
    }

    fn firewall_rules(&self, vm_id: &str) -> Result<Vec<FirewallRule>> {
        let conn = self.lock()?;
        let mut statement = conn
            .prepare(
                "SELECT rule FROM firewall_rules
                 WHERE vm_id IS NULL OR vm_id = ?1
                 ORDER BY (vm_id IS NOT NULL), priority, rowid",
            )
            .map_err(db_err)?;
        let rows = statement
            .query_map([vm_id], |row| row.get::<_, String>(0))
            .map_err(db_err)?;

        let mut rules = Vec::new();
        for row in rows {
            let raw = row.map_err(db_err)?;
            rules.push(serde_json::from_str(&raw).map_err(decode_err)?);
        }
        Ok(rules)
    }
}
