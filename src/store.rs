//! Sqlite-backed configuration and operation-history store, following the
//! same `CREATE TABLE IF NOT EXISTS` + prepared-statement style the
//! alias-based server table used, generalized to peripherals, automations,
//! and the audit log. Reads are infallible at the contract level: a query
//! error is logged and an empty result is returned so the supervisor can
//! skip the affected entries rather than crash on a single bad row.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{Connection, params};

use crate::model::{Action, Automation, OperationRecord, Peripheral, Trigger};

pub struct ConfigStore {
    conn: Mutex<Connection>,
}

impl ConfigStore {
    pub fn open<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        use anyhow::Context as _;
        let conn = Connection::open(path).context("failed to open sqlite database")?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS peripherals (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                interface TEXT NOT NULL,
                connection_params_json TEXT NOT NULL,
                channel_to_virtual_index_json TEXT NOT NULL,
                server_side_path TEXT NOT NULL,
                remote_side_path TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS automations (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS triggers (
                id INTEGER PRIMARY KEY,
                automation_id INTEGER NOT NULL,
                description TEXT NOT NULL,
                queue_name TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS actions (
                id INTEGER PRIMARY KEY,
                automation_id INTEGER NOT NULL,
                description TEXT NOT NULL,
                action_config_json TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS operation_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                operation_type TEXT NOT NULL,
                status TEXT NOT NULL,
                details TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );
            ",
        )
        .context("failed to create schema")?;
        Ok(ConfigStore { conn: Mutex::new(conn) })
    }

    pub fn get_peripherals(&self) -> Vec<Peripheral> {
        let conn = self.conn.lock().expect("config store mutex poisoned");
        let query = || -> rusqlite::Result<Vec<Peripheral>> {
            let mut stmt = conn.prepare(
                "SELECT id, name, interface, connection_params_json,
                        channel_to_virtual_index_json, server_side_path, remote_side_path
                 FROM peripherals",
            )?;
            let rows = stmt.query_map([], |row| {
                let id: i64 = row.get(0)?;
                let name: String = row.get(1)?;
                let interface: String = row.get(2)?;
                let connection_params_json: String = row.get(3)?;
                let channel_to_virtual_index_json: String = row.get(4)?;
                let server_side_path: String = row.get(5)?;
                let remote_side_path: String = row.get(6)?;
                Ok((
                    id,
                    name,
                    interface,
                    connection_params_json,
                    channel_to_virtual_index_json,
                    server_side_path,
                    remote_side_path,
                ))
            })?;
            let mut out = Vec::new();
            for row in rows.flatten() {
                let (id, name, interface, cp_json, ctv_json, server_side_path, remote_side_path) =
                    row;
                let connection_params = match serde_json::from_str(&cp_json) {
                    Ok(v) => v,
                    Err(e) => {
                        tracing::warn!(peripheral = %name, error = %e, "skipping peripheral with malformed connection_params");
                        continue;
                    }
                };
                let channel_to_virtual_index = match serde_json::from_str(&ctv_json) {
                    Ok(v) => v,
                    Err(e) => {
                        tracing::warn!(peripheral = %name, error = %e, "skipping peripheral with malformed channel map");
                        continue;
                    }
                };
                out.push(Peripheral {
                    id,
                    name,
                    interface,
                    connection_params,
                    channel_to_virtual_index,
                    server_side_path,
                    remote_side_path,
                });
            }
            Ok(out)
        };
        query().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "failed to load peripherals");
            Vec::new()
        })
    }

    pub fn get_automations(&self) -> Vec<Automation> {
        let conn = self.conn.lock().expect("config store mutex poisoned");
        let query = || -> rusqlite::Result<Vec<Automation>> {
            let mut stmt = conn.prepare("SELECT id, name FROM automations")?;
            let rows = stmt.query_map([], |row| {
                Ok(Automation { id: row.get(0)?, name: row.get(1)?, triggers: Vec::new(), actions: Vec::new() })
            })?;
            Ok(rows.flatten().collect())
        };
        let mut automations = query().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "failed to load automations");
            Vec::new()
        });
        for automation in &mut automations {
            automation.triggers = self.get_triggers(Some(automation.id));
            automation.actions = self.get_actions(Some(automation.id));
        }
        automations
    }

    pub fn get_triggers(&self, automation_id: Option<i64>) -> Vec<Trigger> {
        let conn = self.conn.lock().expect("config store mutex poisoned");
        let query = || -> rusqlite::Result<Vec<Trigger>> {
            let mut stmt = conn.prepare(
                "SELECT id, automation_id, description, queue_name FROM triggers
                 WHERE ?1 IS NULL OR automation_id = ?1",
            )?;
            let rows = stmt.query_map(params![automation_id], |row| {
                Ok(Trigger {
                    id: row.get(0)?,
                    automation_id: row.get(1)?,
                    description: row.get(2)?,
                    queue_name: row.get(3)?,
                })
            })?;
            Ok(rows.flatten().collect())
        };
        query().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "failed to load triggers");
            Vec::new()
        })
    }

    pub fn get_actions(&self, automation_id: Option<i64>) -> Vec<Action> {
        let conn = self.conn.lock().expect("config store mutex poisoned");
        let query = || -> rusqlite::Result<Vec<Action>> {
            let mut stmt = conn.prepare(
                "SELECT id, automation_id, description, action_config_json FROM actions
                 WHERE ?1 IS NULL OR automation_id = ?1",
            )?;
            let rows = stmt.query_map(params![automation_id], |row| {
                let id: i64 = row.get(0)?;
                let automation_id: i64 = row.get(1)?;
                let description: String = row.get(2)?;
                let action_config_json: String = row.get(3)?;
                Ok((id, automation_id, description, action_config_json))
            })?;
            let mut out = Vec::new();
            for row in rows.flatten() {
                let (id, automation_id, description, action_config_json) = row;
                let action_config = serde_json::from_str(&action_config_json)
                    .unwrap_or(serde_json::Value::Null);
                out.push(Action { id, automation_id, description, action_config });
            }
            Ok(out)
        };
        query().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "failed to load actions");
            Vec::new()
        })
    }

    pub fn get_peripheral_by_id(&self, id: i64) -> Option<Peripheral> {
        self.get_peripherals().into_iter().find(|p| p.id == id)
    }

    pub fn log_operation(&self, operation_type: &str, status: &str, details: &str) {
        let conn = self.conn.lock().expect("config store mutex poisoned");
        let result = conn.execute(
            "INSERT INTO operation_log (operation_type, status, details, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![operation_type, status, details, chrono::Utc::now().timestamp()],
        );
        if let Err(e) = result {
            tracing::warn!(error = %e, "failed to persist operation record");
        }
    }

    #[cfg(test)]
    pub fn recent_operations(&self, limit: i64) -> Vec<OperationRecord> {
        let conn = self.conn.lock().expect("config store mutex poisoned");
        let query = || -> rusqlite::Result<Vec<OperationRecord>> {
            let mut stmt = conn.prepare(
                "SELECT id, operation_type, status, details, created_at FROM operation_log
                 ORDER BY id DESC LIMIT ?1",
            )?;
            let rows = stmt.query_map(params![limit], |row| {
                Ok(OperationRecord {
                    id: row.get(0)?,
                    operation_type: row.get(1)?,
                    status: row.get(2)?,
                    details: row.get(3)?,
                    created_at: row.get(4)?,
                })
            })?;
            Ok(rows.flatten().collect())
        };
        query().unwrap_or_default()
    }

    #[cfg(test)]
    pub fn insert_peripheral_for_test(&self, p: &Peripheral) {
        let conn = self.conn.lock().expect("config store mutex poisoned");
        conn.execute(
            "INSERT OR REPLACE INTO peripherals
             (id, name, interface, connection_params_json, channel_to_virtual_index_json, server_side_path, remote_side_path)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                p.id,
                p.name,
                p.interface,
                serde_json::to_string(&p.connection_params).unwrap(),
                serde_json::to_string(&p.channel_to_virtual_index).unwrap(),
                p.server_side_path,
                p.remote_side_path,
            ],
        )
        .expect("insert peripheral");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ConnectionParams, Protocol};
    use std::collections::HashMap;

    fn sample_peripheral() -> Peripheral {
        let mut channel_to_virtual_index = HashMap::new();
        channel_to_virtual_index.insert("main_index".to_string(), "7".to_string());
        Peripheral {
            id: 1,
            name: "door".into(),
            interface: "eth0".into(),
            connection_params: ConnectionParams {
                host: "127.0.0.1".into(),
                port: 21,
                user: "anon".into(),
                password: String::new(),
                protocol: Protocol::Ftp,
                timeout: 30,
                passive: true,
                local_path: None,
            },
            channel_to_virtual_index,
            server_side_path: "/srv".into(),
            remote_side_path: "/".into(),
        }
    }

    #[test]
    fn round_trips_peripherals() {
        let store = ConfigStore::open(":memory:").expect("open");
        store.insert_peripheral_for_test(&sample_peripheral());
        let loaded = store.get_peripherals();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].virtual_index(), Some("7"));
    }

    #[test]
    fn log_operation_is_queryable() {
        let store = ConfigStore::open(":memory:").expect("open");
        store.log_operation("STREAM_FILE", "ok", "a.bin");
        let recent = store.recent_operations(10);
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].operation_type, "STREAM_FILE");
    }

    #[test]
    fn missing_automation_id_returns_empty_not_error() {
        let store = ConfigStore::open(":memory:").expect("open");
        assert!(store.get_triggers(Some(999)).is_empty());
    }
}
