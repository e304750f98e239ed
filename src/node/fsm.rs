//! Replicated key-value state machine
//!
//! The table is `table -> row -> column -> value`, mutated only by committed
//! log entries delivered by the consensus engine. State is a pure function of
//! the applied log prefix: replaying the same entries into a fresh machine
//! yields the same tables and the same snapshot bytes.

use crate::common::{Error, Result};
use crate::engine::StateMachine;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};

/// Leading byte of every encoded [`LogEntry`]
pub const LOG_FORMAT_VERSION: u8 = 1;

/// Columns of a single row
pub type Row = BTreeMap<String, String>;

type Tables = BTreeMap<String, BTreeMap<String, Row>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Op {
    Set,
}

/// The replicated unit of change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub op: Op,
    pub table: String,
    pub row: String,
    pub column: String,
    pub value: String,
}

impl LogEntry {
    pub fn set(
        table: impl Into<String>,
        row: impl Into<String>,
        column: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self {
            op: Op::Set,
            table: table.into(),
            row: row.into(),
            column: column.into(),
            value: value.into(),
        }
    }

    /// Version byte followed by the bincode encoding of the entry.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = vec![LOG_FORMAT_VERSION];
        bincode::serialize_into(&mut buf, self)?;
        Ok(buf)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        match bytes.split_first() {
            Some((&LOG_FORMAT_VERSION, body)) => Ok(bincode::deserialize(body)?),
            Some((version, _)) => Err(Error::Codec(format!(
                "unsupported log format version {}",
                version
            ))),
            None => Err(Error::Codec("empty log entry".into())),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct Snapshot {
    last_applied: u64,
    tables: Tables,
}

/// Key-value replicated state machine
#[derive(Default)]
pub struct KvStateMachine {
    tables: RwLock<Tables>,
    last_applied: AtomicU64,
}

impl KvStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    fn upsert(&self, entry: LogEntry) {
        let mut tables = self.tables.write().unwrap_or_else(PoisonError::into_inner);
        tables
            .entry(entry.table)
            .or_default()
            .entry(entry.row)
            .or_default()
            .insert(entry.column, entry.value);
    }

    /// All columns of `table/row`, as of the last applied entry.
    pub fn get_by_row_key(&self, table: &str, row: &str) -> Option<Row> {
        self.tables
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(table)
            .and_then(|rows| rows.get(row))
            .cloned()
    }

    pub fn get_cell(&self, table: &str, row: &str, column: &str) -> Option<String> {
        self.tables
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(table)
            .and_then(|rows| rows.get(row))
            .and_then(|cols| cols.get(column))
            .cloned()
    }

    pub fn last_applied(&self) -> u64 {
        self.last_applied.load(Ordering::SeqCst)
    }

    /// Canonical encoding of the whole state.
    pub fn snapshot(&self) -> Result<Vec<u8>> {
        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        let snapshot = Snapshot {
            last_applied: self.last_applied(),
            tables: tables.clone(),
        };
        Ok(bincode::serialize(&snapshot)?)
    }

    /// Replace the state with a snapshot taken by [`KvStateMachine::snapshot`].
    pub fn restore(&self, bytes: &[u8]) -> Result<()> {
        let snapshot: Snapshot = bincode::deserialize(bytes)?;
        let mut tables = self.tables.write().unwrap_or_else(PoisonError::into_inner);
        *tables = snapshot.tables;
        self.last_applied.store(snapshot.last_applied, Ordering::SeqCst);
        Ok(())
    }
}

impl StateMachine for KvStateMachine {
    fn apply(&self, index: u64, data: &[u8]) -> Result<()> {
        let entry = LogEntry::decode(data).map_err(|e| {
            tracing::error!(index, error = %e, "committed entry does not decode");
            Error::FatalApply {
                index,
                reason: e.to_string(),
            }
        })?;
        match entry.op {
            Op::Set => self.upsert(entry),
        }
        self.last_applied.store(index, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries() -> Vec<LogEntry> {
        vec![
            LogEntry::set("users", "u1", "email", "a@x.com"),
            LogEntry::set("users", "u1", "name", "Ada"),
            LogEntry::set("users", "u2", "email", "b@x.com"),
            LogEntry::set("orders", "o1", "total", "42"),
            LogEntry::set("users", "u1", "email", "ada@x.com"),
            LogEntry::set("users:u1", "email", "x", "tricky:separator"),
        ]
    }

    fn replay(entries: &[LogEntry]) -> KvStateMachine {
        let fsm = KvStateMachine::new();
        for (i, entry) in entries.iter().enumerate() {
            fsm.apply(i as u64 + 1, &entry.encode().unwrap()).unwrap();
        }
        fsm
    }

    #[test]
    fn test_apply_then_read() {
        let fsm = KvStateMachine::new();
        let entry = LogEntry::set("users", "u1", "email", "a@x.com");
        fsm.apply(1, &entry.encode().unwrap()).unwrap();

        let row = fsm.get_by_row_key("users", "u1").unwrap();
        assert_eq!(row.get("email").map(String::as_str), Some("a@x.com"));
        assert_eq!(fsm.get_cell("users", "u1", "email").as_deref(), Some("a@x.com"));
        assert_eq!(fsm.last_applied(), 1);
    }

    #[test]
    fn test_missing_row_is_none() {
        let fsm = replay(&entries());
        assert!(fsm.get_by_row_key("users", "u9").is_none());
        assert!(fsm.get_by_row_key("nope", "u1").is_none());
        assert!(fsm.get_cell("users", "u1", "phone").is_none());
    }

    #[test]
    fn test_replay_is_deterministic() {
        let log = entries();
        let first = replay(&log);
        let second = replay(&log);
        assert_eq!(first.snapshot().unwrap(), second.snapshot().unwrap());
        assert_eq!(
            first.get_by_row_key("users", "u1").unwrap().get("email").unwrap(),
            "ada@x.com"
        );

        // a prefix replays to a different but equally deterministic state
        let prefix = replay(&log[..3]);
        assert_ne!(prefix.snapshot().unwrap(), first.snapshot().unwrap());
        assert_eq!(prefix.snapshot().unwrap(), replay(&log[..3]).snapshot().unwrap());
    }

    #[test]
    fn test_separator_characters_do_not_collide() {
        let fsm = replay(&entries());
        assert_eq!(
            fsm.get_cell("users:u1", "email", "x").as_deref(),
            Some("tricky:separator")
        );
        assert!(fsm.get_cell("users", "u1", "email:x").is_none());
    }

    #[test]
    fn test_snapshot_restore() {
        let source = replay(&entries());
        let target = KvStateMachine::new();
        target.restore(&source.snapshot().unwrap()).unwrap();
        assert_eq!(target.snapshot().unwrap(), source.snapshot().unwrap());
        assert_eq!(target.last_applied(), 6);
    }

    #[test]
    fn test_undecodable_entry_is_fatal() {
        let fsm = KvStateMachine::new();
        let mut bytes = LogEntry::set("t", "r", "c", "v").encode().unwrap();
        bytes[0] = 9;
        let err = fsm.apply(1, &bytes).unwrap_err();
        assert!(matches!(err, Error::FatalApply { index: 1, .. }));
        assert!(matches!(fsm.apply(2, &[]), Err(Error::FatalApply { .. })));
        assert_eq!(fsm.last_applied(), 0);
    }

    #[test]
    fn test_encoding_is_stable() {
        let entry = LogEntry::set("users", "u1", "email", "a@x.com");
        assert_eq!(entry.encode().unwrap(), entry.clone().encode().unwrap());
        assert_eq!(LogEntry::decode(&entry.encode().unwrap()).unwrap(), entry);
    }
}
