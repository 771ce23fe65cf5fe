//! Итог восстановления из WAL.

use serde::Serialize;
use std::fmt;

use crate::lsn::Lsn;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    /// LSN, с которого начато чтение (None — журнал пуст).
    pub started_at: Option<Lsn>,
    /// LSN последней прочитанной записи.
    pub last_lsn: Option<Lsn>,
    pub records_read: u64,
    pub units_applied: u64,
    /// Операции без AtomicUnitEnd к концу журнала.
    pub units_discarded: u64,
    /// Записи операций, чей AtomicUnitStart уже отрезан.
    pub orphan_records: u64,
    pub pages_applied: u64,
    /// Страница уже новее записи (LSN страницы >= LSN записи).
    pub pages_skipped: u64,
    /// initial_lsn записи не совпал с LSN страницы.
    pub lsn_mismatches: u64,
    pub files_created: u64,
    pub files_deleted: u64,
    pub max_op_id: u64,
    pub non_tx_operations: bool,
    /// Где чтение остановилось на битой странице журнала.
    pub broken_at: Option<Lsn>,
    #[serde(skip)]
    pub last_metadata: Option<Vec<u8>>,
}

impl RecoveryReport {
    pub fn applied_anything(&self) -> bool {
        self.units_applied > 0
            || self.pages_applied > 0
            || self.files_created > 0
            || self.files_deleted > 0
    }
}

impl fmt::Display for RecoveryReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "records={} units_applied={} units_discarded={} orphans={} pages_applied={} pages_skipped={} lsn_mismatches={}",
            self.records_read,
            self.units_applied,
            self.units_discarded,
            self.orphan_records,
            self.pages_applied,
            self.pages_skipped,
            self.lsn_mismatches
        )?;
        if let Some(b) = self.broken_at {
            write!(f, " broken_at={}", b)?;
        }
        Ok(())
    }
}
