//! Полный чекпоинт.
//!
//! Порядок:
//! 0) вход новым атомарным операциям закрыт до конца чекпоинта; идущие или
//!    закоммиченные, но не переданные кэшу операции — сразу InvalidState;
//! 1) flush WAL, новый сегмент;
//! 2) маркер: MetaData(последние метаданные) либо Empty;
//! 3) сброс всех грязных страниц кэша и fsync файлов данных вместе с метаданными;
//! 4) в таблице операций не должно остаться незавершённых (иначе InvalidState);
//! 5) flush WAL, усечение журнала до маркера;
//! 6) снятие dirty-флага: следующее открытие не требует восстановления.
//!
//! Операция с записями до маркера не должна передать страницы кэшу после шага 3.

use anyhow::Result;
use log::debug;

use super::Checkpointer;
use crate::error::StorageError;
use crate::lsn::Lsn;
use crate::wal::WalRecord;

impl Checkpointer {
    pub fn flush_all_data(&self) -> Result<Lsn> {
        let token = self.atomic.hold_atomic_operations();
        let res = self.flush_all_data_held();
        self.atomic.release_atomic_operations(token)?;
        res
    }

    fn ensure_quiescent(&self) -> Result<()> {
        let table = self.atomic.table();
        table.compact_table();
        let busy = table
            .not_persisted_count()
            .max(self.atomic.active_operations());
        if busy > 0 {
            return Err(StorageError::InvalidState(format!(
                "full checkpoint: {} atomic operations are still in progress",
                busy
            ))
            .into());
        }
        Ok(())
    }

    fn flush_all_data_held(&self) -> Result<Lsn> {
        self.ensure_quiescent()?;

        self.wal.flush()?;
        self.wal.append_new_segment()?;
        let last = self.last_metadata();
        let marker = match &last {
            Some(bytes) => self.wal.log(&WalRecord::MetaData {
                bytes: bytes.clone(),
            })?,
            None => self.wal.log(&WalRecord::Empty)?,
        };

        self.cache.flush()?;
        // fsync файлов данных + метаданные в реестр файлов кэша
        self.cache.sync_data_files(u64::MAX, last.as_deref())?;

        self.ensure_quiescent()?;

        self.wal.flush()?;
        self.wal.cut_till(marker)?;
        self.dirty.clear()?;
        self.metrics.record_full_checkpoint();
        debug!("flush_all_data: full checkpoint at {}", marker);
        Ok(marker)
    }
}
