//! Нечёткий чекпоинт.
//!
//! Граница операций = min(сегмент самой ранней незавершённой или неперсистентной
//! операции, активный сегмент). Страницы, испачканные операциями из сегментов
//! ниже границы, сбрасываются; после этого журнал режется ниже
//! min(самый ранний несброшенный сегмент кэша, граница операций).
//! Журнал никогда не теряет сегмент, чьи изменения ещё не лежат в файлах данных
//! или принадлежат операции в полёте.

use anyhow::Result;
use log::debug;

use super::Checkpointer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FuzzyOutcome {
    /// Блокировка состояния не получена за отведённое время.
    Skipped,
    /// Журнал пуст или граница не выше начала журнала.
    NothingToDo { watermark: u64 },
    /// Сегменты ниже watermark больше не нужны; cut — было ли что удалять.
    Advanced { watermark: u64, cut: bool },
}

impl FuzzyOutcome {
    pub fn watermark(&self) -> Option<u64> {
        match self {
            FuzzyOutcome::Skipped => None,
            FuzzyOutcome::NothingToDo { watermark } | FuzzyOutcome::Advanced { watermark, .. } => {
                Some(*watermark)
            }
        }
    }
}

impl Checkpointer {
    pub fn make_fuzzy_checkpoint(&self) -> Result<FuzzyOutcome> {
        let Some(_state) = self.state.try_read_for(self.state_lock_poll) else {
            debug!("make_fuzzy_checkpoint: state lock is busy, skipped");
            return Ok(FuzzyOutcome::Skipped);
        };
        let active = self.wal.active_segment();
        let Some(begin) = self.wal.begin() else {
            return Ok(FuzzyOutcome::NothingToDo { watermark: active });
        };

        let table = self.atomic.table();
        table.compact_table();
        let mut op_bound = active;
        if let Some(s) = table.segment_earliest_operation_in_progress() {
            op_bound = op_bound.min(s);
        }
        if let Some(s) = table.segment_earliest_not_persisted_operation() {
            op_bound = op_bound.min(s);
        }

        let metadata = self.last_metadata();
        if op_bound > begin.segment {
            self.cache.sync_data_files(op_bound, metadata.as_deref())?;
        }

        let watermark = self
            .cache
            .min_not_flushed_segment()
            .unwrap_or(active)
            .min(op_bound);
        self.metrics.record_fuzzy_checkpoint();
        if watermark <= begin.segment {
            debug!(
                "make_fuzzy_checkpoint: watermark {} does not pass WAL begin {}",
                watermark, begin.segment
            );
            return Ok(FuzzyOutcome::NothingToDo { watermark });
        }

        let cut = self.wal.cut_all_segments_smaller_than(watermark)?;
        debug!(
            "make_fuzzy_checkpoint: watermark={} begin={} cut={}",
            watermark, begin.segment, cut
        );
        Ok(FuzzyOutcome::Advanced { watermark, cut })
    }

    /// Сбросить страницы, удерживающие сегменты ниже `segment`.
    pub fn sync_up_to(&self, segment: u64) -> Result<()> {
        let metadata = self.last_metadata();
        self.cache.sync_data_files(segment, metadata.as_deref())
    }
}
