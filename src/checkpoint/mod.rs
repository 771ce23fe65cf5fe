//! checkpoint — точки сохранения и очистка WAL.
//!
//! - fuzzy.rs  — нечёткий чекпоинт: сбросить страницы, которые держат старые
//!   сегменты, и отрезать журнал ниже безопасной границы.
//! - full.rs   — полный чекпоинт: маркер в свежем сегменте, сброс всего кэша,
//!   усечение журнала до маркера, снятие dirty-флага.
//! - vacuum.rs — фоновый поток, гоняющий нечёткие чекпоинты по запросу журнала.
//!
//! Checkpointer держит Arc'и подсистем, чтобы фоновый поток мог владеть им сам.

pub mod full;
pub mod fuzzy;
pub mod vacuum;

use std::sync::{Arc, Mutex};
use std::time::Duration;

pub use fuzzy::FuzzyOutcome;
pub use vacuum::{VacuumHandle, WalVacuum};

use crate::atomic::AtomicOperationsManager;
use crate::cache::PageCache;
use crate::error::ErrorState;
use crate::meta::DirtyFlag;
use crate::metrics::StorageMetrics;
use crate::storage::StateLock;
use crate::wal::WriteAheadLog;

pub struct Checkpointer {
    wal: Arc<WriteAheadLog>,
    cache: Arc<dyn PageCache>,
    atomic: Arc<AtomicOperationsManager>,
    state: Arc<StateLock>,
    dirty: Arc<DirtyFlag>,
    errors: Arc<ErrorState>,
    metrics: Arc<StorageMetrics>,
    last_metadata: Mutex<Option<Vec<u8>>>,
    state_lock_poll: Duration,
    vacuum_max_rounds: u32,
}

impl Checkpointer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        wal: Arc<WriteAheadLog>,
        cache: Arc<dyn PageCache>,
        atomic: Arc<AtomicOperationsManager>,
        state: Arc<StateLock>,
        dirty: Arc<DirtyFlag>,
        errors: Arc<ErrorState>,
        metrics: Arc<StorageMetrics>,
        state_lock_poll: Duration,
        vacuum_max_rounds: u32,
    ) -> Self {
        Self {
            wal,
            cache,
            atomic,
            state,
            dirty,
            errors,
            metrics,
            last_metadata: Mutex::new(None),
            state_lock_poll,
            vacuum_max_rounds: vacuum_max_rounds.max(1),
        }
    }

    /// Метаданные последней закоммиченной операции, которая их несла.
    pub fn last_metadata(&self) -> Option<Vec<u8>> {
        self.last_metadata.lock().unwrap().clone()
    }

    pub fn set_last_metadata(&self, metadata: Option<Vec<u8>>) {
        if metadata.is_some() {
            *self.last_metadata.lock().unwrap() = metadata;
        }
    }

    pub(crate) fn errors(&self) -> &ErrorState {
        &self.errors
    }

    pub(crate) fn vacuum_max_rounds(&self) -> u32 {
        self.vacuum_max_rounds
    }
}
