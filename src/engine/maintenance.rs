//! engine/maintenance — чекпоинты, проверка целостности, заморозка.

use anyhow::Result;
use log::{error, info, warn};

use super::StorageEngine;
use crate::cache::{BrokenPage, PageCache};
use crate::checkpoint::{vacuum, FuzzyOutcome};
use crate::error::StorageResult;
use crate::lsn::Lsn;
use crate::meta::set_non_tx_operations;

impl StorageEngine {
    /// Попросить фоновый vacuum прогнать нечёткие чекпоинты.
    pub fn request_checkpoint(&self) {
        if let Some(v) = self.vacuum.lock().unwrap().as_ref() {
            v.handle().request();
        }
    }

    /// Нечёткий чекпоинт в вызывающем потоке.
    pub fn make_fuzzy_checkpoint(&self) -> StorageResult<FuzzyOutcome> {
        self.guard("make_fuzzy_checkpoint", || self.checkpointer.make_fuzzy_checkpoint())
    }

    /// Один прогон очистки WAL в вызывающем потоке (как у фонового vacuum).
    pub fn vacuum_wal(&self) -> StorageResult<Option<u64>> {
        self.guard("vacuum_wal", || vacuum::run_rounds(&self.checkpointer))
    }

    /// Полный чекпоинт без заморозки: операция в полёте — InvalidState.
    pub fn flush_all_data(&self) -> StorageResult<Lsn> {
        self.guard("flush_all_data", || {
            let _state = self.state.read();
            self.checkpointer.flush_all_data()
        })
    }

    /// Дождаться завершения операций в полёте и сделать полный чекпоинт.
    pub fn synch(&self) -> StorageResult<()> {
        self.guard("synch", || {
            let _state = self.state.read();
            let token = self.atomic.freeze_atomic_operations(None);
            let res = self.checkpointer.flush_all_data();
            self.atomic.release_atomic_operations(token)?;
            res.map(|lsn| info!("synch: storage {} synced at {}", self.root.display(), lsn))
        })
    }

    /// Заморозить хранилище (например, для резервной копии): дождаться операций
    /// в полёте, сбросить всё на диск. `throw` — новые операции сразу получают
    /// ModificationProhibited, иначе ждут release().
    pub fn freeze(&self, throw: bool) -> StorageResult<()> {
        self.guard("freeze", || {
            let _state = self.state.read();
            let msg = throw.then(|| format!("storage {} is frozen", self.root.display()));
            let token = self.atomic.freeze_atomic_operations(msg);
            if let Err(e) = self.checkpointer.flush_all_data() {
                self.atomic.release_atomic_operations(token)?;
                return Err(e);
            }
            self.freeze_tokens.lock().unwrap().push(token);
            info!("freeze: storage {} frozen (throw={})", self.root.display(), throw);
            Ok(())
        })
    }

    /// Снять последнюю заморозку.
    pub fn release(&self) -> StorageResult<()> {
        self.guard("release", || {
            let token = self.freeze_tokens.lock().unwrap().pop();
            match token {
                Some(t) => {
                    self.atomic.release_atomic_operations(t)?;
                    info!("release: storage {} released", self.root.display());
                }
                None => warn!("release: storage {} is not frozen", self.root.display()),
            }
            Ok(())
        })
    }

    /// Отметить изменение в обход атомарных операций: WAL-запись + флаг в meta.
    pub fn log_non_tx_operation(&self) -> StorageResult<Lsn> {
        self.guard("log_non_tx_operation", || {
            set_non_tx_operations(&self.root, true)?;
            self.atomic.log_non_tx_operation()
        })
    }

    /// Уведомление о битой странице: лог + учёт для check().
    pub fn page_is_broken(&self, file_name: &str, page_index: u64) {
        error!(
            "page {} of file '{}' in storage {} is broken",
            page_index,
            file_name,
            self.root.display()
        );
        let file_id = self.cache.file_id_by_name(file_name).unwrap_or(0);
        let mut broken = self.broken_pages.lock().unwrap();
        if !broken
            .iter()
            .any(|b| b.file_name == file_name && b.page_index == page_index)
        {
            broken.push(BrokenPage {
                file_id,
                file_name: file_name.to_string(),
                page_index,
                reason: "reported broken".into(),
            });
        }
    }

    pub fn broken_pages(&self) -> Vec<BrokenPage> {
        self.broken_pages.lock().unwrap().clone()
    }

    /// Проверка целостности: CRC всех страниц на диске, заголовки кластеров
    /// и индексов, читаемость каждой записи. true — всё цело.
    pub fn check(&self, verbose: bool, listener: &mut dyn FnMut(&str)) -> StorageResult<bool> {
        self.guard("check", || {
            let _state = self.state.read();
            let token = self.atomic.freeze_atomic_operations(None);
            let res = self.check_frozen(verbose, listener);
            self.atomic.release_atomic_operations(token)?;
            res
        })
    }

    fn check_frozen(&self, verbose: bool, listener: &mut dyn FnMut(&str)) -> Result<bool> {
        // на диске должно лежать всё закоммиченное
        self.cache.flush()?;
        listener(&format!("check of storage {} started", self.root.display()));

        let broken = self.cache.check_stored_pages(listener)?;
        for b in &broken {
            self.page_is_broken(&b.file_name, b.page_index);
        }
        let mut ok = broken.is_empty();

        let comps = self.read_components()?;
        let src = self.reader();
        for c in comps.clusters.values() {
            if let Err(e) = c.verify(&src) {
                listener(&format!("cluster '{}': {:#}", c.name(), e));
                ok = false;
                continue;
            }
            let positions = match c.positions(&src) {
                Ok(p) => p,
                Err(e) => {
                    listener(&format!("cluster '{}': position map: {:#}", c.name(), e));
                    ok = false;
                    continue;
                }
            };
            let mut bad = 0usize;
            for pos in &positions {
                if let Err(e) = c.read_record(&src, *pos) {
                    listener(&format!("cluster '{}': record #{}:{}: {:#}", c.name(), c.id(), pos, e));
                    bad += 1;
                }
            }
            ok &= bad == 0;
            if verbose {
                listener(&format!(
                    "cluster '{}' #{}: {} records, {} unreadable",
                    c.name(),
                    c.id(),
                    positions.len(),
                    bad
                ));
            }
        }
        for idx in comps.indexes.values() {
            match idx.size(&src) {
                Ok(n) if verbose => listener(&format!("index '{}': {} entries", idx.name(), n)),
                Ok(_) => {}
                Err(e) => {
                    listener(&format!("index '{}': {:#}", idx.name(), e));
                    ok = false;
                }
            }
        }
        listener(&format!(
            "check of storage {} finished: {}",
            self.root.display(),
            if ok { "ok" } else { "errors found" }
        ));
        Ok(ok)
    }
}
