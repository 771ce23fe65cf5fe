//! recovery/restore — redo-проход по WAL.
//!
//! Записи копятся по op_id от AtomicUnitStart до AtomicUnitEnd; при End операция
//! применяется целиком, незавершённые к концу журнала отбрасываются. Применение
//! идемпотентно: страница, чей LSN не меньше LSN записи, пропускается, поэтому
//! повторный прогон того же журнала ничего не меняет.
//!
//! Журнал закреплён cut-till лимитом на время прохода, кэш переведён в режим
//! восстановления (страницы не держат сегменты WAL).

use anyhow::Result;
use log::{debug, info, warn};
use std::collections::HashMap;

use super::RecoveryReport;
use crate::cache::PageCache;
use crate::error::StorageError;
use crate::lsn::Lsn;
use crate::page::PageChanges;
use crate::wal::{LoggedRecord, WalRecord, WriteAheadLog};

struct PendingUnit {
    records: Vec<LoggedRecord>,
}

struct Restorer<'a> {
    cache: &'a dyn PageCache,
    pending: HashMap<u64, PendingUnit>,
    report: RecoveryReport,
    report_interval: u64,
}

/// Проиграть журнал от begin() до конца. Пустой журнал — пустой отчёт.
pub fn restore_from_wal(
    wal: &WriteAheadLog,
    cache: &dyn PageCache,
    batch: usize,
    report_interval: u64,
) -> Result<RecoveryReport> {
    let Some(begin) = wal.begin() else {
        debug!("restore_from_wal: WAL is empty, nothing to restore");
        return Ok(RecoveryReport::default());
    };
    info!("restore_from_wal: data restore started from {}", begin);

    wal.add_cut_till_limit(begin);
    cache.restore_mode_on();
    let mut r = Restorer {
        cache,
        pending: HashMap::new(),
        report: RecoveryReport {
            started_at: Some(begin),
            ..Default::default()
        },
        report_interval,
    };
    let res = r.run(wal, begin, batch.max(1));
    cache.restore_mode_off();
    wal.remove_cut_till_limit(begin)?;
    res?;

    let mut report = r.report;
    for (op_id, unit) in r.pending.drain() {
        warn!(
            "restore_from_wal: atomic operation {} has no end record ({} records), discarded",
            op_id,
            unit.records.len()
        );
        report.units_discarded += 1;
    }
    info!("restore_from_wal: done, {}", report);
    Ok(report)
}

impl Restorer<'_> {
    fn run(&mut self, wal: &WriteAheadLog, begin: Lsn, batch: usize) -> Result<()> {
        let mut records = match self.fetch(wal.read(begin, batch))? {
            Some(r) => r,
            None => return Ok(()),
        };
        loop {
            let Some(last) = records.last().map(|r| r.lsn) else {
                return Ok(());
            };
            for rec in records {
                self.process(rec)?;
            }
            records = match self.fetch(wal.next(last, batch))? {
                Some(r) => r,
                None => return Ok(()),
            };
        }
    }

    /// Битая страница журнала останавливает чтение, но не восстановление.
    fn fetch(&mut self, res: Result<Vec<LoggedRecord>>) -> Result<Option<Vec<LoggedRecord>>> {
        match res {
            Ok(v) => Ok(Some(v)),
            Err(e) => match e.downcast_ref::<StorageError>() {
                Some(StorageError::WalPageBroken { lsn, reason }) => {
                    warn!(
                        "restore_from_wal: broken WAL page at {} ({}), stop reading",
                        lsn, reason
                    );
                    self.report.broken_at = Some(*lsn);
                    Ok(None)
                }
                _ => Err(e),
            },
        }
    }

    fn process(&mut self, rec: LoggedRecord) -> Result<()> {
        self.report.records_read += 1;
        self.report.last_lsn = Some(rec.lsn);
        if self.report_interval > 0 && self.report.records_read % self.report_interval == 0 {
            info!(
                "restore_from_wal: {} records processed, at {}",
                self.report.records_read, rec.lsn
            );
        }
        if let Some(op_id) = rec.record.op_id() {
            self.report.max_op_id = self.report.max_op_id.max(op_id);
        }

        match &rec.record {
            WalRecord::AtomicUnitStart { op_id, .. } => {
                let op_id = *op_id;
                if self.pending.contains_key(&op_id) {
                    warn!(
                        "restore_from_wal: duplicate start of atomic operation {} at {}",
                        op_id, rec.lsn
                    );
                }
                self.pending.insert(op_id, PendingUnit { records: Vec::new() });
            }
            WalRecord::AtomicUnitEnd { op_id, metadata } => {
                if let Some(m) = metadata {
                    self.report.last_metadata = Some(m.clone());
                }
                match self.pending.remove(op_id) {
                    Some(unit) => {
                        self.apply_unit(*op_id, unit)?;
                        self.report.units_applied += 1;
                    }
                    None => debug!(
                        "restore_from_wal: end of atomic operation {} without start at {}",
                        op_id, rec.lsn
                    ),
                }
            }
            WalRecord::UpdatePage { op_id, .. }
            | WalRecord::FileCreated { op_id, .. }
            | WalRecord::FileDeleted { op_id, .. }
            | WalRecord::HighLevelTransactionChange { op_id, .. } => {
                match self.pending.get_mut(op_id) {
                    Some(unit) => unit.records.push(rec),
                    None => {
                        warn!(
                            "restore_from_wal: {} record at {} belongs to unknown atomic operation {}, skipped",
                            rec.record.kind_name(),
                            rec.lsn,
                            op_id
                        );
                        self.report.orphan_records += 1;
                    }
                }
            }
            WalRecord::MetaData { bytes } => {
                self.report.last_metadata = Some(bytes.clone());
            }
            WalRecord::NonTxOperationPerformed => {
                self.report.non_tx_operations = true;
            }
            WalRecord::Empty => {}
        }
        Ok(())
    }

    fn apply_unit(&mut self, op_id: u64, unit: PendingUnit) -> Result<()> {
        debug!(
            "restore_from_wal: apply atomic operation {} ({} records)",
            op_id,
            unit.records.len()
        );
        for rec in unit.records {
            match rec.record {
                WalRecord::FileCreated { file_id, name, .. } => self.file_created(file_id, &name)?,
                WalRecord::FileDeleted { file_id, .. } => {
                    if self.cache.exists(file_id) {
                        self.cache.delete_file(file_id)?;
                        self.report.files_deleted += 1;
                    }
                }
                WalRecord::UpdatePage {
                    file_id,
                    page_index,
                    initial_lsn,
                    changes,
                    ..
                } => self.update_page(rec.lsn, file_id, page_index, initial_lsn, &changes)?,
                // высокоуровневые изменения на уровне страниц ничего не значат
                WalRecord::HighLevelTransactionChange { .. } => {}
                _ => {}
            }
        }
        Ok(())
    }

    fn file_created(&mut self, file_id: u64, name: &str) -> Result<()> {
        if self.cache.exists(file_id) {
            return Ok(());
        }
        if let Some(found) = self.cache.restore_file_by_id(file_id)? {
            debug!("restore_from_wal: file {} '{}' restored from disk", file_id, found);
        } else if self.cache.exists_by_name(name) {
            warn!(
                "restore_from_wal: file '{}' already registered under another id, {} skipped",
                name, file_id
            );
            return Ok(());
        } else {
            self.cache.add_file_with_id(name, file_id)?;
        }
        self.report.files_created += 1;
        Ok(())
    }

    fn update_page(
        &mut self,
        lsn: Lsn,
        file_id: u64,
        page_index: u64,
        initial_lsn: Lsn,
        changes: &PageChanges,
    ) -> Result<()> {
        if !self.cache.exists(file_id) && self.cache.restore_file_by_id(file_id)?.is_none() {
            warn!(
                "restore_from_wal: page {}:{} at {} refers to missing file, skipped",
                file_id, page_index, lsn
            );
            return Ok(());
        }

        let mut page = if page_index < self.cache.filled_up_to(file_id)? {
            self.cache.load_for_write(file_id, page_index)?
        } else {
            loop {
                let p = self.cache.allocate_new_page(file_id)?;
                if p.index() >= page_index {
                    break p;
                }
            }
        };

        if page.lsn() >= lsn {
            self.report.pages_skipped += 1;
            return Ok(());
        }
        if page.lsn() != initial_lsn {
            warn!(
                "restore_from_wal: page {}:{} has LSN {} but record at {} expects {}",
                file_id,
                page_index,
                page.lsn(),
                lsn,
                initial_lsn
            );
            self.report.lsn_mismatches += 1;
        }
        changes.apply(page.as_bytes_mut())?;
        page.set_lsn(lsn);
        self.cache.release_from_write(page, Lsn::ZERO)?;
        self.report.pages_applied += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::FilePageCache;
    use crate::metrics::StorageMetrics;
    use crate::page::Page;
    use std::path::PathBuf;
    use std::sync::Arc;

    fn unique_root(prefix: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "strata-{}-{}-{}",
            prefix,
            std::process::id(),
            rand::random::<u32>()
        ))
    }

    fn body_write(ps: usize, file_id: u64, idx: u64, byte: u8) -> PageChanges {
        let blank = Page::new(file_id, idx, ps);
        let mut p = blank.clone();
        p.set_u8(0, byte).unwrap();
        let (from, to) = p.body_range();
        PageChanges::diff(blank.as_bytes(), p.as_bytes(), from, to).unwrap()
    }

    #[test]
    fn completed_units_applied_open_ones_discarded() -> Result<()> {
        let root = unique_root("restore");
        std::fs::create_dir_all(&root)?;
        let ps = 4096;
        let metrics = Arc::new(StorageMetrics::new());
        let wal = Arc::new(WriteAheadLog::open(&root.join("wal"), 1 << 20, false, metrics)?);
        let cache = FilePageCache::open(&root, ps, false, 16, wal.clone())?;

        wal.log(&WalRecord::AtomicUnitStart { op_id: 1, metadata: None })?;
        wal.log(&WalRecord::FileCreated { op_id: 1, file_id: 7, name: "t.pcl".into() })?;
        wal.log(&WalRecord::UpdatePage {
            op_id: 1,
            file_id: 7,
            page_index: 2,
            initial_lsn: Lsn::ZERO,
            changes: body_write(ps, 7, 2, 0xAB),
        })?;
        wal.log(&WalRecord::AtomicUnitEnd { op_id: 1, metadata: Some(b"m1".to_vec()) })?;
        wal.log(&WalRecord::AtomicUnitStart { op_id: 2, metadata: None })?;
        wal.log(&WalRecord::UpdatePage {
            op_id: 2,
            file_id: 7,
            page_index: 0,
            initial_lsn: Lsn::ZERO,
            changes: body_write(ps, 7, 0, 0xCD),
        })?;
        wal.flush()?;

        let rep = restore_from_wal(&wal, &cache, 2, 0)?;
        assert_eq!(rep.units_applied, 1);
        assert_eq!(rep.units_discarded, 1);
        assert_eq!(rep.pages_applied, 1);
        assert_eq!(rep.max_op_id, 2);
        assert_eq!(rep.last_metadata.as_deref(), Some(&b"m1"[..]));
        assert_eq!(cache.filled_up_to(7)?, 3);
        assert_eq!(cache.load_for_read(7, 2)?.get_u8(0)?, 0xAB);
        assert_eq!(cache.load_for_read(7, 0)?.get_u8(0)?, 0);

        // повторный проход: страницы уже новее записей
        let again = restore_from_wal(&wal, &cache, 2, 0)?;
        assert_eq!(again.pages_applied, 0);
        assert_eq!(again.pages_skipped, 1);
        assert_eq!(cache.load_for_read(7, 2)?.get_u8(0)?, 0xAB);

        let _ = std::fs::remove_dir_all(&root);
        Ok(())
    }
}
