// tests/crash_recovery.rs
//
// Падение процесса имитируется StorageEngine::crash(): грязные страницы кэша
// теряются, журнал и dirty-флаг остаются. Открытие обязано восстановить ровно
// закоммиченные операции и отбросить незавершённые.

use anyhow::Result;
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use StrataDB::consts::{PAGE_HDR_SIZE, PAGE_TRAILER_SIZE, WAL_REC_HDR_SIZE};
use StrataDB::page::PageChanges;
use StrataDB::storage::StorageRegistry;
use StrataDB::wal::reader::scan_segments;
use StrataDB::wal::{segment_path, wal_dir};
use StrataDB::{Lsn, Rid, StorageEngine, StrataConfig, Transaction, WalRecord};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn unique_root(prefix: &str) -> PathBuf {
    let pid = std::process::id();
    let t = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!("stratatest-crash-{prefix}-{pid}-{t}-{id}"))
}

fn cfg() -> StrataConfig {
    StrataConfig::default()
        .with_page_size(4096)
        .with_wal_fsync(false)
        .with_data_fsync(false)
}

#[test]
fn committed_transactions_survive_crash() -> Result<()> {
    let root = unique_root("committed");
    let mut rng = oorandom::Rand32::new(0x5eed_1234);
    let mut model: BTreeMap<Rid, (Vec<u8>, i32)> = BTreeMap::new();

    let cluster = {
        let engine = StorageEngine::create(&root, cfg())?;
        let c = engine.add_cluster("docs")?;
        // первая запись сбрасывается полным чекпоинтом, остальное живёт только в WAL
        let (rid, v) = engine.create_record(c, b"base", -1, b'd')?;
        model.insert(rid, (b"base".to_vec(), v));
        engine.synch()?;

        for round in 0..120u32 {
            let mut tx = Transaction::new(round as u64);
            let live: Vec<Rid> = model.keys().copied().collect();
            let choice = rng.rand_range(0..10);
            if choice < 5 || live.is_empty() {
                let len = rng.rand_range(1..700) as usize;
                let body = vec![(round % 251) as u8; len];
                tx.create(c, body, b'd');
            } else if choice < 8 {
                let rid = live[rng.rand_range(0..live.len() as u32) as usize];
                let body = format!("updated-{}", round).into_bytes();
                tx.update(rid, body, model[&rid].1, b'd');
            } else {
                let rid = live[rng.rand_range(0..live.len() as u32) as usize];
                tx.delete(rid, model[&rid].1);
            }
            for op in engine.commit(tx)? {
                match op.kind {
                    StrataDB::RecordOperationKind::Deleted => {
                        model.remove(&op.record.rid);
                    }
                    _ => {
                        model.insert(op.record.rid, (op.record.content, op.record.version));
                    }
                }
            }
        }
        engine.crash();
        c
    };

    let engine = StorageEngine::open(&root, cfg())?;
    let report = engine.last_recovery_report().cloned().expect("recovery must run");
    assert!(report.units_applied > 0, "{}", report);
    assert_eq!(report.units_discarded, 0);
    assert!(report.broken_at.is_none());
    assert!(engine.were_data_restored_after_open());

    assert_eq!(engine.count_records(cluster)? as usize, model.len());
    for (rid, (content, version)) in &model {
        let rec = engine.read_record(*rid)?;
        assert_eq!(&rec.content, content, "content of {}", rid);
        assert_eq!(rec.version, *version, "version of {}", rid);
    }
    assert!(engine.check(false, &mut |_: &str| {})?);
    engine.close()?;

    // после восстановления и чистого закрытия повторного восстановления нет
    let engine = StorageEngine::open(&root, cfg())?;
    assert!(engine.last_recovery_report().is_none());
    assert_eq!(engine.count_records(cluster)? as usize, model.len());
    engine.close()?;

    fs::remove_dir_all(&root).ok();
    Ok(())
}

#[test]
fn unit_without_end_is_discarded() -> Result<()> {
    let root = unique_root("no-end");
    let engine = StorageEngine::create(&root, cfg())?;
    let c = engine.add_cluster("docs")?;
    let (rid, _) = engine.create_record(c, b"intact", -1, b'd')?;
    engine.synch()?;

    let reg = StorageRegistry::load(&root)?;
    let data_file = reg.clusters[0].data_file;

    // операция начата, страница изменена, до AtomicUnitEnd не дошло
    let page_size = engine.page_size();
    let garbage = vec![0xEE; page_size];
    let wal = engine.wal();
    wal.log(&WalRecord::AtomicUnitStart {
        op_id: 9_000,
        metadata: None,
    })?;
    for page_index in 0..2 {
        wal.log(&WalRecord::UpdatePage {
            op_id: 9_000,
            file_id: data_file,
            page_index,
            initial_lsn: Lsn::ZERO,
            changes: PageChanges::full(&garbage, PAGE_HDR_SIZE, page_size - PAGE_TRAILER_SIZE),
        })?;
    }
    wal.flush()?;
    engine.crash();

    let engine = StorageEngine::open(&root, cfg())?;
    let report = engine.last_recovery_report().cloned().expect("recovery must run");
    assert_eq!(report.units_discarded, 1, "{}", report);
    assert_eq!(report.pages_applied, 0);
    assert!(!engine.were_data_restored_after_open());
    assert_eq!(engine.read_record(rid)?.content, b"intact");

    // новые операции не пересекаются по id с операциями из журнала
    let (rid2, _) = engine.create_record(c, b"after", -1, b'd')?;
    assert_eq!(engine.read_record(rid2)?.content, b"after");
    engine.close()?;

    fs::remove_dir_all(&root).ok();
    Ok(())
}

#[test]
fn ddl_and_non_tx_flag_survive_crash() -> Result<()> {
    let root = unique_root("ddl");
    {
        let engine = StorageEngine::create(&root, cfg())?;
        let c = engine.add_cluster("events")?;
        engine.add_index_engine("by_key", true)?;
        let mut tx = Transaction::new(1);
        let r = tx.create(c, b"e1".to_vec(), b'e');
        tx.index_put("by_key", b"k1", r);
        tx.set_metadata(Some(b"commit-1".to_vec()));
        engine.commit(tx)?;
        engine.log_non_tx_operation()?;
        engine.crash();
    }
    {
        let engine = StorageEngine::open(&root, cfg())?;
        assert!(engine.were_non_tx_operations_performed_in_previous_open());
        assert_eq!(engine.last_metadata(), Some(b"commit-1".to_vec()));
        let c = engine.cluster_id_by_name("events").expect("cluster restored");
        let hits = engine.index_get("by_key", b"k1")?;
        assert_eq!(hits, vec![Rid::new(c, 0)]);
        assert_eq!(engine.read_record(hits[0])?.content, b"e1");
        engine.close()?;
    }
    {
        // флаг относится только к предыдущему открытию
        let engine = StorageEngine::open(&root, cfg())?;
        assert!(!engine.were_non_tx_operations_performed_in_previous_open());
        engine.close()?;
    }
    fs::remove_dir_all(&root).ok();
    Ok(())
}

#[test]
fn broken_wal_page_is_reported_and_later_commits_survive() -> Result<()> {
    let root = unique_root("broken-wal");
    let (c, rid_a) = {
        let engine = StorageEngine::create(&root, cfg())?;
        let c = engine.add_cluster("docs")?;
        engine.synch()?;
        let (rid, _) = engine.create_record(c, b"A", -1, b'd')?;
        engine.crash();
        (c, rid)
    };

    // портим payload AtomicUnitStart последней операции
    let mut starts = Vec::new();
    scan_segments(&wal_dir(&root), |r| {
        if matches!(r.record, WalRecord::AtomicUnitStart { .. }) {
            starts.push(r.lsn);
        }
        Ok(())
    })?;
    let victim = *starts.last().expect("unit of record A is logged");
    {
        let mut f = OpenOptions::new()
            .read(true)
            .write(true)
            .open(segment_path(&wal_dir(&root), victim.segment))?;
        let at = victim.position + WAL_REC_HDR_SIZE as u64 + 2;
        let mut b = [0u8; 1];
        f.seek(SeekFrom::Start(at))?;
        f.read_exact(&mut b)?;
        f.seek(SeekFrom::Start(at))?;
        f.write_all(&[b[0] ^ 0xFF])?;
        f.sync_all()?;
    }

    let rid_b = {
        let engine = StorageEngine::open(&root, cfg())?;
        let report = engine.last_recovery_report().cloned().expect("recovery must run");
        assert_eq!(report.broken_at, Some(victim), "{}", report);
        assert_eq!(report.units_applied, 0);
        assert!(!engine.record_exists(rid_a)?);
        // битый сегмент отрезан полным чекпоинтом открытия
        assert!(engine.wal().segments().iter().all(|s| *s > victim.segment));

        let (rid, v) = engine.create_record(c, b"B", -1, b'd')?;
        assert_eq!(v, 1);
        engine.crash();
        rid
    };

    let engine = StorageEngine::open(&root, cfg())?;
    let report = engine.last_recovery_report().cloned().expect("recovery must run");
    assert_eq!(report.broken_at, None, "{}", report);
    assert_eq!(report.units_applied, 1);
    assert_eq!(engine.read_record(rid_b)?.content, b"B");
    assert!(engine.check(false, &mut |_: &str| {})?);
    engine.close()?;

    fs::remove_dir_all(&root).ok();
    Ok(())
}
