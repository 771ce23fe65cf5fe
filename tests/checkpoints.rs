// tests/checkpoints.rs
//
// Нечёткие и полные чекпоинты, очистка WAL, заморозка.
// Главное свойство: пока операция в полёте, сегмент её начала не удаляется.

use anyhow::Result;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use StrataDB::atomic::OperationContext;
use StrataDB::{StorageEngine, StorageError, StrataConfig};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn unique_root(prefix: &str) -> PathBuf {
    let pid = std::process::id();
    let t = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!("stratatest-checkpoint-{prefix}-{pid}-{t}-{id}"))
}

fn cfg() -> StrataConfig {
    StrataConfig::default()
        .with_page_size(4096)
        .with_wal_segment_size(4096)
        .with_wal_fsync(false)
        .with_data_fsync(false)
}

fn fill(engine: &StorageEngine, cluster: i32, n: usize) -> Result<()> {
    for i in 0..n {
        let body = vec![(i % 200) as u8 + 1; 300];
        engine.create_record(cluster, &body, -1, b'd')?;
    }
    Ok(())
}

#[test]
fn long_running_operation_pins_its_segment() -> Result<()> {
    let root = unique_root("pin");
    let engine = StorageEngine::create(&root, cfg())?;
    let c = engine.add_cluster("docs")?;
    fill(&engine, c, 30)?;

    // операция начата и висит
    let mut ctx = OperationContext::new();
    let op = engine.atomic_manager().start_atomic_operation(&mut ctx, None)?;
    let pinned = op.start_segment();

    fill(&engine, c, 60)?;
    assert!(engine.wal().active_segment() > pinned + 1);

    engine.make_fuzzy_checkpoint()?;
    engine.vacuum_wal()?;
    let first = engine.wal().segments()[0];
    assert!(
        first <= pinned,
        "segment {} of an in-flight operation was cut (first = {})",
        pinned,
        first
    );
    assert!(engine.wal().begin().map_or(false, |b| b.segment <= pinned));

    engine.atomic_manager().end_atomic_operation(&mut ctx, op, None)?;

    // операция завершена: журнал сворачивается до активного сегмента
    engine.vacuum_wal()?;
    assert_eq!(engine.wal().segments(), vec![engine.wal().active_segment()]);
    let m = engine.metrics_snapshot();
    assert!(m.fuzzy_checkpoints >= 2);
    assert!(m.wal_segments_cut > 0);

    // данные после усечения журнала на месте
    engine.crash();
    let engine = StorageEngine::open(&root, cfg())?;
    assert_eq!(engine.count_records(c)?, 90);
    engine.close()?;
    fs::remove_dir_all(&root).ok();
    Ok(())
}

#[test]
fn full_checkpoint_refuses_in_flight_operation() -> Result<()> {
    let root = unique_root("refuse");
    let engine = StorageEngine::create(&root, cfg())?;
    let c = engine.add_cluster("docs")?;
    fill(&engine, c, 3)?;

    let mut ctx = OperationContext::new();
    let op = engine.atomic_manager().start_atomic_operation(&mut ctx, None)?;
    let err = engine.flush_all_data().unwrap_err();
    assert!(matches!(err, StorageError::InvalidState(_)), "{:?}", err);
    assert!(matches!(
        engine.check_error_state(),
        Err(StorageError::InError(_))
    ));
    assert!(matches!(engine.synch(), Err(StorageError::InError(_))));
    engine.atomic_manager().end_atomic_operation(&mut ctx, op, None)?;
    drop(engine);

    // отравленное хранилище закрывается без чекпоинта и восстанавливается
    let engine = StorageEngine::open(&root, cfg())?;
    assert!(engine.last_recovery_report().is_some());
    assert_eq!(engine.count_records(c)?, 3);
    engine.close()?;
    fs::remove_dir_all(&root).ok();
    Ok(())
}

#[test]
fn full_checkpoint_leaves_clean_storage() -> Result<()> {
    let root = unique_root("full");
    let engine = StorageEngine::create(&root, cfg())?;
    let c = engine.add_cluster("docs")?;
    fill(&engine, c, 40)?;
    let before = engine.wal().segments().len();
    assert!(before > 1);

    let marker = engine.flush_all_data()?;
    assert_eq!(engine.wal().segments(), vec![marker.segment]);
    assert_eq!(engine.wal().begin(), Some(marker));
    assert_eq!(engine.metrics_snapshot().full_checkpoints, 1);

    // всё уже на диске: падение после чекпоинта восстанавливать нечего
    engine.crash();
    let engine = StorageEngine::open(&root, cfg())?;
    assert!(engine.last_recovery_report().is_none());
    assert_eq!(engine.count_records(c)?, 40);
    engine.close()?;
    fs::remove_dir_all(&root).ok();
    Ok(())
}

#[test]
fn freeze_with_error_fails_fast_and_release_resumes() -> Result<()> {
    let root = unique_root("freeze-throw");
    let engine = StorageEngine::create(&root, cfg())?;
    let c = engine.add_cluster("docs")?;
    fill(&engine, c, 2)?;

    engine.freeze(true)?;
    let err = engine.create_record(c, b"x", -1, b'd').unwrap_err();
    assert!(matches!(err, StorageError::ModificationProhibited(_)), "{:?}", err);
    engine.check_error_state()?;
    // чтение заморозке не подчиняется
    assert_eq!(engine.count_records(c)?, 2);

    engine.release()?;
    engine.create_record(c, b"x", -1, b'd')?;
    assert_eq!(engine.count_records(c)?, 3);

    engine.close()?;
    fs::remove_dir_all(&root).ok();
    Ok(())
}

#[test]
fn freeze_without_error_blocks_until_release() -> Result<()> {
    let root = unique_root("freeze-wait");
    let engine = StorageEngine::create(&root, cfg())?;
    let c = engine.add_cluster("docs")?;

    engine.freeze(false)?;
    std::thread::scope(|s| -> Result<()> {
        let (tx, rx) = mpsc::channel();
        let eng = &engine;
        s.spawn(move || {
            let res = eng.create_record(c, b"waiting", -1, b'd');
            let _ = tx.send(res.is_ok());
        });
        assert!(
            rx.recv_timeout(Duration::from_millis(200)).is_err(),
            "commit must wait while the storage is frozen"
        );
        engine.release()?;
        assert!(rx.recv_timeout(Duration::from_secs(10))?);
        Ok(())
    })?;
    assert_eq!(engine.count_records(c)?, 1);

    engine.close()?;
    fs::remove_dir_all(&root).ok();
    Ok(())
}

#[test]
fn background_vacuum_follows_segment_rollover() -> Result<()> {
    let root = unique_root("vacuum");
    let engine = StorageEngine::create(&root, cfg())?;
    let c = engine.add_cluster("docs")?;
    fill(&engine, c, 80)?;
    engine.request_checkpoint();

    // фоновый поток сам чистит журнал; ждём, пока он отработает
    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    while engine.metrics_snapshot().vacuum_runs == 0 && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(20));
    }
    let m = engine.metrics_snapshot();
    assert!(m.vacuum_runs > 0);
    assert!(m.fuzzy_checkpoints > 0);
    engine.check_error_state()?;

    engine.close()?;
    fs::remove_dir_all(&root).ok();
    Ok(())
}

#[test]
fn full_checkpoint_under_concurrent_commits_loses_nothing() -> Result<()> {
    for iter in 0..20u32 {
        let root = unique_root("flush-race");
        let engine = StorageEngine::create(&root, cfg())?;
        let c = engine.add_cluster("docs")?;
        fill(&engine, c, 5)?;

        let stop = AtomicBool::new(false);
        let (flushed, committed) = std::thread::scope(|s| {
            let writer = s.spawn(|| {
                let mut done = Vec::new();
                let mut i = 0u32;
                while !stop.load(Ordering::Acquire) {
                    let body = [iter.to_le_bytes(), i.to_le_bytes()].concat();
                    // после отказа чекпоинта хранилище отравлено: дальше только InError
                    match engine.create_record(c, &body, -1, b'd') {
                        Ok((rid, _)) => done.push((rid, body)),
                        Err(_) => break,
                    }
                    i += 1;
                }
                done
            });
            std::thread::sleep(Duration::from_millis(2 + (iter % 5) as u64));
            let flushed = engine.flush_all_data();
            std::thread::sleep(Duration::from_millis(2));
            stop.store(true, Ordering::Release);
            (flushed, writer.join().expect("writer thread panicked"))
        });
        if let Err(e) = &flushed {
            assert!(matches!(e, StorageError::InvalidState(_)), "iter {}: {:?}", iter, e);
        }
        engine.crash();

        let engine = StorageEngine::open(&root, cfg())?;
        for (rid, body) in &committed {
            let rec = engine
                .read_record(*rid)
                .map_err(|e| anyhow::anyhow!("iter {}: committed {} lost: {}", iter, rid, e))?;
            assert_eq!(&rec.content, body, "iter {}", iter);
        }
        assert_eq!(engine.count_records(c)?, 5 + committed.len() as u64, "iter {}", iter);
        engine.close()?;
        fs::remove_dir_all(&root).ok();
    }
    Ok(())
}
