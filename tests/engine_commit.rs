// tests/engine_commit.rs
//
// Коммит транзакций: MVCC-версии, откат целиком при конфликте, изменения индексов
// с временными RID, предвыделение позиций, заданные позиции и плейсхолдеры,
// липкое состояние ошибки.

use anyhow::Result;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use StrataDB::{
    RecordOperationKind, Rid, StorageEngine, StorageError, StrataConfig, Transaction,
};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn unique_root(prefix: &str) -> PathBuf {
    let pid = std::process::id();
    let t = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!("stratatest-commit-{prefix}-{pid}-{t}-{id}"))
}

fn cfg() -> StrataConfig {
    StrataConfig::default()
        .with_page_size(4096)
        .with_wal_fsync(false)
        .with_data_fsync(false)
}

const DOC: u8 = b'd';

#[test]
fn cluster_3_version_scenario() -> Result<()> {
    let root = unique_root("cluster3");
    let engine = StorageEngine::create(&root, cfg())?;
    for name in ["c0", "c1", "c2", "c3"] {
        engine.add_cluster(name)?;
    }
    assert_eq!(engine.cluster_id_by_name("c3"), Some(3));

    let (rid, v) = engine.create_record(3, b"R", -1, DOC)?;
    assert_eq!(rid.cluster_id, 3);
    assert_eq!(v, 1);

    let v2 = engine.update_record(rid, b"R2", 1, DOC)?;
    assert_eq!(v2, 2);

    let err = engine.update_record(rid, b"R3", 1, DOC).unwrap_err();
    assert_eq!(
        err,
        StorageError::ConcurrentModification {
            rid,
            expected: 2,
            supplied: 1
        }
    );
    // конфликт не отравляет хранилище
    engine.check_error_state()?;

    let rec = engine.read_record(rid)?;
    assert_eq!(rec.content, b"R2");
    assert_eq!(rec.version, 2);

    engine.close()?;
    fs::remove_dir_all(&root).ok();
    Ok(())
}

#[test]
fn version_rules_and_delete() -> Result<()> {
    let root = unique_root("versions");
    let engine = StorageEngine::create(&root, cfg())?;
    let c = engine.add_cluster("docs")?;

    // переданная версия v > -1 даёт v + 1
    let (rid, v) = engine.create_record(c, b"a", 4, DOC)?;
    assert_eq!(v, 5);

    // -2: без проверки и без инкремента
    assert_eq!(engine.update_record(rid, b"b", -2, DOC)?, 5);
    // -1: без проверки, +1
    assert_eq!(engine.update_record(rid, b"c", -1, DOC)?, 6);
    // < -2: overwrite
    let forced = StrataDB::storage::version::set_rollback_mode(40);
    assert_eq!(engine.update_record(rid, b"d", forced, DOC)?, 40);

    let meta = engine.get_record_metadata(rid)?.expect("metadata");
    assert_eq!(meta.record_version, 40);
    assert_eq!(meta.record_type, DOC);
    assert_eq!(meta.record_size, 1);

    let err = engine.delete_record(rid, 39).unwrap_err();
    assert!(matches!(err, StorageError::ConcurrentModification { expected: 40, .. }));
    engine.delete_record(rid, 40)?;
    assert!(!engine.record_exists(rid)?);
    assert_eq!(engine.read_record(rid).unwrap_err(), StorageError::RecordNotFound(rid));
    assert_eq!(
        engine.delete_record(rid, -1).unwrap_err(),
        StorageError::RecordNotFound(rid)
    );
    assert!(matches!(
        engine.create_record(77, b"x", -1, DOC).unwrap_err(),
        StorageError::ClusterNotFound(_)
    ));
    engine.check_error_state()?;

    engine.close()?;
    fs::remove_dir_all(&root).ok();
    Ok(())
}

#[test]
fn conflicting_transaction_leaves_nothing_behind() -> Result<()> {
    let root = unique_root("rollback");
    let engine = StorageEngine::create(&root, cfg())?;
    let c = engine.add_cluster("docs")?;
    engine.add_index_engine("by_name", true)?;
    let (existing, _) = engine.create_record(c, b"old", -1, DOC)?;

    let mut tx = Transaction::new(1);
    let fresh = tx.create(c, b"new".to_vec(), DOC);
    tx.index_put("by_name", b"new", fresh);
    tx.update(existing, b"changed".to_vec(), 9, DOC); // устаревшая версия
    let err = engine.commit(tx).unwrap_err();
    assert!(err.is_conflict(), "{:?}", err);

    assert_eq!(engine.count_records(c)?, 1);
    assert_eq!(engine.read_record(existing)?.content, b"old");
    assert!(engine.index_get("by_name", b"new")?.is_empty());
    assert_eq!(engine.index_size("by_name")?, 0);
    assert_eq!(engine.metrics_snapshot().tx_conflicts, 1);

    engine.close()?;
    fs::remove_dir_all(&root).ok();
    Ok(())
}

#[test]
fn index_changes_follow_record_rids() -> Result<()> {
    let root = unique_root("index");
    let engine = StorageEngine::create(&root, cfg())?;
    let c = engine.add_cluster("people")?;
    engine.add_index_engine("email", true)?;
    engine.add_index_engine("tag", false)?;

    let mut tx = Transaction::new(7);
    let alice = tx.create(c, b"alice".to_vec(), DOC);
    let bob = tx.create(c, b"bob".to_vec(), DOC);
    tx.index_put("email", b"a@x", alice);
    tx.index_put("email", b"b@x", bob);
    tx.index_put("tag", b"staff", alice);
    tx.index_put("tag", b"staff", bob);
    let ops = engine.commit(tx)?;

    assert_eq!(ops.len(), 2);
    assert!(ops.iter().all(|o| o.kind == RecordOperationKind::Created));
    let alice = ops[0].record.rid;
    let bob = ops[1].record.rid;
    assert!(alice.is_persistent() && bob.is_persistent());
    assert_ne!(alice, bob);

    assert_eq!(engine.index_get("email", b"a@x")?, vec![alice]);
    let mut staff = engine.index_get("tag", b"staff")?;
    staff.sort();
    assert_eq!(staff, vec![alice, bob]);

    // unique: put заменяет значение; remove(None) убирает все значения ключа
    let mut tx = Transaction::new(8);
    tx.index_put("email", b"a@x", bob);
    tx.index_remove("tag", b"staff", None);
    engine.commit(tx)?;
    assert_eq!(engine.index_get("email", b"a@x")?, vec![bob]);
    assert!(engine.index_get("tag", b"staff")?.is_empty());
    assert_eq!(engine.index_size("email")?, 2);

    // clear отменяет более ранние изменения этой же транзакции
    let mut tx = Transaction::new(9);
    tx.index_put("email", b"c@x", alice);
    tx.index_clear("email");
    tx.index_put("email", b"d@x", alice);
    engine.commit(tx)?;
    assert_eq!(engine.index_size("email")?, 1);
    assert_eq!(engine.index_get("email", b"d@x")?, vec![alice]);

    // временный RID, не принадлежащий транзакции
    let mut tx = Transaction::new(10);
    tx.index_put("email", b"z@x", Rid::new(c, -5));
    assert!(matches!(
        engine.commit(tx).unwrap_err(),
        StorageError::IllegalArgument(_)
    ));
    let mut tx = Transaction::new(11);
    tx.index_put("missing", b"k", alice);
    assert!(matches!(
        engine.commit(tx).unwrap_err(),
        StorageError::IndexNotFound(_)
    ));
    engine.check_error_state()?;

    // индексы переживают переоткрытие
    engine.close()?;
    drop(engine);
    let engine = StorageEngine::open(&root, cfg())?;
    assert_eq!(engine.index_get("email", b"d@x")?, vec![alice]);
    let mut names = engine.index_names();
    names.sort();
    assert_eq!(names, vec!["email".to_string(), "tag".to_string()]);

    engine.close()?;
    fs::remove_dir_all(&root).ok();
    Ok(())
}

#[test]
fn preallocated_rids_and_target_positions() -> Result<()> {
    let root = unique_root("prealloc");
    let engine = StorageEngine::create(&root, cfg())?;
    let c = engine.add_cluster("docs")?;

    let mut tx = Transaction::new(1);
    let t1 = tx.create(c, b"one".to_vec(), DOC);
    let t2 = tx.create(c, b"two".to_vec(), DOC);
    assert!(t1.is_temporary() && t2.is_temporary());
    engine.preallocate_rids(&mut tx)?;
    let rids: Vec<Rid> = tx.operations().iter().map(|o| o.record.rid).collect();
    assert_eq!(rids, vec![Rid::new(c, 0), Rid::new(c, 1)]);
    // выделены, но ещё не записаны
    assert!(!engine.record_exists(rids[0])?);

    let ops = engine.commit_pre_allocated(tx)?;
    assert_eq!(ops[1].record.rid, Rid::new(c, 1));
    assert_eq!(engine.read_record(Rid::new(c, 1))?.content, b"two");

    // заданная позиция выше следующей свободной: плейсхолдеры до неё
    let mut tx = Transaction::new(2);
    tx.create_at(Rid::new(c, 5), b"five".to_vec(), -1, DOC);
    engine.commit(tx)?;
    assert_eq!(engine.read_record(Rid::new(c, 5))?.content, b"five");
    assert!(!engine.record_exists(Rid::new(c, 3))?);
    assert_eq!(engine.count_records(c)?, 3);
    assert_eq!(engine.record_positions(c)?, vec![0, 1, 5]);

    // позиция уже пройдена аллокатором
    let mut tx = Transaction::new(3);
    tx.create_at(Rid::new(c, 2), b"late".to_vec(), -1, DOC);
    let err = engine.commit(tx).unwrap_err();
    assert_eq!(
        err,
        StorageError::ConcurrentCreate {
            expected: Rid::new(c, 2),
            actual: Rid::new(c, 6)
        }
    );
    engine.check_error_state()?;

    engine.close()?;
    fs::remove_dir_all(&root).ok();
    Ok(())
}

#[test]
fn fatal_error_makes_storage_sticky_until_reopen() -> Result<()> {
    let root = unique_root("sticky");
    let engine = StorageEngine::create(&root, cfg())?;
    let c = engine.add_cluster("docs")?;
    let (kept, _) = engine.create_record(c, b"kept", -1, DOC)?;

    // commit_pre_allocated без выделенной позиции — фатальная ошибка
    let mut tx = Transaction::new(1);
    tx.create(c, b"lost".to_vec(), DOC);
    let err = engine.commit_pre_allocated(tx).unwrap_err();
    assert!(matches!(err, StorageError::Storage(_)), "{:?}", err);

    assert!(matches!(engine.check_error_state(), Err(StorageError::InError(_))));
    assert!(matches!(engine.read_record(kept), Err(StorageError::InError(_))));
    assert!(matches!(
        engine.create_record(c, b"x", -1, DOC),
        Err(StorageError::InError(_))
    ));
    drop(engine);

    // после переоткрытия (с восстановлением из WAL) хранилище снова рабочее
    let engine = StorageEngine::open(&root, cfg())?;
    engine.check_error_state()?;
    assert!(engine.last_recovery_report().is_some());
    assert_eq!(engine.read_record(kept)?.content, b"kept");
    assert_eq!(engine.count_records(c)?, 1);

    engine.close()?;
    fs::remove_dir_all(&root).ok();
    Ok(())
}

#[test]
fn metadata_commits_survive_reopen() -> Result<()> {
    let root = unique_root("metadata");
    {
        let engine = StorageEngine::create(&root, cfg())?;
        let c = engine.add_cluster("docs")?;
        let mut tx = Transaction::new(1);
        tx.create(c, b"a".to_vec(), DOC);
        tx.set_metadata(Some(b"tx-1".to_vec()));
        engine.commit(tx)?;
        assert_eq!(engine.last_metadata(), Some(b"tx-1".to_vec()));

        engine.commit_metadata(b"tx-2".to_vec())?;
        assert_eq!(engine.last_metadata(), Some(b"tx-2".to_vec()));
        engine.close()?;
    }
    {
        let engine = StorageEngine::open(&root, cfg())?;
        assert!(!engine.were_data_restored_after_open());
        assert_eq!(engine.last_metadata(), Some(b"tx-2".to_vec()));
        engine.close()?;
    }
    fs::remove_dir_all(&root).ok();
    Ok(())
}

#[test]
fn ddl_survives_reopen() -> Result<()> {
    let root = unique_root("ddl");
    {
        let engine = StorageEngine::create(&root, cfg())?;
        let a = engine.add_cluster("alpha")?;
        let b = engine.add_cluster("beta")?;
        engine.create_record(a, b"x", -1, DOC)?;
        engine.create_record(b, b"y", -1, DOC)?;
        assert!(matches!(
            engine.add_cluster("alpha").unwrap_err(),
            StorageError::IllegalArgument(_)
        ));
        assert!(matches!(
            engine.add_cluster("bad name").unwrap_err(),
            StorageError::IllegalArgument(_)
        ));
        engine.drop_cluster(a)?;
        assert!(matches!(
            engine.count_records(a).unwrap_err(),
            StorageError::ClusterNotFound(_)
        ));
        engine.close()?;
    }
    {
        let engine = StorageEngine::open(&root, cfg())?;
        assert_eq!(engine.cluster_names(), vec!["beta".to_string()]);
        let b = engine.cluster_id_by_name("beta").expect("beta");
        assert_eq!(engine.count_records(b)?, 1);
        // имя освободилось, id новый
        let again = engine.add_cluster("alpha")?;
        assert!(again > b);
        assert_eq!(engine.count_records(again)?, 0);
        engine.close()?;
    }
    fs::remove_dir_all(&root).ok();
    Ok(())
}
