// tests/wal_segments.rs
//
// Сегментированный WAL: упорядоченное чтение через границы сегментов,
// рваный хвост после падения, битая страница посередине, усечение с лимитами.

use anyhow::Result;
use std::fs::{self, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use StrataDB::consts::{WAL_HDR_SIZE, WAL_REC_HDR_SIZE};
use StrataDB::metrics::StorageMetrics;
use StrataDB::wal::reader::scan_segments;
use StrataDB::wal::{segment_path, WalRecord, WriteAheadLog};
use StrataDB::{Lsn, StorageError};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn unique_root(prefix: &str) -> PathBuf {
    let pid = std::process::id();
    let t = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!("stratatest-wal-{prefix}-{pid}-{t}-{id}"))
}

fn open_wal(dir: &Path) -> Result<WriteAheadLog> {
    // маленькие сегменты: по паре записей в каждом
    WriteAheadLog::open(dir, 256, false, Arc::new(StorageMetrics::new()))
}

fn meta(i: u8) -> WalRecord {
    WalRecord::MetaData {
        bytes: vec![i; 100],
    }
}

fn read_all(wal: &WriteAheadLog) -> Result<Vec<(Lsn, WalRecord)>> {
    let mut out = Vec::new();
    let Some(begin) = wal.begin() else {
        return Ok(out);
    };
    let mut batch = wal.read(begin, 3)?;
    while let Some(last) = batch.last().map(|r| r.lsn) {
        out.extend(batch.into_iter().map(|r| (r.lsn, r.record)));
        batch = wal.next(last, 3)?;
    }
    Ok(out)
}

#[test]
fn records_are_read_in_order_across_segments() -> Result<()> {
    let dir = unique_root("order");
    let mut lsns = Vec::new();
    {
        let wal = open_wal(&dir)?;
        for i in 0..10u8 {
            lsns.push(wal.log(&meta(i))?);
        }
        wal.flush()?;
        assert!(wal.segments().len() > 1, "segments: {:?}", wal.segments());
        assert_eq!(wal.end(), lsns.last().copied());
    }

    // LSN строго возрастают, сегмент — старший разряд
    for w in lsns.windows(2) {
        assert!(w[0] < w[1]);
    }

    let wal = open_wal(&dir)?;
    let all = read_all(&wal)?;
    assert_eq!(all.len(), 10);
    for (i, (lsn, rec)) in all.iter().enumerate() {
        assert_eq!(*lsn, lsns[i]);
        assert_eq!(*rec, meta(i as u8));
    }

    // после переоткрытия дозапись продолжает журнал
    let next = wal.log(&WalRecord::Empty)?;
    assert!(next > lsns[9]);
    assert_eq!(wal.begin(), Some(Lsn::new(lsns[0].segment, WAL_HDR_SIZE as u64)));

    fs::remove_dir_all(&dir).ok();
    Ok(())
}

#[test]
fn torn_tail_is_end_of_log_and_appends_move_on() -> Result<()> {
    let dir = unique_root("torn");
    let (last_lsn, active) = {
        let wal = open_wal(&dir)?;
        let mut last = Lsn::ZERO;
        for i in 0..3u8 {
            last = wal.log(&meta(i))?;
        }
        wal.flush()?;
        (last, wal.active_segment())
    };

    // недописанный кадр: заголовок обещает больше байт, чем есть в файле
    {
        let mut f = OpenOptions::new().append(true).open(segment_path(&dir, active))?;
        let mut hdr = [0u8; WAL_REC_HDR_SIZE];
        hdr[0] = 7;
        hdr[4..8].copy_from_slice(&500u32.to_le_bytes());
        f.write_all(&hdr)?;
        f.write_all(&[0xAB; 10])?;
        f.sync_all()?;
    }

    let wal = open_wal(&dir)?;
    assert_eq!(wal.end(), Some(last_lsn));
    assert!(wal.active_segment() > active, "appends must start a new segment");

    let after = wal.log(&meta(42))?;
    wal.flush()?;
    let all = read_all(&wal)?;
    assert_eq!(all.len(), 4);
    assert_eq!(all[3], (after, meta(42)));

    fs::remove_dir_all(&dir).ok();
    Ok(())
}

#[test]
fn broken_page_stops_reading_after_valid_prefix() -> Result<()> {
    let dir = unique_root("broken");
    let mut lsns = Vec::new();
    {
        let wal = open_wal(&dir)?;
        for i in 0..6u8 {
            lsns.push(wal.log(&meta(i))?);
        }
        wal.flush()?;
    }

    // портим payload четвёртой записи: CRC перестаёт сходиться
    let victim = lsns[3];
    {
        let mut f = OpenOptions::new()
            .read(true)
            .write(true)
            .open(segment_path(&dir, victim.segment))?;
        f.seek(SeekFrom::Start(victim.position + WAL_REC_HDR_SIZE as u64 + 2))?;
        f.write_all(&[0x5A])?;
        f.sync_all()?;
    }

    let wal = open_wal(&dir)?;
    let begin = wal.begin().expect("wal is not empty");
    let head = wal.read(begin, 100)?;
    assert_eq!(head.len(), 3);
    assert_eq!(head.last().map(|r| r.lsn), Some(lsns[2]));

    let err = wal.read(victim, 100).unwrap_err();
    match StorageError::find(&err) {
        Some(StorageError::WalPageBroken { lsn, .. }) => assert_eq!(*lsn, victim),
        other => panic!("expected WalPageBroken, got {:?} ({:#})", other, err),
    }

    // next() за последней валидной записью — та же ошибка, а не пустой пакет
    let err = wal.next(lsns[2], 100).unwrap_err();
    match StorageError::find(&err) {
        Some(StorageError::WalPageBroken { lsn, .. }) => assert_eq!(*lsn, victim),
        other => panic!("expected WalPageBroken from next, got {:?} ({:#})", other, err),
    }
    assert!(read_all(&wal).is_err());

    // офлайн-проход видит тот же префикс и ту же ошибку
    let mut seen = 0;
    let res = scan_segments(wal.dir(), |_| {
        seen += 1;
        Ok(())
    });
    assert!(res.is_err());
    assert_eq!(seen, 3);

    fs::remove_dir_all(&dir).ok();
    Ok(())
}

#[test]
fn cut_respects_limits_and_active_segment() -> Result<()> {
    let dir = unique_root("cut");
    let wal = open_wal(&dir)?;
    let mut lsns = Vec::new();
    for i in 0..12u8 {
        lsns.push(wal.log(&meta(i))?);
    }
    wal.flush()?;
    let segs = wal.segments();
    assert!(segs.len() >= 4, "segments: {:?}", segs);

    // лимит во втором сегменте защищает его и всё выше
    let limit = Lsn::new(segs[1], WAL_HDR_SIZE as u64);
    wal.add_cut_till_limit(limit);
    assert!(wal.cut_all_segments_smaller_than(u64::MAX)?);
    assert_eq!(wal.segments()[0], segs[1]);
    assert!(!wal.cut_all_segments_smaller_than(u64::MAX)?);

    wal.remove_cut_till_limit(limit)?;
    assert!(wal.remove_cut_till_limit(limit).is_err());

    // активный сегмент не удаляется никогда
    wal.cut_till(Lsn::new(u64::MAX, 0))?;
    assert_eq!(wal.segments(), vec![wal.active_segment()]);
    assert!(!segment_path(&dir, segs[0]).exists());

    // из оставшегося читается только хвост
    let rest = read_all(&wal)?;
    assert!(rest.iter().all(|(l, _)| l.segment == wal.active_segment()));

    fs::remove_dir_all(&dir).ok();
    Ok(())
}
