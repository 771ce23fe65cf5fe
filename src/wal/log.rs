//! wal/log — WriteAheadLog: сегментированный журнал с group-commit fsync.
//!
//! Поведение:
//! - log(record) пишет кадр в активный сегмент и возвращает его LSN. Когда активный
//!   сегмент перерастает segment_size, журнал переходит в новый сегмент (старый
//!   fsync'ается) и уведомляет checkpoint listener.
//! - flush(): один поток делает fsync, остальные ждут на condvar, пока flushed_lsn
//!   не догонит их цель (коалессация fsync, как в group-commit).
//! - read(from, n)/next(lsn, n): последовательное чтение через границы сегментов.
//!   Рваный хвост сегмента = конец его данных; CRC mismatch = WalPageBroken.
//! - cut_till(lsn): удаляет сегменты целиком ниже lsn.segment, но никогда не
//!   активный сегмент и не ниже самого раннего cut-till лимита.
//!
//! Порядок захвата мьютексов: appender → flush. Никогда наоборот.

use anyhow::{anyhow, Context, Result};
use log::{debug, info, warn};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};

use super::encode::encode_frame;
use super::reader::{read_frame_at, Frame};
use super::record::WalRecord;
use super::{
    list_segments, read_segment_header, segment_path, write_segment_header, WAL_HDR_SIZE,
};
use crate::lsn::Lsn;
use crate::metrics::StorageMetrics;

/// Запись, прочитанная из журнала, вместе с её LSN.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggedRecord {
    pub lsn: Lsn,
    pub record: WalRecord,
}

pub type CheckpointListener = Arc<dyn Fn() + Send + Sync>;

struct Appender {
    segment: u64,
    file: File,
    position: u64,
    last_lsn: Option<Lsn>,
}

/// Состояние fsync-коалессации.
struct FlushState {
    flushed: Option<Lsn>,
    flushing: bool,
}

pub struct WriteAheadLog {
    dir: PathBuf,
    segment_size: u64,
    fsync: bool,
    appender: Mutex<Appender>,
    segments: Mutex<BTreeSet<u64>>,
    flush: Mutex<FlushState>,
    cv: Condvar,
    cut_limits: Mutex<BTreeMap<Lsn, usize>>,
    listener: Mutex<Option<CheckpointListener>>,
    metrics: Arc<StorageMetrics>,
}

fn open_segment_rw(dir: &Path, segment: u64, create: bool) -> Result<File> {
    let path = segment_path(dir, segment);
    OpenOptions::new()
        .create(create)
        .read(true)
        .write(true)
        .open(&path)
        .with_context(|| format!("open wal segment {}", path.display()))
}

/// Просканировать сегмент: (последний валидный LSN, конец валидных данных, хвост рваный?).
fn scan_segment(dir: &Path, segment: u64) -> Result<(Option<Lsn>, u64, bool)> {
    let mut f = open_segment_rw(dir, segment, false)?;
    let len = f.metadata()?.len();
    let mut pos = WAL_HDR_SIZE as u64;
    let mut last = None;
    loop {
        match read_frame_at(&mut f, segment, pos, len) {
            Ok(Frame::Record(_, next)) => {
                last = Some(Lsn::new(segment, pos));
                pos = next;
            }
            Ok(Frame::End) => break,
            Err(e) => {
                warn!("wal scan_segment: {:#}", e);
                return Ok((last, pos, true));
            }
        }
    }
    // Хвост после последнего валидного кадра, не являющийся нулями — рваная запись.
    let torn = pos < len && !tail_is_zero(&mut f, pos, len)?;
    Ok((last, pos, torn))
}

fn tail_is_zero(f: &mut File, from: u64, len: u64) -> Result<bool> {
    use std::io::Read;
    f.seek(SeekFrom::Start(from))?;
    let mut buf = vec![0u8; (len - from).min(64 * 1024) as usize];
    f.read_exact(&mut buf)?;
    Ok(buf.iter().all(|b| *b == 0))
}

impl WriteAheadLog {
    /// Открыть (или создать) журнал в каталоге `dir`.
    ///
    /// Если последний сегмент заканчивается рваным/битым хвостом, он остаётся как есть
    /// (его увидит восстановление), а дозапись начинается в новом сегменте.
    pub fn open(
        dir: &Path,
        segment_size: u64,
        fsync: bool,
        metrics: Arc<StorageMetrics>,
    ) -> Result<Self> {
        fs::create_dir_all(dir).with_context(|| format!("create wal dir {}", dir.display()))?;
        let existing = list_segments(dir)?;

        let (appender, segments) = if existing.is_empty() {
            let mut file = open_segment_rw(dir, 1, true)?;
            write_segment_header(&mut file, 1)?;
            if fsync {
                file.sync_all()?;
                let _ = crate::util::fsync_dir(dir);
            }
            let seg = Appender {
                segment: 1,
                file,
                position: WAL_HDR_SIZE as u64,
                last_lsn: None,
            };
            (seg, BTreeSet::from([1u64]))
        } else {
            let mut segments: BTreeSet<u64> = existing.iter().copied().collect();
            let last_seg = *existing.last().unwrap_or(&1);

            // Сегмент, созданный, но не успевший получить заголовок.
            let mut f = open_segment_rw(dir, last_seg, false)?;
            let header_ok = match read_segment_header(&mut f) {
                Ok(id) => id == last_seg,
                Err(_) => false,
            };
            let (last_in_seg, end_pos, torn) = if header_ok {
                scan_segment(dir, last_seg)?
            } else {
                warn!(
                    "wal open: segment {} has no valid header, rewriting it",
                    last_seg
                );
                f.set_len(0)?;
                write_segment_header(&mut f, last_seg)?;
                (None, WAL_HDR_SIZE as u64, false)
            };

            // Последний LSN: в последнем сегменте или в более ранних.
            let mut last_lsn = last_in_seg;
            if last_lsn.is_none() {
                for &s in existing.iter().rev().skip(1) {
                    let (l, _, _) = scan_segment(dir, s)?;
                    if l.is_some() {
                        last_lsn = l;
                        break;
                    }
                }
            }

            let appender = if torn {
                let next_seg = last_seg + 1;
                warn!(
                    "wal open: torn tail in segment {} at {}, appends continue in segment {}",
                    last_seg, end_pos, next_seg
                );
                let mut nf = open_segment_rw(dir, next_seg, true)?;
                nf.set_len(0)?;
                write_segment_header(&mut nf, next_seg)?;
                if fsync {
                    nf.sync_all()?;
                    let _ = crate::util::fsync_dir(dir);
                }
                segments.insert(next_seg);
                Appender {
                    segment: next_seg,
                    file: nf,
                    position: WAL_HDR_SIZE as u64,
                    last_lsn,
                }
            } else {
                // Зануленный преаллоцированный хвост отрезаем.
                f.set_len(end_pos)?;
                f.seek(SeekFrom::Start(end_pos))?;
                Appender {
                    segment: last_seg,
                    file: f,
                    position: end_pos,
                    last_lsn,
                }
            };
            (appender, segments)
        };

        let flushed = appender.last_lsn;
        debug!(
            "wal open: dir={}, segments={:?}, active={}, end={:?}",
            dir.display(),
            segments,
            appender.segment,
            flushed
        );

        Ok(Self {
            dir: dir.to_path_buf(),
            segment_size: segment_size.max(WAL_HDR_SIZE as u64 * 2),
            fsync,
            appender: Mutex::new(appender),
            segments: Mutex::new(segments),
            flush: Mutex::new(FlushState {
                flushed,
                flushing: false,
            }),
            cv: Condvar::new(),
            cut_limits: Mutex::new(BTreeMap::new()),
            listener: Mutex::new(None),
            metrics,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Установить listener, вызываемый при автоматическом переходе в новый сегмент.
    pub fn set_checkpoint_listener(&self, f: Option<CheckpointListener>) {
        *self.listener.lock().unwrap() = f;
    }

    // -------------------- append --------------------

    /// Добавить запись; возвращает присвоенный LSN. Долговечность — только после flush().
    pub fn log(&self, record: &WalRecord) -> Result<Lsn> {
        let frame = encode_frame(record)?;
        let mut rolled = false;
        let lsn = {
            let mut a = self.appender.lock().unwrap();
            if a.position > WAL_HDR_SIZE as u64
                && a.position + frame.len() as u64 > self.segment_size
            {
                self.roll_locked(&mut a)?;
                rolled = true;
            }
            let lsn = Lsn::new(a.segment, a.position);
            a.file
                .write_all(&frame)
                .with_context(|| format!("wal append at {}", lsn))?;
            a.position += frame.len() as u64;
            a.last_lsn = Some(lsn);
            lsn
        };
        self.metrics.record_wal_append(frame.len());

        if rolled {
            let l = self.listener.lock().unwrap().clone();
            if let Some(l) = l {
                l();
            }
        }
        Ok(lsn)
    }

    /// Закрыть активный сегмент и начать новый. Вызывается под appender-локом.
    fn roll_locked(&self, a: &mut Appender) -> Result<()> {
        if self.fsync {
            a.file.sync_data()?;
            self.metrics.record_wal_fsync();
        }
        // всё записанное в старый сегмент теперь долговечно
        if let Some(last) = a.last_lsn {
            let mut st = self.flush.lock().unwrap();
            if st.flushed < Some(last) {
                st.flushed = Some(last);
                self.cv.notify_all();
            }
        }

        let next = a.segment + 1;
        let mut f = open_segment_rw(&self.dir, next, true)?;
        f.set_len(0)?;
        write_segment_header(&mut f, next)?;
        if self.fsync {
            f.sync_all()?;
            let _ = crate::util::fsync_dir(&self.dir);
        }
        a.segment = next;
        a.file = f;
        a.position = WAL_HDR_SIZE as u64;
        self.segments.lock().unwrap().insert(next);
        debug!("wal roll: new active segment {}", next);
        Ok(())
    }

    /// Принудительно начать новый сегмент (полный чекпоинт, бэкап).
    pub fn append_new_segment(&self) -> Result<u64> {
        let mut a = self.appender.lock().unwrap();
        self.roll_locked(&mut a)?;
        Ok(a.segment)
    }

    // -------------------- flush (group commit) --------------------

    pub fn flush(&self) -> Result<()> {
        let (target, file) = {
            let a = self.appender.lock().unwrap();
            match a.last_lsn {
                None => return Ok(()),
                Some(l) => (l, a.file.try_clone()?),
            }
        };

        let mut st = self.flush.lock().unwrap();
        loop {
            if st.flushed >= Some(target) {
                return Ok(());
            }
            if !st.flushing {
                break;
            }
            st = self.cv.wait(st).unwrap();
        }

        if !self.fsync {
            st.flushed = Some(target);
            self.cv.notify_all();
            return Ok(());
        }

        st.flushing = true;
        drop(st);

        let res = file.sync_data();

        let mut st = self.flush.lock().unwrap();
        st.flushing = false;
        if res.is_ok() && st.flushed < Some(target) {
            st.flushed = Some(target);
        }
        self.cv.notify_all();
        drop(st);

        res.with_context(|| format!("wal fsync up to {}", target))?;
        self.metrics.record_wal_fsync();
        Ok(())
    }

    /// Последний LSN, гарантированно сброшенный на диск.
    pub fn flushed_lsn(&self) -> Option<Lsn> {
        self.flush.lock().unwrap().flushed
    }

    // -------------------- positions --------------------

    /// LSN первой записи журнала (None — журнал пуст).
    pub fn begin(&self) -> Option<Lsn> {
        let segs: Vec<u64> = self.segments.lock().unwrap().iter().copied().collect();
        let (active, active_pos) = {
            let a = self.appender.lock().unwrap();
            (a.segment, a.position)
        };
        for s in segs {
            let len = if s == active {
                active_pos
            } else {
                fs::metadata(segment_path(&self.dir, s))
                    .map(|m| m.len())
                    .unwrap_or(0)
            };
            if len > WAL_HDR_SIZE as u64 {
                return Some(Lsn::new(s, WAL_HDR_SIZE as u64));
            }
        }
        None
    }

    /// LSN последней добавленной записи.
    pub fn end(&self) -> Option<Lsn> {
        self.appender.lock().unwrap().last_lsn
    }

    /// Позиция, которую получит следующая запись.
    pub fn next_lsn(&self) -> Lsn {
        let a = self.appender.lock().unwrap();
        Lsn::new(a.segment, a.position)
    }

    pub fn active_segment(&self) -> u64 {
        self.appender.lock().unwrap().segment
    }

    pub fn segments(&self) -> Vec<u64> {
        self.segments.lock().unwrap().iter().copied().collect()
    }

    pub fn non_active_segments(&self) -> Vec<u64> {
        let active = self.active_segment();
        self.segments
            .lock()
            .unwrap()
            .iter()
            .copied()
            .filter(|s| *s != active)
            .collect()
    }

    /// Суммарный размер файлов сегментов.
    pub fn size(&self) -> u64 {
        self.segments()
            .into_iter()
            .filter_map(|s| fs::metadata(segment_path(&self.dir, s)).ok())
            .map(|m| m.len())
            .sum()
    }

    // -------------------- read --------------------

    /// Прочитать до `batch` записей, начиная с записи на `from` включительно.
    ///
    /// Если `from` раньше первого сегмента, чтение начинается с начала журнала.
    /// Битая страница: если до неё что-то прочитано — возвращается прочитанное,
    /// следующий вызов вернёт Err(WalPageBroken).
    pub fn read(&self, from: Lsn, batch: usize) -> Result<Vec<LoggedRecord>> {
        match self.read_until_broken(from, batch)? {
            (out, Some(e)) if out.is_empty() => Err(e),
            (out, _) => Ok(out),
        }
    }

    /// Прочитать до `batch` записей, следующих строго после записи `lsn`.
    ///
    /// Если сразу за `lsn` лежит битая страница, это Err(WalPageBroken), а не
    /// пустой пакет: пустой пакет означает конец журнала.
    pub fn next(&self, lsn: Lsn, batch: usize) -> Result<Vec<LoggedRecord>> {
        let (mut recs, broken) = self.read_until_broken(lsn, batch + 1)?;
        if recs.first().map(|r| r.lsn) == Some(lsn) {
            recs.remove(0);
        }
        match broken {
            Some(e) if recs.is_empty() => Err(e),
            _ => {
                recs.truncate(batch);
                Ok(recs)
            }
        }
    }

    /// Валидный префикс и ошибка битой страницы, на которой чтение остановилось.
    fn read_until_broken(
        &self,
        from: Lsn,
        batch: usize,
    ) -> Result<(Vec<LoggedRecord>, Option<anyhow::Error>)> {
        let segs = self.segments();
        let mut out = Vec::new();
        let batch = batch.max(1);

        for seg in segs.into_iter().filter(|s| *s >= from.segment) {
            let mut pos = if seg == from.segment {
                from.position.max(WAL_HDR_SIZE as u64)
            } else {
                WAL_HDR_SIZE as u64
            };
            let path = segment_path(&self.dir, seg);
            let mut f = match File::open(&path) {
                Ok(f) => f,
                // сегмент мог быть удалён параллельным cut_till
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(anyhow!("open wal segment {}: {}", path.display(), e));
                }
            };
            let len = f.metadata()?.len();
            while out.len() < batch {
                match read_frame_at(&mut f, seg, pos, len) {
                    Ok(Frame::Record(record, next)) => {
                        out.push(LoggedRecord {
                            lsn: Lsn::new(seg, pos),
                            record,
                        });
                        pos = next;
                    }
                    Ok(Frame::End) => break,
                    Err(e) => return Ok((out, Some(e))),
                }
            }
            if out.len() >= batch {
                break;
            }
        }
        Ok((out, None))
    }

    // -------------------- truncation --------------------

    pub fn add_cut_till_limit(&self, lsn: Lsn) {
        *self.cut_limits.lock().unwrap().entry(lsn).or_insert(0) += 1;
    }

    pub fn remove_cut_till_limit(&self, lsn: Lsn) -> Result<()> {
        let mut m = self.cut_limits.lock().unwrap();
        match m.get_mut(&lsn) {
            Some(c) if *c > 1 => {
                *c -= 1;
                Ok(())
            }
            Some(_) => {
                m.remove(&lsn);
                Ok(())
            }
            None => Err(anyhow!("cut till limit {} is not registered", lsn)),
        }
    }

    /// Удалить сегменты, целиком лежащие ниже `lsn`. Возвращает true, если что-то удалено.
    pub fn cut_till(&self, lsn: Lsn) -> Result<bool> {
        self.cut_all_segments_smaller_than(lsn.segment)
    }

    pub fn cut_all_segments_smaller_than(&self, segment: u64) -> Result<bool> {
        let mut limit = segment.min(self.active_segment());
        if let Some((min_lsn, _)) = self.cut_limits.lock().unwrap().iter().next() {
            limit = limit.min(min_lsn.segment);
        }

        let victims: Vec<u64> = {
            let segs = self.segments.lock().unwrap();
            segs.iter().copied().filter(|s| *s < limit).collect()
        };
        if victims.is_empty() {
            return Ok(false);
        }
        for s in &victims {
            let p = segment_path(&self.dir, *s);
            match fs::remove_file(&p) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(anyhow!("remove wal segment {}: {}", p.display(), e)),
            }
            self.segments.lock().unwrap().remove(s);
        }
        let _ = crate::util::fsync_dir(&self.dir);
        self.metrics.record_wal_cut(victims.len());
        info!(
            "wal cut: removed {} segment(s) below {} ({:?})",
            victims.len(),
            limit,
            victims
        );
        Ok(true)
    }

    // -------------------- lifecycle --------------------

    pub fn close(&self) -> Result<()> {
        self.flush()
    }

    /// Удалить все файлы журнала. Хэндл после этого непригоден.
    pub fn delete(&self) -> Result<()> {
        let segs = self.segments();
        for s in segs {
            let _ = fs::remove_file(segment_path(&self.dir, s));
        }
        self.segments.lock().unwrap().clear();
        let _ = fs::remove_dir(&self.dir);
        Ok(())
    }
}
