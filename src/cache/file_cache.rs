//! cache/file_cache — FilePageCache: файлы данных + грязные страницы в памяти.
//!
//! Раскладка:
//! - <root>/data/f{id:08}_{name} — файл страниц (page_size × N);
//! - <root>/data/files.json      — реестр {next_file_id, files[{id,name}], last_metadata}.
//!
//! Правила:
//! - Грязная страница помнит сегмент WAL, в котором началась первая испачкавшая
//!   её операция после последнего сброса. Это нижняя граница усечения журнала
//!   со стороны кэша.
//! - Перед записью страницы с LSN L журнал сброшен как минимум до L (WAL rule).
//! - В restore mode страницы грязнятся без сегмента: журнал и так закреплён
//!   cut-till лимитом на время восстановления.

use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use super::lru::LruPages;
use super::{BrokenPage, PageCache};
use crate::consts::{DATA_DIR, FILE_REGISTRY_FILE};
use crate::lsn::Lsn;
use crate::page::{page_update_checksum, page_verify_checksum, Page};
use crate::util::{fsync_dir, write_atomic};
use crate::wal::WriteAheadLog;

#[derive(Debug, Default, Serialize, Deserialize)]
struct FileRegistry {
    next_file_id: u64,
    files: Vec<FileRegistryEntry>,
    #[serde(default)]
    last_metadata: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct FileRegistryEntry {
    id: u64,
    name: String,
}

struct FileEntry {
    name: String,
    file: File,
    pages: u64,
}

struct DirtyPage {
    data: Vec<u8>,
    segment: Option<u64>,
    lsn: Lsn,
}

struct CacheInner {
    files: BTreeMap<u64, FileEntry>,
    by_name: HashMap<String, u64>,
    next_file_id: u64,
    dirty: BTreeMap<(u64, u64), DirtyPage>,
    last_metadata: Option<Vec<u8>>,
}

pub struct FilePageCache {
    dir: PathBuf,
    page_size: usize,
    data_fsync: bool,
    wal: Arc<WriteAheadLog>,
    inner: Mutex<CacheInner>,
    clean: Mutex<LruPages>,
    restore_mode: AtomicBool,
}

fn data_file_name(file_id: u64, name: &str) -> String {
    format!("f{:08}_{}", file_id, name)
}

fn parse_data_file_name(s: &str) -> Option<(u64, String)> {
    let rest = s.strip_prefix('f')?;
    let (id, name) = rest.split_once('_')?;
    if id.len() != 8 || name.is_empty() {
        return None;
    }
    Some((id.parse().ok()?, name.to_string()))
}

fn open_data_file(path: &Path, create: bool) -> Result<File> {
    OpenOptions::new()
        .create(create)
        .read(true)
        .write(true)
        .open(path)
        .with_context(|| format!("open data file {}", path.display()))
}

impl FilePageCache {
    pub fn open(
        root: &Path,
        page_size: usize,
        data_fsync: bool,
        read_cache_pages: usize,
        wal: Arc<WriteAheadLog>,
    ) -> Result<Self> {
        let dir = root.join(DATA_DIR);
        fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;

        let reg_path = dir.join(FILE_REGISTRY_FILE);
        let reg: FileRegistry = if reg_path.exists() {
            let bytes = fs::read(&reg_path)?;
            serde_json::from_slice(&bytes)
                .with_context(|| format!("parse {}", reg_path.display()))?
        } else {
            FileRegistry {
                next_file_id: 1,
                ..Default::default()
            }
        };

        let mut files = BTreeMap::new();
        let mut by_name = HashMap::new();
        for e in &reg.files {
            let path = dir.join(data_file_name(e.id, &e.name));
            let file = open_data_file(&path, true)?;
            let pages = file.metadata()?.len() / page_size as u64;
            files.insert(
                e.id,
                FileEntry {
                    name: e.name.clone(),
                    file,
                    pages,
                },
            );
            by_name.insert(e.name.clone(), e.id);
        }
        let last_metadata = match reg.last_metadata {
            Some(s) => Some(B64.decode(s.as_bytes()).context("decode last_metadata")?),
            None => None,
        };
        let next_file_id = reg
            .next_file_id
            .max(files.keys().next_back().map(|m| m + 1).unwrap_or(1));

        Ok(Self {
            dir,
            page_size,
            data_fsync,
            wal,
            inner: Mutex::new(CacheInner {
                files,
                by_name,
                next_file_id,
                dirty: BTreeMap::new(),
                last_metadata,
            }),
            clean: Mutex::new(LruPages::new(read_cache_pages)),
            restore_mode: AtomicBool::new(false),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn dirty_pages(&self) -> usize {
        self.inner.lock().unwrap().dirty.len()
    }

    pub fn file_ids(&self) -> Vec<u64> {
        self.inner.lock().unwrap().files.keys().copied().collect()
    }

    fn persist_registry(&self, inner: &CacheInner) -> Result<()> {
        let reg = FileRegistry {
            next_file_id: inner.next_file_id,
            files: inner
                .files
                .iter()
                .map(|(id, e)| FileRegistryEntry {
                    id: *id,
                    name: e.name.clone(),
                })
                .collect(),
            last_metadata: inner.last_metadata.as_ref().map(|m| B64.encode(m)),
        };
        let bytes = serde_json::to_vec_pretty(&reg)?;
        write_atomic(&self.dir.join(FILE_REGISTRY_FILE), &bytes)
    }

    fn read_from_disk(&self, e: &FileEntry, file_id: u64, page_index: u64) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.page_size];
        let off = page_index * self.page_size as u64;
        let mut f = &e.file;
        f.seek(SeekFrom::Start(off))?;
        f.read_exact(&mut buf)
            .with_context(|| format!("read page {}:{} of '{}'", file_id, page_index, e.name))?;
        if !page_verify_checksum(&buf)? {
            return Err(anyhow!(
                "page {}:{} of '{}' checksum mismatch",
                file_id,
                page_index,
                e.name
            ));
        }
        Ok(buf)
    }

    fn load(&self, file_id: u64, page_index: u64) -> Result<Page> {
        let inner = self.inner.lock().unwrap();
        if let Some(d) = inner.dirty.get(&(file_id, page_index)) {
            return Ok(Page::from_bytes(file_id, page_index, d.data.clone()));
        }
        let e = inner
            .files
            .get(&file_id)
            .ok_or_else(|| anyhow!("file {} is not registered in page cache", file_id))?;
        if page_index >= e.pages {
            return Err(anyhow!(
                "page {}:{} is beyond the end of '{}' ({} pages)",
                file_id,
                page_index,
                e.name,
                e.pages
            ));
        }
        if let Some(bytes) = self.clean.lock().unwrap().get((file_id, page_index)) {
            return Ok(Page::from_bytes(file_id, page_index, bytes));
        }
        // страница выделена логически, но ещё не попала на диск
        let disk_len = e.file.metadata()?.len();
        if (page_index + 1) * self.page_size as u64 > disk_len {
            return Ok(Page::new(file_id, page_index, self.page_size));
        }
        let buf = self.read_from_disk(e, file_id, page_index)?;
        self.clean.lock().unwrap().put((file_id, page_index), &buf);
        Ok(Page::from_bytes(file_id, page_index, buf))
    }

    /// Записать набор грязных страниц в файлы и (опционально) fsync.
    fn write_out(&self, inner: &mut CacheInner, keys: &[(u64, u64)]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }

        // WAL rule: журнал долговечен хотя бы до максимального LSN сбрасываемых страниц.
        let max_lsn = keys
            .iter()
            .filter_map(|k| inner.dirty.get(k).map(|d| d.lsn))
            .max()
            .unwrap_or(Lsn::ZERO);
        if !max_lsn.is_zero() && self.wal.flushed_lsn().map_or(true, |f| f < max_lsn) {
            self.wal.flush()?;
        }

        let mut touched: Vec<u64> = Vec::new();
        for key in keys {
            let Some(d) = inner.dirty.remove(key) else {
                continue;
            };
            let (file_id, page_index) = *key;
            let Some(e) = inner.files.get(&file_id) else {
                // файл удалён после того, как страница стала грязной
                continue;
            };
            let mut buf = d.data;
            page_update_checksum(&mut buf)?;
            let mut f = &e.file;
            f.seek(SeekFrom::Start(page_index * self.page_size as u64))?;
            f.write_all(&buf).with_context(|| {
                format!("write page {}:{} of '{}'", file_id, page_index, e.name)
            })?;
            self.clean.lock().unwrap().put(*key, &buf);
            if touched.last() != Some(&file_id) {
                touched.push(file_id);
            }
        }

        if self.data_fsync {
            touched.dedup();
            for id in touched {
                if let Some(e) = inner.files.get(&id) {
                    e.file.sync_data()?;
                }
            }
        }
        Ok(())
    }
}

impl PageCache for FilePageCache {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn load_for_read(&self, file_id: u64, page_index: u64) -> Result<Page> {
        self.load(file_id, page_index)
    }

    fn load_for_write(&self, file_id: u64, page_index: u64) -> Result<Page> {
        self.load(file_id, page_index)
    }

    fn release_from_write(&self, page: Page, start_lsn: Lsn) -> Result<()> {
        let (file_id, page_index) = (page.file_id(), page.index());
        let lsn = page.lsn();
        let restore = self.restore_mode.load(Ordering::Relaxed);
        let mut inner = self.inner.lock().unwrap();
        let e = inner
            .files
            .get_mut(&file_id)
            .ok_or_else(|| anyhow!("release_from_write: file {} is not registered", file_id))?;
        if page_index >= e.pages {
            e.pages = page_index + 1;
        }

        let segment = if restore || start_lsn.is_zero() {
            None
        } else {
            Some(start_lsn.segment)
        };
        let data = page.into_bytes();
        match inner.dirty.get_mut(&(file_id, page_index)) {
            Some(d) => {
                d.data = data;
                d.lsn = d.lsn.max(lsn);
                if d.segment.is_none() {
                    d.segment = segment;
                }
            }
            None => {
                inner.dirty.insert(
                    (file_id, page_index),
                    DirtyPage {
                        data,
                        segment,
                        lsn,
                    },
                );
            }
        }
        self.clean.lock().unwrap().invalidate((file_id, page_index));
        Ok(())
    }

    fn allocate_new_page(&self, file_id: u64) -> Result<Page> {
        let mut inner = self.inner.lock().unwrap();
        let e = inner
            .files
            .get_mut(&file_id)
            .ok_or_else(|| anyhow!("allocate_new_page: file {} is not registered", file_id))?;
        let index = e.pages;
        e.pages += 1;
        Ok(Page::new(file_id, index, self.page_size))
    }

    fn filled_up_to(&self, file_id: u64) -> Result<u64> {
        let inner = self.inner.lock().unwrap();
        inner
            .files
            .get(&file_id)
            .map(|e| e.pages)
            .ok_or_else(|| anyhow!("file {} is not registered in page cache", file_id))
    }

    fn book_file_id(&self, name: &str) -> Result<u64> {
        let mut inner = self.inner.lock().unwrap();
        if inner.by_name.contains_key(name) {
            return Err(anyhow!("file '{}' already exists", name));
        }
        let id = inner.next_file_id;
        inner.next_file_id += 1;
        Ok(id)
    }

    fn add_file(&self, name: &str) -> Result<u64> {
        let id = self.book_file_id(name)?;
        self.add_file_with_id(name, id)?;
        Ok(id)
    }

    fn add_file_with_id(&self, name: &str, file_id: u64) -> Result<()> {
        if name.is_empty() || name.contains(['/', '\\']) {
            return Err(anyhow!("invalid data file name '{}'", name));
        }
        let mut inner = self.inner.lock().unwrap();
        if inner.files.contains_key(&file_id) {
            return Err(anyhow!("file id {} is already registered", file_id));
        }
        if inner.by_name.contains_key(name) {
            return Err(anyhow!("file '{}' already exists", name));
        }
        let path = self.dir.join(data_file_name(file_id, name));
        let file = open_data_file(&path, true)?;
        file.set_len(0)?;
        if self.data_fsync {
            let _ = fsync_dir(&self.dir);
        }
        inner.files.insert(
            file_id,
            FileEntry {
                name: name.to_string(),
                file,
                pages: 0,
            },
        );
        inner.by_name.insert(name.to_string(), file_id);
        inner.next_file_id = inner.next_file_id.max(file_id + 1);
        self.persist_registry(&inner)?;
        debug!("add_file: '{}' as {}", name, file_id);
        Ok(())
    }

    fn delete_file(&self, file_id: u64) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let Some(e) = inner.files.remove(&file_id) else {
            return Ok(());
        };
        inner.by_name.remove(&e.name);
        inner.dirty.retain(|(f, _), _| *f != file_id);
        self.clean.lock().unwrap().invalidate_file(file_id);
        let path = self.dir.join(data_file_name(file_id, &e.name));
        drop(e);
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(anyhow!("remove {}: {}", path.display(), err)),
        }
        self.persist_registry(&inner)?;
        debug!("delete_file: {}", file_id);
        Ok(())
    }

    fn exists(&self, file_id: u64) -> bool {
        self.inner.lock().unwrap().files.contains_key(&file_id)
    }

    fn exists_by_name(&self, name: &str) -> bool {
        self.inner.lock().unwrap().by_name.contains_key(name)
    }

    fn file_id_by_name(&self, name: &str) -> Option<u64> {
        self.inner.lock().unwrap().by_name.get(name).copied()
    }

    fn file_name(&self, file_id: u64) -> Option<String> {
        self.inner
            .lock()
            .unwrap()
            .files
            .get(&file_id)
            .map(|e| e.name.clone())
    }

    fn restore_file_by_id(&self, file_id: u64) -> Result<Option<String>> {
        if self.exists(file_id) {
            return Ok(self.file_name(file_id));
        }
        for ent in fs::read_dir(&self.dir)? {
            let ent = ent?;
            let Some(fname) = ent.file_name().to_str().map(|s| s.to_string()) else {
                continue;
            };
            let Some((id, name)) = parse_data_file_name(&fname) else {
                continue;
            };
            if id != file_id {
                continue;
            }
            let mut inner = self.inner.lock().unwrap();
            if inner.by_name.contains_key(&name) {
                warn!(
                    "restore_file_by_id: name '{}' of file {} is taken by another file",
                    name, file_id
                );
                return Ok(None);
            }
            let file = open_data_file(&ent.path(), false)?;
            let pages = file.metadata()?.len() / self.page_size as u64;
            inner.files.insert(
                file_id,
                FileEntry {
                    name: name.clone(),
                    file,
                    pages,
                },
            );
            inner.by_name.insert(name.clone(), file_id);
            inner.next_file_id = inner.next_file_id.max(file_id + 1);
            self.persist_registry(&inner)?;
            debug!("restore_file_by_id: {} -> '{}'", file_id, name);
            return Ok(Some(name));
        }
        Ok(None)
    }

    fn flush(&self) -> Result<()> {
        self.wal.flush()?;
        let mut inner = self.inner.lock().unwrap();
        let keys: Vec<(u64, u64)> = inner.dirty.keys().copied().collect();
        self.write_out(&mut inner, &keys)?;
        self.persist_registry(&inner)
    }

    fn sync_data_files(&self, upto_segment: u64, metadata: Option<&[u8]>) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let keys: Vec<(u64, u64)> = inner
            .dirty
            .iter()
            .filter(|(_, d)| d.segment.map_or(false, |s| s < upto_segment))
            .map(|(k, _)| *k)
            .collect();
        self.write_out(&mut inner, &keys)?;
        if self.data_fsync {
            for e in inner.files.values() {
                e.file.sync_data()?;
            }
        }
        if let Some(m) = metadata {
            inner.last_metadata = Some(m.to_vec());
        }
        self.persist_registry(&inner)?;
        debug!(
            "sync_data_files: flushed {} page(s) below segment {}",
            keys.len(),
            upto_segment
        );
        Ok(())
    }

    fn min_not_flushed_segment(&self) -> Option<u64> {
        self.inner
            .lock()
            .unwrap()
            .dirty
            .values()
            .filter_map(|d| d.segment)
            .min()
    }

    fn restore_mode_on(&self) {
        self.restore_mode.store(true, Ordering::Relaxed);
    }

    fn restore_mode_off(&self) {
        self.restore_mode.store(false, Ordering::Relaxed);
    }

    fn last_synced_metadata(&self) -> Option<Vec<u8>> {
        self.inner.lock().unwrap().last_metadata.clone()
    }

    fn check_stored_pages(&self, listener: &mut dyn FnMut(&str)) -> Result<Vec<BrokenPage>> {
        let inner = self.inner.lock().unwrap();
        let mut broken = Vec::new();
        for (id, e) in &inner.files {
            let on_disk = e.file.metadata()?.len() / self.page_size as u64;
            listener(&format!(
                "checking '{}' (id={}, pages={})",
                e.name, id, on_disk
            ));
            for idx in 0..on_disk {
                if let Err(err) = self.read_from_disk(e, *id, idx) {
                    let reason = format!("{:#}", err);
                    listener(&format!("broken page {}:{} ('{}'): {}", id, idx, e.name, reason));
                    broken.push(BrokenPage {
                        file_id: *id,
                        file_name: e.name.clone(),
                        page_index: idx,
                        reason,
                    });
                }
            }
        }
        Ok(broken)
    }

    fn close(&self) -> Result<()> {
        self.flush()
    }

    fn delete(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.files.clear();
        inner.by_name.clear();
        inner.dirty.clear();
        match fs::remove_dir_all(&self.dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(anyhow!("remove {}: {}", self.dir.display(), e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::StorageMetrics;
    use crate::wal::WalRecord;

    fn scratch(prefix: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "strata-cache-{}-{}-{}",
            prefix,
            std::process::id(),
            rand::random::<u32>()
        ))
    }

    #[test]
    fn dirty_segment_tracking_and_sync() -> Result<()> {
        let root = scratch("sync");
        let wal = Arc::new(WriteAheadLog::open(
            &root.join("wal"),
            1 << 20,
            false,
            Arc::new(StorageMetrics::new()),
        )?);
        let cache = FilePageCache::open(&root, 1024, false, 16, wal.clone())?;
        let fid = cache.add_file("t.pcl")?;

        let mut p = cache.allocate_new_page(fid)?;
        p.set_u64(0, 99)?;
        let lsn = wal.log(&WalRecord::Empty)?;
        p.set_lsn(lsn);
        cache.release_from_write(p, lsn)?;
        assert_eq!(cache.min_not_flushed_segment(), Some(lsn.segment));

        // страница в сегменте 1 не попадает под sync < 1
        cache.sync_data_files(lsn.segment, None)?;
        assert_eq!(cache.dirty_pages(), 1);
        cache.sync_data_files(lsn.segment + 1, Some(b"m"))?;
        assert_eq!(cache.dirty_pages(), 0);
        assert_eq!(cache.min_not_flushed_segment(), None);
        assert_eq!(cache.last_synced_metadata(), Some(b"m".to_vec()));

        let back = cache.load_for_read(fid, 0)?;
        assert_eq!(back.get_u64(0)?, 99);
        assert_eq!(back.lsn(), lsn);
        let _ = fs::remove_dir_all(&root);
        Ok(())
    }

    #[test]
    fn data_file_name_parse() {
        assert_eq!(
            parse_data_file_name(&data_file_name(12, "users.pcl")),
            Some((12, "users.pcl".to_string()))
        );
        assert_eq!(parse_data_file_name("files.json"), None);
    }
}
