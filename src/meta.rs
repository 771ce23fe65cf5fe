// src/meta.rs — стартовые метаданные хранилища.
//
// Формат <root>/meta (LE):
// MAGIC8 = "STRMETA1"
// u32 version         = 1
// u32 page_size       (1 KiB..=1 MiB, power of two)
// u8  dirty           (1 = требуется восстановление из WAL при открытии)
// u8  non_tx_ops      (1 = в сессии выполнялись нетранзакционные операции)
// u64 instance_id_hi
// u64 instance_id_lo
// u64 created_at      (unix secs)
// u32 crc32           (crc32fast по всем предыдущим байтам)
//
// Политика:
// - Атомарная запись tmp+rename+fsync(dir).
// - dirty выставляется перед первой атомарной операцией после чекпоинта (DirtyFlag)
//   и снимается только полным чекпоинтом.

use anyhow::{anyhow, Context, Result};
use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::consts::{MAGIC, MAX_PAGE_SIZE, META_FILE, META_VERSION, MIN_PAGE_SIZE};
use crate::util::write_atomic;

const META_LEN: usize = 8 + 4 + 4 + 1 + 1 + 8 + 8 + 8 + 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartupMeta {
    pub version: u32,
    pub page_size: u32,
    pub dirty: bool,
    pub non_tx_operations: bool,
    pub instance_id: u128,
    pub created_at: u64,
}

impl StartupMeta {
    pub fn new(page_size: u32) -> Self {
        Self {
            version: META_VERSION,
            page_size,
            dirty: false,
            non_tx_operations: false,
            instance_id: rand::random::<u128>(),
            created_at: crate::util::now_secs(),
        }
    }

    pub fn instance_id_hex(&self) -> String {
        format!("{:032x}", self.instance_id)
    }
}

#[inline]
fn meta_path(root: &Path) -> PathBuf {
    root.join(META_FILE)
}

/// Проверка корректности размера страницы (2^n, 1 KiB .. 1 MiB).
pub fn validate_page_size(page_size: u32) -> Result<()> {
    if page_size < MIN_PAGE_SIZE
        || page_size > MAX_PAGE_SIZE
        || (page_size & (page_size - 1)) != 0
    {
        return Err(anyhow!(
            "page_size must be a power of two in [{} .. {}], got {}",
            MIN_PAGE_SIZE,
            MAX_PAGE_SIZE,
            page_size
        ));
    }
    Ok(())
}

fn encode(m: &StartupMeta) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(META_LEN);
    out.extend_from_slice(MAGIC);
    out.write_u32::<LittleEndian>(m.version)?;
    out.write_u32::<LittleEndian>(m.page_size)?;
    out.write_u8(m.dirty as u8)?;
    out.write_u8(m.non_tx_operations as u8)?;
    out.write_u64::<LittleEndian>((m.instance_id >> 64) as u64)?;
    out.write_u64::<LittleEndian>(m.instance_id as u64)?;
    out.write_u64::<LittleEndian>(m.created_at)?;
    let crc = crc32fast::hash(&out);
    out.write_u32::<LittleEndian>(crc)?;
    Ok(out)
}

/// Создать meta. Ошибка, если файл уже существует.
pub fn write_meta_new(root: &Path, m: &StartupMeta) -> Result<()> {
    validate_page_size(m.page_size)?;
    let path = meta_path(root);
    if path.exists() {
        return Err(anyhow!("meta already exists at {}", path.display()));
    }
    write_atomic(&path, &encode(m)?)
}

/// Перезаписать meta через tmp+rename.
pub fn write_meta_overwrite(root: &Path, m: &StartupMeta) -> Result<()> {
    validate_page_size(m.page_size)?;
    write_atomic(&meta_path(root), &encode(m)?)
}

pub fn read_meta(root: &Path) -> Result<StartupMeta> {
    let path = meta_path(root);
    let buf = fs::read(&path).with_context(|| format!("read meta {}", path.display()))?;
    if buf.len() < META_LEN {
        return Err(anyhow!(
            "meta at {} is truncated ({} < {} bytes)",
            path.display(),
            buf.len(),
            META_LEN
        ));
    }
    if &buf[0..8] != MAGIC {
        return Err(anyhow!("bad meta magic at {}", path.display()));
    }
    let stored = LittleEndian::read_u32(&buf[META_LEN - 4..META_LEN]);
    let actual = crc32fast::hash(&buf[..META_LEN - 4]);
    if stored != actual {
        return Err(anyhow!(
            "meta checksum mismatch at {} (stored={:#x}, actual={:#x})",
            path.display(),
            stored,
            actual
        ));
    }

    let version = LittleEndian::read_u32(&buf[8..12]);
    if version != META_VERSION {
        return Err(anyhow!("unsupported meta version {}", version));
    }
    let hi = LittleEndian::read_u64(&buf[18..26]) as u128;
    let lo = LittleEndian::read_u64(&buf[26..34]) as u128;
    Ok(StartupMeta {
        version,
        page_size: LittleEndian::read_u32(&buf[12..16]),
        dirty: buf[16] != 0,
        non_tx_operations: buf[17] != 0,
        instance_id: (hi << 64) | lo,
        created_at: LittleEndian::read_u64(&buf[34..42]),
    })
}

pub fn meta_exists(root: &Path) -> bool {
    meta_path(root).exists()
}

/// Выставить/снять флаг dirty (перечитать → изменить → атомарно записать).
pub fn set_dirty(root: &Path, dirty: bool) -> Result<()> {
    let mut m = read_meta(root)?;
    if m.dirty == dirty {
        return Ok(());
    }
    m.dirty = dirty;
    write_meta_overwrite(root, &m)
}

/// Выставить/снять флаг нетранзакционных операций.
pub fn set_non_tx_operations(root: &Path, on: bool) -> Result<()> {
    let mut m = read_meta(root)?;
    if m.non_tx_operations == on {
        return Ok(());
    }
    m.non_tx_operations = on;
    write_meta_overwrite(root, &m)
}

/// Кэш флага dirty поверх meta-файла: запись на диск только при смене значения.
///
/// make_dirty() вызывается до первой записи атомарной операции в WAL, clear() —
/// в конце полного чекпоинта. `root = None` — только в памяти (модульные тесты).
#[derive(Debug)]
pub struct DirtyFlag {
    root: Option<PathBuf>,
    dirty: AtomicBool,
    io: Mutex<()>,
}

impl DirtyFlag {
    pub fn new(root: &Path, dirty: bool) -> Self {
        Self {
            root: Some(root.to_path_buf()),
            dirty: AtomicBool::new(dirty),
            io: Mutex::new(()),
        }
    }

    pub fn in_memory() -> Self {
        Self {
            root: None,
            dirty: AtomicBool::new(false),
            io: Mutex::new(()),
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub fn make_dirty(&self) -> Result<()> {
        if self.is_dirty() {
            return Ok(());
        }
        let _g = self.io.lock().unwrap();
        if self.is_dirty() {
            return Ok(());
        }
        if let Some(root) = &self.root {
            set_dirty(root, true)?;
        }
        self.dirty.store(true, Ordering::Release);
        Ok(())
    }

    pub fn clear(&self) -> Result<()> {
        let _g = self.io.lock().unwrap();
        if let Some(root) = &self.root {
            set_dirty(root, false)?;
        }
        self.dirty.store(false, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meta_roundtrip_and_dirty_flag() -> Result<()> {
        let root = std::env::temp_dir().join(format!(
            "strata-meta-{}-{}",
            std::process::id(),
            rand::random::<u32>()
        ));
        fs::create_dir_all(&root)?;
        let m = StartupMeta::new(4096);
        write_meta_new(&root, &m)?;
        assert!(write_meta_new(&root, &m).is_err());

        let back = read_meta(&root)?;
        assert_eq!(back, m);

        set_dirty(&root, true)?;
        assert!(read_meta(&root)?.dirty);
        assert_eq!(read_meta(&root)?.instance_id, m.instance_id);

        // порча байта → checksum mismatch
        let p = root.join(META_FILE);
        let mut raw = fs::read(&p)?;
        raw[13] ^= 0xFF;
        fs::write(&p, raw)?;
        assert!(read_meta(&root).is_err());

        let _ = fs::remove_dir_all(&root);
        Ok(())
    }

    #[test]
    fn dirty_flag_writes_through() -> Result<()> {
        let root = std::env::temp_dir().join(format!(
            "strata-dirty-{}-{}",
            std::process::id(),
            rand::random::<u32>()
        ));
        fs::create_dir_all(&root)?;
        write_meta_new(&root, &StartupMeta::new(4096))?;
        let flag = DirtyFlag::new(&root, false);
        flag.make_dirty()?;
        assert!(read_meta(&root)?.dirty);
        flag.clear()?;
        assert!(!flag.is_dirty());
        assert!(!read_meta(&root)?.dirty);
        let _ = fs::remove_dir_all(&root);
        Ok(())
    }

    #[test]
    fn page_size_rules() {
        assert!(validate_page_size(4096).is_ok());
        assert!(validate_page_size(1000).is_err());
        assert!(validate_page_size(512).is_err());
    }
}
