//! storage/cluster — PagedCluster: карта позиций + цепочки страниц данных.
//!
//! Файлы кластера `<name>`:
//! - `<name>.cpm` — карта позиций.
//!   page 0: [magic u32 "CPM1"][cluster_id i32][next_position u64][filled u64]
//!   page 1..: записи по ENTRY_SIZE байт:
//!   [status u8][version i32][data_page u64][len u32][record_type u8]
//! - `<name>.pcl` — данные.
//!   page 0: [magic u32 "PCL1"][pad u32][free_head u64]
//!   page k: [next u64][used u32][pad u32][bytes...]
//!
//! Статусы записи: 0 пусто, 1 выделена, 2 заполнена, 3 удалена.
//! Позиции не переиспользуются: удалённая позиция остаётся REMOVED навсегда.
//! Все изменения идут через AtomicOperation; чтения — через PageSource.

use anyhow::{anyhow, Result};

use super::rid::{PhysicalPosition, Rid};
use crate::atomic::AtomicOperation;
use crate::cache::PageSource;
use crate::consts::{CLUSTER_DATA_EXT, CLUSTER_MAP_EXT, NO_PAGE, PAGE_HDR_SIZE, PAGE_TRAILER_SIZE};
use crate::error::StorageError;

const MAP_MAGIC: u32 = 0x3150_4D43; // "CPM1"
const DATA_MAGIC: u32 = 0x314C_4350; // "PCL1"

const MAP_OFF_MAGIC: usize = 0;
const MAP_OFF_CLUSTER: usize = 4;
const MAP_OFF_NEXT: usize = 8;
const MAP_OFF_FILLED: usize = 16;

const ENTRY_SIZE: usize = 18;
const E_STATUS: usize = 0;
const E_VERSION: usize = 1;
const E_DATA_PAGE: usize = 5;
const E_LEN: usize = 13;
const E_TYPE: usize = 17;

const DATA_OFF_MAGIC: usize = 0;
const DATA_OFF_FREE_HEAD: usize = 8;
const DATA_HDR: usize = 16;

const STATUS_ALLOCATED: u8 = 1;
const STATUS_FILLED: u8 = 2;
const STATUS_REMOVED: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct MapEntry {
    status: u8,
    version: i32,
    data_page: u64,
    len: u32,
    record_type: u8,
}

/// Содержимое записи, прочитанное из кластера.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    pub content: Vec<u8>,
    pub version: i32,
    pub record_type: u8,
}

#[derive(Debug, Clone)]
pub struct PagedCluster {
    id: i32,
    name: String,
    map_file: u64,
    data_file: u64,
}

#[inline]
fn body_len(page_size: usize) -> usize {
    page_size - PAGE_HDR_SIZE - PAGE_TRAILER_SIZE
}

impl PagedCluster {
    /// Создать файлы кластера внутри операции.
    pub fn create(op: &mut AtomicOperation, id: i32, name: &str) -> Result<Self> {
        let map_file = op.add_file(&format!("{}.{}", name, CLUSTER_MAP_EXT))?;
        let data_file = op.add_file(&format!("{}.{}", name, CLUSTER_DATA_EXT))?;

        let h = op.add_page(map_file)?;
        let p = op.page_mut(map_file, h)?;
        p.set_u32(MAP_OFF_MAGIC, MAP_MAGIC)?;
        p.set_i32(MAP_OFF_CLUSTER, id)?;
        p.set_u64(MAP_OFF_NEXT, 0)?;
        p.set_u64(MAP_OFF_FILLED, 0)?;

        let d = op.add_page(data_file)?;
        let p = op.page_mut(data_file, d)?;
        p.set_u32(DATA_OFF_MAGIC, DATA_MAGIC)?;
        p.set_u64(DATA_OFF_FREE_HEAD, NO_PAGE)?;

        Ok(Self {
            id,
            name: name.to_string(),
            map_file,
            data_file,
        })
    }

    /// Хэндл существующего кластера (из реестра).
    pub fn open(id: i32, name: &str, map_file: u64, data_file: u64) -> Self {
        Self {
            id,
            name: name.to_string(),
            map_file,
            data_file,
        }
    }

    /// Проверить заголовки обоих файлов.
    pub fn verify(&self, src: &dyn PageSource) -> Result<()> {
        let h = src.read_page(self.map_file, 0)?;
        if h.get_u32(MAP_OFF_MAGIC)? != MAP_MAGIC || h.get_i32(MAP_OFF_CLUSTER)? != self.id {
            return Err(anyhow!(
                "cluster '{}' ({}): bad position map header",
                self.name,
                self.id
            ));
        }
        let d = src.read_page(self.data_file, 0)?;
        if d.get_u32(DATA_OFF_MAGIC)? != DATA_MAGIC {
            return Err(anyhow!("cluster '{}' ({}): bad data header", self.name, self.id));
        }
        Ok(())
    }

    pub fn delete(&self, op: &mut AtomicOperation) -> Result<()> {
        op.delete_file(self.map_file)?;
        op.delete_file(self.data_file)
    }

    #[inline]
    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn map_file(&self) -> u64 {
        self.map_file
    }

    pub fn data_file(&self) -> u64 {
        self.data_file
    }

    /// Ключ компонентного лока кластера.
    pub fn lock_key(&self) -> String {
        format!("cluster:{}", self.id)
    }

    #[inline]
    fn rid(&self, position: i64) -> Rid {
        Rid::new(self.id, position)
    }

    fn entry_loc(&self, page_size: usize, position: i64) -> (u64, usize) {
        let per_page = (body_len(page_size) / ENTRY_SIZE) as u64;
        let p = position as u64;
        (1 + p / per_page, (p % per_page) as usize * ENTRY_SIZE)
    }

    // ---------------- position map ----------------

    pub fn next_position(&self, src: &dyn PageSource) -> Result<i64> {
        Ok(src.read_page(self.map_file, 0)?.get_u64(MAP_OFF_NEXT)? as i64)
    }

    /// Число заполненных (видимых) записей.
    pub fn entries(&self, src: &dyn PageSource) -> Result<u64> {
        src.read_page(self.map_file, 0)?.get_u64(MAP_OFF_FILLED)
    }

    fn read_entry(&self, src: &dyn PageSource, position: i64) -> Result<Option<MapEntry>> {
        let h = src.read_page(self.map_file, 0)?;
        if position < 0 || position >= h.get_u64(MAP_OFF_NEXT)? as i64 {
            return Ok(None);
        }
        let (page, off) = self.entry_loc(h.as_bytes().len(), position);
        let p = src.read_page(self.map_file, page)?;
        Ok(Some(MapEntry {
            status: p.get_u8(off + E_STATUS)?,
            version: p.get_i32(off + E_VERSION)?,
            data_page: p.get_u64(off + E_DATA_PAGE)?,
            len: p.get_u32(off + E_LEN)?,
            record_type: p.get_u8(off + E_TYPE)?,
        }))
    }

    fn write_entry(&self, op: &mut AtomicOperation, position: i64, e: &MapEntry) -> Result<()> {
        let (page, off) = self.entry_loc(op.page_size(), position);
        while op.filled_up_to(self.map_file)? <= page {
            op.add_page(self.map_file)?;
        }
        let p = op.page_mut(self.map_file, page)?;
        p.set_u8(off + E_STATUS, e.status)?;
        p.set_i32(off + E_VERSION, e.version)?;
        p.set_u64(off + E_DATA_PAGE, e.data_page)?;
        p.set_u32(off + E_LEN, e.len)?;
        p.set_u8(off + E_TYPE, e.record_type)?;
        Ok(())
    }

    fn filled_entry(&self, src: &dyn PageSource, position: i64) -> Result<MapEntry> {
        match self.read_entry(src, position)? {
            Some(e) if e.status == STATUS_FILLED => Ok(e),
            _ => Err(StorageError::RecordNotFound(self.rid(position)).into()),
        }
    }

    fn add_filled(&self, op: &mut AtomicOperation, delta: i64) -> Result<()> {
        let h = op.page_mut(self.map_file, 0)?;
        let n = h.get_u64(MAP_OFF_FILLED)? as i64 + delta;
        h.set_u64(MAP_OFF_FILLED, n.max(0) as u64)
    }

    /// Зарезервировать следующую позицию (запись ещё не видна).
    pub fn allocate_position(
        &self,
        op: &mut AtomicOperation,
        record_type: u8,
    ) -> Result<PhysicalPosition> {
        let position = self.next_position(&*op)?;
        self.write_entry(
            op,
            position,
            &MapEntry {
                status: STATUS_ALLOCATED,
                version: 0,
                data_page: NO_PAGE,
                len: 0,
                record_type,
            },
        )?;
        op.page_mut(self.map_file, 0)?
            .set_u64(MAP_OFF_NEXT, position as u64 + 1)?;
        Ok(PhysicalPosition {
            cluster_position: position,
            record_version: 0,
            record_type,
            record_size: 0,
        })
    }

    /// Записать новую запись: в заранее выделенную позицию или в следующую свободную.
    pub fn create_record(
        &self,
        op: &mut AtomicOperation,
        content: &[u8],
        version: i32,
        record_type: u8,
        allocated: Option<&PhysicalPosition>,
    ) -> Result<PhysicalPosition> {
        let position = match allocated {
            Some(pp) => {
                let e = self.read_entry(&*op, pp.cluster_position)?;
                if e.map(|e| e.status) != Some(STATUS_ALLOCATED) {
                    return Err(StorageError::IllegalArgument(format!(
                        "create_record: position {} is not allocated",
                        self.rid(pp.cluster_position)
                    ))
                    .into());
                }
                pp.cluster_position
            }
            None => self.allocate_position(op, record_type)?.cluster_position,
        };
        let first = self.write_chain(op, content)?;
        self.write_entry(
            op,
            position,
            &MapEntry {
                status: STATUS_FILLED,
                version,
                data_page: first,
                len: content.len() as u32,
                record_type,
            },
        )?;
        self.add_filled(op, 1)?;
        Ok(PhysicalPosition {
            cluster_position: position,
            record_version: version,
            record_type,
            record_size: content.len() as u32,
        })
    }

    pub fn update_record(
        &self,
        op: &mut AtomicOperation,
        position: i64,
        content: &[u8],
        version: i32,
        record_type: u8,
    ) -> Result<()> {
        let e = self.filled_entry(&*op, position)?;
        self.free_chain(op, e.data_page)?;
        let first = self.write_chain(op, content)?;
        self.write_entry(
            op,
            position,
            &MapEntry {
                status: STATUS_FILLED,
                version,
                data_page: first,
                len: content.len() as u32,
                record_type,
            },
        )
    }

    pub fn update_record_version(
        &self,
        op: &mut AtomicOperation,
        position: i64,
        version: i32,
    ) -> Result<()> {
        let mut e = self.filled_entry(&*op, position)?;
        e.version = version;
        self.write_entry(op, position, &e)
    }

    /// false — записи нет (или уже удалена).
    pub fn delete_record(&self, op: &mut AtomicOperation, position: i64) -> Result<bool> {
        let e = match self.read_entry(&*op, position)? {
            Some(e) if e.status == STATUS_FILLED => e,
            _ => return Ok(false),
        };
        self.free_chain(op, e.data_page)?;
        self.write_entry(
            op,
            position,
            &MapEntry {
                status: STATUS_REMOVED,
                version: e.version,
                data_page: NO_PAGE,
                len: 0,
                record_type: e.record_type,
            },
        )?;
        self.add_filled(op, -1)?;
        Ok(true)
    }

    pub fn get_physical_position(
        &self,
        src: &dyn PageSource,
        position: i64,
    ) -> Result<Option<PhysicalPosition>> {
        Ok(match self.read_entry(src, position)? {
            Some(e) if e.status == STATUS_FILLED => Some(PhysicalPosition {
                cluster_position: position,
                record_version: e.version,
                record_type: e.record_type,
                record_size: e.len,
            }),
            _ => None,
        })
    }

    pub fn read_record(&self, src: &dyn PageSource, position: i64) -> Result<Option<RawRecord>> {
        let e = match self.read_entry(src, position)? {
            Some(e) if e.status == STATUS_FILLED => e,
            _ => return Ok(None),
        };
        Ok(Some(RawRecord {
            content: self.read_chain(src, e.data_page, e.len)?,
            version: e.version,
            record_type: e.record_type,
        }))
    }

    pub fn exists(&self, src: &dyn PageSource, position: i64) -> Result<bool> {
        Ok(matches!(
            self.read_entry(src, position)?,
            Some(e) if e.status == STATUS_FILLED
        ))
    }

    /// Заполненные позиции по возрастанию.
    pub fn positions(&self, src: &dyn PageSource) -> Result<Vec<i64>> {
        let next = self.next_position(src)?;
        let mut out = Vec::new();
        for pos in 0..next {
            if let Some(e) = self.read_entry(src, pos)? {
                if e.status == STATUS_FILLED {
                    out.push(pos);
                }
            }
        }
        Ok(out)
    }

    // ---------------- data chains ----------------

    fn pop_free_page(&self, op: &mut AtomicOperation) -> Result<u64> {
        let head = op.page_mut(self.data_file, 0)?.get_u64(DATA_OFF_FREE_HEAD)?;
        if head == NO_PAGE {
            return op.add_page(self.data_file);
        }
        let next = op.page_mut(self.data_file, head)?.get_u64(0)?;
        op.page_mut(self.data_file, 0)?
            .set_u64(DATA_OFF_FREE_HEAD, next)?;
        Ok(head)
    }

    fn write_chain(&self, op: &mut AtomicOperation, content: &[u8]) -> Result<u64> {
        if content.is_empty() {
            return Ok(NO_PAGE);
        }
        let cap = body_len(op.page_size()) - DATA_HDR;
        let chunks: Vec<&[u8]> = content.chunks(cap).collect();
        let mut pages = Vec::with_capacity(chunks.len());
        for _ in 0..chunks.len() {
            pages.push(self.pop_free_page(op)?);
        }
        for (i, chunk) in chunks.iter().enumerate() {
            let next = pages.get(i + 1).copied().unwrap_or(NO_PAGE);
            let p = op.page_mut(self.data_file, pages[i])?;
            p.clear_body();
            p.set_u64(0, next)?;
            p.set_u32(8, chunk.len() as u32)?;
            p.set_bytes(DATA_HDR, chunk)?;
        }
        Ok(pages[0])
    }

    fn free_chain(&self, op: &mut AtomicOperation, first: u64) -> Result<()> {
        let limit = op.filled_up_to(self.data_file)?;
        let mut cur = first;
        let mut steps = 0u64;
        while cur != NO_PAGE {
            steps += 1;
            if steps > limit {
                return Err(anyhow!(
                    "cluster '{}': data chain from page {} is cyclic",
                    self.name,
                    first
                ));
            }
            let next = op.page_mut(self.data_file, cur)?.get_u64(0)?;
            let head = op.page_mut(self.data_file, 0)?.get_u64(DATA_OFF_FREE_HEAD)?;
            let p = op.page_mut(self.data_file, cur)?;
            p.clear_body();
            p.set_u64(0, head)?;
            op.page_mut(self.data_file, 0)?
                .set_u64(DATA_OFF_FREE_HEAD, cur)?;
            cur = next;
        }
        Ok(())
    }

    fn read_chain(&self, src: &dyn PageSource, first: u64, len: u32) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(len as usize);
        let limit = src.pages_in_file(self.data_file)?;
        let mut cur = first;
        let mut steps = 0u64;
        while cur != NO_PAGE && out.len() < len as usize {
            steps += 1;
            if steps > limit {
                return Err(anyhow!(
                    "cluster '{}': data chain from page {} is cyclic",
                    self.name,
                    first
                ));
            }
            let p = src.read_page(self.data_file, cur)?;
            let used = p.get_u32(8)? as usize;
            out.extend_from_slice(p.get_bytes(DATA_HDR, used)?);
            cur = p.get_u64(0)?;
        }
        if out.len() != len as usize {
            return Err(anyhow!(
                "cluster '{}': record chain from page {} holds {} bytes, expected {}",
                self.name,
                first,
                out.len(),
                len
            ));
        }
        Ok(out)
    }
}
