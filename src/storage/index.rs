//! storage/index — контракт индексного движка и страничный хэш-индекс.
//!
//! HashIndex, файл `<name>.hix`:
//! - page 0: [magic u32 "HIX1"][unique u8][pad 3][buckets u32][pad u32]
//!           [size u64][free_head u64][bucket heads: buckets × u64]
//! - страница бакета: [next u64][count u32][used u32] затем записи
//!   [key_len u16][key][cluster i32][position i64]
//!
//! unique: put заменяет значение ключа; multi: пара (key, rid) хранится один раз.
//! Пустые страницы бакета остаются в цепочке до clear().

use anyhow::{anyhow, Result};
use byteorder::{ByteOrder, LittleEndian};
use std::hash::Hasher;
use twox_hash::XxHash64;

use super::Rid;
use crate::atomic::AtomicOperation;
use crate::cache::PageSource;
use crate::consts::{HASH_INDEX_EXT, NO_PAGE, PAGE_HDR_SIZE, PAGE_TRAILER_SIZE};
use crate::error::StorageError;

/// Транзакционный контракт индексного движка.
pub trait IndexEngine: Send + Sync {
    fn name(&self) -> &str;

    fn is_unique(&self) -> bool;

    fn put(&self, op: &mut AtomicOperation, key: &[u8], rid: Rid) -> Result<()>;

    /// rid = None — удалить все значения ключа. true — что-то удалено.
    fn remove(&self, op: &mut AtomicOperation, key: &[u8], rid: Option<Rid>) -> Result<bool>;

    fn clear(&self, op: &mut AtomicOperation) -> Result<()>;

    fn get(&self, src: &dyn PageSource, key: &[u8]) -> Result<Vec<Rid>>;

    fn size(&self, src: &dyn PageSource) -> Result<u64>;

    /// Удалить файлы движка.
    fn delete(&self, op: &mut AtomicOperation) -> Result<()>;

    /// Ключ компонентного лока.
    fn lock_key(&self) -> String {
        format!("index:{}", self.name())
    }
}

const MAGIC: u32 = 0x3158_4948; // "HIX1"
const OFF_MAGIC: usize = 0;
const OFF_UNIQUE: usize = 4;
const OFF_BUCKETS: usize = 8;
const OFF_SIZE: usize = 16;
const OFF_FREE_HEAD: usize = 24;
const OFF_HEADS: usize = 32;

const B_NEXT: usize = 0;
const B_COUNT: usize = 8;
const B_USED: usize = 12;
const B_HDR: usize = 16;
const RID_BYTES: usize = 12;

#[derive(Debug, Clone)]
pub struct HashIndex {
    name: String,
    file_id: u64,
    unique: bool,
    buckets: u32,
}

#[inline]
fn body_len(page_size: usize) -> usize {
    page_size - PAGE_HDR_SIZE - PAGE_TRAILER_SIZE
}

fn bucket_of(key: &[u8], buckets: u32) -> u32 {
    let mut h = XxHash64::with_seed(0x1D3);
    h.write(key);
    (h.finish() % buckets as u64) as u32
}

fn encode_entries(entries: &[(Vec<u8>, Rid)]) -> Vec<u8> {
    let mut out = Vec::new();
    for (k, r) in entries {
        let mut b = [0u8; 2];
        LittleEndian::write_u16(&mut b, k.len() as u16);
        out.extend_from_slice(&b);
        out.extend_from_slice(k);
        let mut rb = [0u8; RID_BYTES];
        LittleEndian::write_i32(&mut rb[0..4], r.cluster_id);
        LittleEndian::write_i64(&mut rb[4..12], r.position);
        out.extend_from_slice(&rb);
    }
    out
}

fn decode_entries(raw: &[u8], count: u32) -> Result<Vec<(Vec<u8>, Rid)>> {
    let mut out = Vec::with_capacity(count as usize);
    let mut off = 0usize;
    for _ in 0..count {
        if off + 2 > raw.len() {
            return Err(anyhow!("hash index bucket page: truncated entry header"));
        }
        let klen = LittleEndian::read_u16(&raw[off..off + 2]) as usize;
        off += 2;
        if off + klen + RID_BYTES > raw.len() {
            return Err(anyhow!("hash index bucket page: truncated entry"));
        }
        let key = raw[off..off + klen].to_vec();
        off += klen;
        let rid = Rid::new(
            LittleEndian::read_i32(&raw[off..off + 4]),
            LittleEndian::read_i64(&raw[off + 4..off + 12]),
        );
        off += RID_BYTES;
        out.push((key, rid));
    }
    Ok(out)
}

impl HashIndex {
    /// Максимальное число бакетов, чьи головы помещаются в заголовок.
    pub fn max_buckets(page_size: usize) -> u32 {
        ((body_len(page_size) - OFF_HEADS) / 8) as u32
    }

    pub fn max_key_len(page_size: usize) -> usize {
        (body_len(page_size) - B_HDR - 2 - RID_BYTES).min(u16::MAX as usize)
    }

    pub fn create(op: &mut AtomicOperation, name: &str, unique: bool, buckets: u32) -> Result<Self> {
        let buckets = buckets.clamp(1, Self::max_buckets(op.page_size()));
        let file_id = op.add_file(&format!("{}.{}", name, HASH_INDEX_EXT))?;
        let idx = op.add_page(file_id)?;
        let p = op.page_mut(file_id, idx)?;
        p.set_u32(OFF_MAGIC, MAGIC)?;
        p.set_u8(OFF_UNIQUE, unique as u8)?;
        p.set_u32(OFF_BUCKETS, buckets)?;
        p.set_u64(OFF_SIZE, 0)?;
        p.set_u64(OFF_FREE_HEAD, NO_PAGE)?;
        for b in 0..buckets as usize {
            p.set_u64(OFF_HEADS + b * 8, NO_PAGE)?;
        }
        Ok(Self {
            name: name.to_string(),
            file_id,
            unique,
            buckets,
        })
    }

    /// Открыть существующий индекс по заголовку файла.
    pub fn open(src: &dyn PageSource, name: &str, file_id: u64) -> Result<Self> {
        let h = src.read_page(file_id, 0)?;
        if h.get_u32(OFF_MAGIC)? != MAGIC {
            return Err(anyhow!("index '{}': bad header magic", name));
        }
        Ok(Self {
            name: name.to_string(),
            file_id,
            unique: h.get_u8(OFF_UNIQUE)? != 0,
            buckets: h.get_u32(OFF_BUCKETS)?.max(1),
        })
    }

    pub fn file_id(&self) -> u64 {
        self.file_id
    }

    pub fn buckets(&self) -> u32 {
        self.buckets
    }

    fn head_off(&self, bucket: u32) -> usize {
        OFF_HEADS + bucket as usize * 8
    }

    fn read_bucket_page(src: &dyn PageSource, file_id: u64, page: u64) -> Result<(u64, Vec<(Vec<u8>, Rid)>)> {
        let p = src.read_page(file_id, page)?;
        let count = p.get_u32(B_COUNT)?;
        let used = p.get_u32(B_USED)? as usize;
        let raw = p.get_bytes(B_HDR, used)?;
        Ok((p.get_u64(B_NEXT)?, decode_entries(raw, count)?))
    }

    fn write_bucket_entries(
        &self,
        op: &mut AtomicOperation,
        page: u64,
        entries: &[(Vec<u8>, Rid)],
    ) -> Result<()> {
        let raw = encode_entries(entries);
        let p = op.page_mut(self.file_id, page)?;
        let next = p.get_u64(B_NEXT)?;
        p.clear_body();
        p.set_u64(B_NEXT, next)?;
        p.set_u32(B_COUNT, entries.len() as u32)?;
        p.set_u32(B_USED, raw.len() as u32)?;
        p.set_bytes(B_HDR, &raw)
    }

    fn chain(&self, src: &dyn PageSource, bucket: u32) -> Result<Vec<u64>> {
        let h = src.read_page(self.file_id, 0)?;
        let limit = src.pages_in_file(self.file_id)?;
        let mut cur = h.get_u64(self.head_off(bucket))?;
        let mut out = Vec::new();
        while cur != NO_PAGE {
            if out.len() as u64 > limit {
                return Err(anyhow!("index '{}': bucket {} chain is cyclic", self.name, bucket));
            }
            out.push(cur);
            cur = src.read_page(self.file_id, cur)?.get_u64(B_NEXT)?;
        }
        Ok(out)
    }

    fn add_size(&self, op: &mut AtomicOperation, delta: i64) -> Result<()> {
        let h = op.page_mut(self.file_id, 0)?;
        let n = h.get_u64(OFF_SIZE)? as i64 + delta;
        h.set_u64(OFF_SIZE, n.max(0) as u64)
    }

    fn alloc_bucket_page(&self, op: &mut AtomicOperation, bucket: u32) -> Result<u64> {
        let free = op.page_mut(self.file_id, 0)?.get_u64(OFF_FREE_HEAD)?;
        let page = if free == NO_PAGE {
            op.add_page(self.file_id)?
        } else {
            let next_free = op.page_mut(self.file_id, free)?.get_u64(B_NEXT)?;
            op.page_mut(self.file_id, 0)?.set_u64(OFF_FREE_HEAD, next_free)?;
            free
        };
        let head_off = self.head_off(bucket);
        let old_head = op.page_mut(self.file_id, 0)?.get_u64(head_off)?;
        let p = op.page_mut(self.file_id, page)?;
        p.clear_body();
        p.set_u64(B_NEXT, old_head)?;
        op.page_mut(self.file_id, 0)?.set_u64(head_off, page)?;
        Ok(page)
    }

    fn insert(&self, op: &mut AtomicOperation, key: &[u8], rid: Rid) -> Result<()> {
        let need = 2 + key.len() + RID_BYTES;
        let cap = body_len(op.page_size()) - B_HDR;
        let bucket = bucket_of(key, self.buckets);
        for page in self.chain(&*op, bucket)? {
            let (_, mut entries) = Self::read_bucket_page(&*op, self.file_id, page)?;
            let used = encode_entries(&entries).len();
            if cap - used >= need {
                entries.push((key.to_vec(), rid));
                return self.write_bucket_entries(op, page, &entries);
            }
        }
        let page = self.alloc_bucket_page(op, bucket)?;
        self.write_bucket_entries(op, page, &[(key.to_vec(), rid)])
    }

    /// Удалить совпадающие записи ключа; возвращает число удалённых.
    fn remove_matching(&self, op: &mut AtomicOperation, key: &[u8], rid: Option<Rid>) -> Result<u64> {
        let bucket = bucket_of(key, self.buckets);
        let mut removed = 0u64;
        for page in self.chain(&*op, bucket)? {
            let (_, entries) = Self::read_bucket_page(&*op, self.file_id, page)?;
            let before = entries.len();
            let kept: Vec<(Vec<u8>, Rid)> = entries
                .into_iter()
                .filter(|(k, r)| !(k.as_slice() == key && rid.map_or(true, |x| x == *r)))
                .collect();
            if kept.len() != before {
                removed += (before - kept.len()) as u64;
                self.write_bucket_entries(op, page, &kept)?;
            }
        }
        Ok(removed)
    }

    fn check_key(&self, op: &AtomicOperation, key: &[u8]) -> Result<()> {
        let max = Self::max_key_len(op.page_size());
        if key.len() > max {
            return Err(StorageError::IllegalArgument(format!(
                "index '{}': key of {} bytes exceeds limit {}",
                self.name,
                key.len(),
                max
            ))
            .into());
        }
        Ok(())
    }
}

impl IndexEngine for HashIndex {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_unique(&self) -> bool {
        self.unique
    }

    fn put(&self, op: &mut AtomicOperation, key: &[u8], rid: Rid) -> Result<()> {
        self.check_key(op, key)?;
        if self.unique {
            let removed = self.remove_matching(op, key, None)?;
            self.insert(op, key, rid)?;
            return self.add_size(op, 1 - removed as i64);
        }
        if self.get(&*op, key)?.contains(&rid) {
            return Ok(());
        }
        self.insert(op, key, rid)?;
        self.add_size(op, 1)
    }

    fn remove(&self, op: &mut AtomicOperation, key: &[u8], rid: Option<Rid>) -> Result<bool> {
        let removed = self.remove_matching(op, key, rid)?;
        if removed > 0 {
            self.add_size(op, -(removed as i64))?;
        }
        Ok(removed > 0)
    }

    fn clear(&self, op: &mut AtomicOperation) -> Result<()> {
        for bucket in 0..self.buckets {
            for page in self.chain(&*op, bucket)? {
                let free = op.page_mut(self.file_id, 0)?.get_u64(OFF_FREE_HEAD)?;
                let p = op.page_mut(self.file_id, page)?;
                p.clear_body();
                p.set_u64(B_NEXT, free)?;
                op.page_mut(self.file_id, 0)?.set_u64(OFF_FREE_HEAD, page)?;
            }
            let off = self.head_off(bucket);
            op.page_mut(self.file_id, 0)?.set_u64(off, NO_PAGE)?;
        }
        op.page_mut(self.file_id, 0)?.set_u64(OFF_SIZE, 0)
    }

    fn get(&self, src: &dyn PageSource, key: &[u8]) -> Result<Vec<Rid>> {
        let mut out = Vec::new();
        for page in self.chain(src, bucket_of(key, self.buckets))? {
            let (_, entries) = Self::read_bucket_page(src, self.file_id, page)?;
            out.extend(
                entries
                    .into_iter()
                    .filter(|(k, _)| k.as_slice() == key)
                    .map(|(_, r)| r),
            );
        }
        Ok(out)
    }

    fn size(&self, src: &dyn PageSource) -> Result<u64> {
        src.read_page(self.file_id, 0)?.get_u64(OFF_SIZE)
    }

    fn delete(&self, op: &mut AtomicOperation) -> Result<()> {
        op.delete_file(self.file_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entries_codec_and_bucket_spread() -> Result<()> {
        let e = vec![
            (b"alpha".to_vec(), Rid::new(3, 1)),
            (Vec::new(), Rid::new(-1, -2)),
        ];
        let raw = encode_entries(&e);
        assert_eq!(raw.len(), 2 + 5 + 12 + 2 + 12);
        assert_eq!(decode_entries(&raw, 2)?, e);
        assert!(decode_entries(&raw[..10], 2).is_err());

        let mut seen = std::collections::HashSet::new();
        for i in 0..200u32 {
            seen.insert(bucket_of(&i.to_le_bytes(), 16));
        }
        assert!(seen.len() > 8);
        assert!(HashIndex::max_buckets(1024) >= 64);
        Ok(())
    }
}
