//! page — формат страницы данных и буфер страницы.
//!
//! Layout (LE):
//! - [0..4)   MAGIC "STPG"
//! - [4..6)   version u16
//! - [6..8)   flags u16 (резерв)
//! - [8..16)  lsn.segment u64   — LSN последнего применённого UpdatePage
//! - [16..24) lsn.position u64
//! - [24..ps-8) тело страницы (формат задаёт владелец файла: кластер, индекс)
//! - [ps-8..ps) трейлер CRC32C (см. checksum.rs)
//!
//! Подмодули:
//! - checksum.rs — трейлер CRC32C.
//! - changes.rs  — бинарный diff тела страницы для WAL (UpdatePage).

pub mod changes;
pub mod checksum;

use anyhow::{anyhow, Result};
use byteorder::{ByteOrder, LittleEndian};

pub use changes::PageChanges;
pub use checksum::{page_update_checksum, page_verify_checksum};

use crate::consts::{PAGE_HDR_SIZE, PAGE_MAGIC, PAGE_TRAILER_SIZE, PAGE_VERSION};
use crate::lsn::Lsn;

const OFF_VERSION: usize = 4;
const OFF_LSN_SEG: usize = 8;
const OFF_LSN_POS: usize = 16;

/// Инициализировать пустую страницу (magic/version, LSN=0, тело нулями).
pub fn page_init(buf: &mut [u8]) {
    for b in buf.iter_mut() {
        *b = 0;
    }
    buf[0..4].copy_from_slice(PAGE_MAGIC);
    LittleEndian::write_u16(&mut buf[OFF_VERSION..OFF_VERSION + 2], PAGE_VERSION);
}

#[inline]
pub fn page_lsn(buf: &[u8]) -> Lsn {
    Lsn::new(
        LittleEndian::read_u64(&buf[OFF_LSN_SEG..OFF_LSN_SEG + 8]),
        LittleEndian::read_u64(&buf[OFF_LSN_POS..OFF_LSN_POS + 8]),
    )
}

#[inline]
pub fn page_set_lsn(buf: &mut [u8], lsn: Lsn) {
    LittleEndian::write_u64(&mut buf[OFF_LSN_SEG..OFF_LSN_SEG + 8], lsn.segment);
    LittleEndian::write_u64(&mut buf[OFF_LSN_POS..OFF_LSN_POS + 8], lsn.position);
}

/// Страница из нулей (выделена в файле, но никогда не записывалась).
pub fn page_is_blank(buf: &[u8]) -> bool {
    buf.iter().all(|b| *b == 0)
}

/// Буфер одной страницы файла `file_id` с индексом `index`.
///
/// Все смещения в аксессорах отсчитываются от начала тела страницы.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    file_id: u64,
    index: u64,
    buf: Vec<u8>,
}

impl Page {
    pub fn new(file_id: u64, index: u64, page_size: usize) -> Self {
        let mut buf = vec![0u8; page_size];
        page_init(&mut buf);
        Self {
            file_id,
            index,
            buf,
        }
    }

    /// Обернуть прочитанный с диска буфер. Пустая (нулевая) страница инициализируется.
    pub fn from_bytes(file_id: u64, index: u64, mut buf: Vec<u8>) -> Self {
        if page_is_blank(&buf) {
            page_init(&mut buf);
        }
        Self {
            file_id,
            index,
            buf,
        }
    }

    #[inline]
    pub fn file_id(&self) -> u64 {
        self.file_id
    }

    #[inline]
    pub fn index(&self) -> u64 {
        self.index
    }

    #[inline]
    pub fn lsn(&self) -> Lsn {
        page_lsn(&self.buf)
    }

    #[inline]
    pub fn set_lsn(&mut self, lsn: Lsn) {
        page_set_lsn(&mut self.buf, lsn)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    /// Диапазон тела внутри буфера: [PAGE_HDR_SIZE .. ps - trailer).
    #[inline]
    pub fn body_range(&self) -> (usize, usize) {
        (PAGE_HDR_SIZE, self.buf.len() - PAGE_TRAILER_SIZE)
    }

    #[inline]
    pub fn body_len(&self) -> usize {
        self.buf.len() - PAGE_HDR_SIZE - PAGE_TRAILER_SIZE
    }

    #[inline]
    fn at(&self, off: usize, len: usize) -> Result<usize> {
        if off + len > self.body_len() {
            return Err(anyhow!(
                "page {}:{} body access [{}..{}) out of bounds ({})",
                self.file_id,
                self.index,
                off,
                off + len,
                self.body_len()
            ));
        }
        Ok(PAGE_HDR_SIZE + off)
    }

    pub fn get_u8(&self, off: usize) -> Result<u8> {
        let p = self.at(off, 1)?;
        Ok(self.buf[p])
    }

    pub fn set_u8(&mut self, off: usize, v: u8) -> Result<()> {
        let p = self.at(off, 1)?;
        self.buf[p] = v;
        Ok(())
    }

    pub fn get_u16(&self, off: usize) -> Result<u16> {
        let p = self.at(off, 2)?;
        Ok(LittleEndian::read_u16(&self.buf[p..p + 2]))
    }

    pub fn set_u16(&mut self, off: usize, v: u16) -> Result<()> {
        let p = self.at(off, 2)?;
        LittleEndian::write_u16(&mut self.buf[p..p + 2], v);
        Ok(())
    }

    pub fn get_u32(&self, off: usize) -> Result<u32> {
        let p = self.at(off, 4)?;
        Ok(LittleEndian::read_u32(&self.buf[p..p + 4]))
    }

    pub fn set_u32(&mut self, off: usize, v: u32) -> Result<()> {
        let p = self.at(off, 4)?;
        LittleEndian::write_u32(&mut self.buf[p..p + 4], v);
        Ok(())
    }

    pub fn get_i32(&self, off: usize) -> Result<i32> {
        let p = self.at(off, 4)?;
        Ok(LittleEndian::read_i32(&self.buf[p..p + 4]))
    }

    pub fn set_i32(&mut self, off: usize, v: i32) -> Result<()> {
        let p = self.at(off, 4)?;
        LittleEndian::write_i32(&mut self.buf[p..p + 4], v);
        Ok(())
    }

    pub fn get_u64(&self, off: usize) -> Result<u64> {
        let p = self.at(off, 8)?;
        Ok(LittleEndian::read_u64(&self.buf[p..p + 8]))
    }

    pub fn set_u64(&mut self, off: usize, v: u64) -> Result<()> {
        let p = self.at(off, 8)?;
        LittleEndian::write_u64(&mut self.buf[p..p + 8], v);
        Ok(())
    }

    pub fn get_bytes(&self, off: usize, len: usize) -> Result<&[u8]> {
        let p = self.at(off, len)?;
        Ok(&self.buf[p..p + len])
    }

    pub fn set_bytes(&mut self, off: usize, data: &[u8]) -> Result<()> {
        let p = self.at(off, data.len())?;
        self.buf[p..p + data.len()].copy_from_slice(data);
        Ok(())
    }

    /// Сдвинуть участок тела [from .. from+len) на позицию `to` (memmove).
    pub fn move_bytes(&mut self, from: usize, to: usize, len: usize) -> Result<()> {
        let src = self.at(from, len)?;
        let dst = self.at(to, len)?;
        self.buf.copy_within(src..src + len, dst);
        Ok(())
    }

    /// Занулить тело страницы (заголовок и LSN сохраняются).
    pub fn clear_body(&mut self) {
        let (a, b) = self.body_range();
        for x in &mut self.buf[a..b] {
            *x = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_accessors_and_lsn() -> Result<()> {
        let mut p = Page::new(7, 2, 1024);
        assert_eq!(p.lsn(), Lsn::ZERO);
        p.set_u64(0, 42)?;
        p.set_i32(8, -5)?;
        p.set_bytes(12, b"abc")?;
        assert_eq!(p.get_u64(0)?, 42);
        assert_eq!(p.get_i32(8)?, -5);
        assert_eq!(p.get_bytes(12, 3)?, b"abc");
        assert!(p.set_u64(p.body_len() - 4, 1).is_err());

        p.set_lsn(Lsn::new(3, 160));
        assert_eq!(page_lsn(p.as_bytes()), Lsn::new(3, 160));
        Ok(())
    }

    #[test]
    fn blank_page_is_initialized() {
        let p = Page::from_bytes(1, 0, vec![0u8; 1024]);
        assert_eq!(&p.as_bytes()[0..4], PAGE_MAGIC);
    }
}
