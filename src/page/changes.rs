//! page/changes — бинарный diff страницы для записи UpdatePage.
//!
//! Набор изменений = упорядоченные непересекающиеся чанки (offset u32, bytes).
//! Соседние отличающиеся участки, разделённые не более чем MERGE_GAP байтами,
//! склеиваются в один чанк: заголовок чанка (8 байт) дороже короткого разрыва.
//!
//! Формат в payload WAL: [count u32] затем count × [offset u32][len u32][bytes].

use anyhow::{anyhow, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Read;

const MERGE_GAP: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub offset: u32,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageChanges {
    chunks: Vec<Chunk>,
}

impl PageChanges {
    pub fn new() -> Self {
        Self::default()
    }

    /// Построить diff `before → after` в диапазоне [from .. to).
    pub fn diff(before: &[u8], after: &[u8], from: usize, to: usize) -> Result<Self> {
        if before.len() != after.len() {
            return Err(anyhow!(
                "page diff: length mismatch {} != {}",
                before.len(),
                after.len()
            ));
        }
        let to = to.min(after.len());
        let mut chunks: Vec<Chunk> = Vec::new();
        let mut i = from;
        while i < to {
            if before[i] == after[i] {
                i += 1;
                continue;
            }
            let start = i;
            let mut end = i + 1;
            // расширяем участок, пока разрывы короче MERGE_GAP
            let mut j = end;
            while j < to {
                if before[j] != after[j] {
                    end = j + 1;
                    j += 1;
                } else if j - end < MERGE_GAP {
                    j += 1;
                } else {
                    break;
                }
            }
            chunks.push(Chunk {
                offset: start as u32,
                data: after[start..end].to_vec(),
            });
            i = end;
        }
        Ok(Self { chunks })
    }

    /// Полный образ диапазона (для новой страницы).
    pub fn full(after: &[u8], from: usize, to: usize) -> Self {
        Self {
            chunks: vec![Chunk {
                offset: from as u32,
                data: after[from..to].to_vec(),
            }],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    pub fn changed_bytes(&self) -> usize {
        self.chunks.iter().map(|c| c.data.len()).sum()
    }

    pub fn apply(&self, page: &mut [u8]) -> Result<()> {
        for c in &self.chunks {
            let off = c.offset as usize;
            let end = off + c.data.len();
            if end > page.len() {
                return Err(anyhow!(
                    "page change [{}..{}) exceeds page size {}",
                    off,
                    end,
                    page.len()
                ));
            }
            page[off..end].copy_from_slice(&c.data);
        }
        Ok(())
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) -> Result<()> {
        out.write_u32::<LittleEndian>(self.chunks.len() as u32)?;
        for c in &self.chunks {
            out.write_u32::<LittleEndian>(c.offset)?;
            out.write_u32::<LittleEndian>(c.data.len() as u32)?;
            out.extend_from_slice(&c.data);
        }
        Ok(())
    }

    pub fn decode_from<R: Read>(r: &mut R) -> Result<Self> {
        let count = r.read_u32::<LittleEndian>()? as usize;
        let mut chunks = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            let offset = r.read_u32::<LittleEndian>()?;
            let len = r.read_u32::<LittleEndian>()? as usize;
            let mut data = vec![0u8; len];
            r.read_exact(&mut data)?;
            chunks.push(Chunk { offset, data });
        }
        Ok(Self { chunks })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diff_merges_short_gaps_and_applies() -> Result<()> {
        let before = vec![0u8; 256];
        let mut after = before.clone();
        after[10] = 1;
        after[14] = 2; // разрыв 3 байта → один чанк
        after[200] = 3; // далеко → отдельный чанк
        let ch = PageChanges::diff(&before, &after, 0, 256)?;
        assert_eq!(ch.chunks().len(), 2);
        assert_eq!(ch.chunks()[0].offset, 10);
        assert_eq!(ch.chunks()[0].data.len(), 5);

        let mut target = before.clone();
        ch.apply(&mut target)?;
        assert_eq!(target, after);
        Ok(())
    }

    #[test]
    fn diff_respects_range() -> Result<()> {
        let before = vec![0u8; 64];
        let mut after = before.clone();
        after[0] = 9;
        after[63] = 9;
        let ch = PageChanges::diff(&before, &after, 8, 56)?;
        assert!(ch.is_empty());
        Ok(())
    }

    #[test]
    fn apply_out_of_bounds_fails() {
        let ch = PageChanges::full(&[1u8; 32], 0, 32);
        let mut small = vec![0u8; 16];
        assert!(ch.apply(&mut small).is_err());
    }
}
