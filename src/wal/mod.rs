//! WAL — сегментированный журнал упреждающей записи (STRWAL01).
//!
//! Разделение:
//! - record.rs — закрытый набор записей WalRecord и их кодирование в payload.
//! - encode.rs — заголовок кадра + CRC32C, запись кадра в writer.
//! - reader.rs — чтение кадров сегмента с проверкой CRC (битая страница / рваный хвост).
//! - log.rs    — WriteAheadLog: append/flush (group-commit)/read/cut/лимиты усечения.
//!
//! Формат сегмента `<root>/wal/wal-NNNNNN.log`:
//! - [0..8)  MAGIC "STRWAL01"
//! - [8..16) segment id (LE u64)
//! - далее кадры [type u8][flags u8][reserved u16][len u32][crc32c u32][payload].
//!
//! LSN кадра = (segment id, смещение кадра в файле сегмента).

use anyhow::{anyhow, Result};
use byteorder::{ByteOrder, LittleEndian};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

pub use crate::consts::{
    WAL_DIR, WAL_HDR_SIZE, WAL_MAGIC, WAL_REC_HDR_SIZE, WAL_SEG_EXT, WAL_SEG_PREFIX,
};

pub mod encode;
pub mod log;
pub mod reader;
pub mod record;

pub use log::{LoggedRecord, WriteAheadLog};
pub use record::WalRecord;

// -------------------- Общие утилиты --------------------

/// Инкрементальный CRC32C по двум срезам без аллокаций.
#[inline]
pub fn crc32c_of_parts(head_without_crc: &[u8], payload: &[u8]) -> u32 {
    let c = crc32c::crc32c_append(0, head_without_crc);
    crc32c::crc32c_append(c, payload)
}

pub fn wal_dir(root: &Path) -> PathBuf {
    root.join(WAL_DIR)
}

pub fn segment_file_name(segment: u64) -> String {
    format!("{}{:06}.{}", WAL_SEG_PREFIX, segment, WAL_SEG_EXT)
}

pub fn segment_path(dir: &Path, segment: u64) -> PathBuf {
    dir.join(segment_file_name(segment))
}

/// Разобрать id сегмента из имени файла (`wal-000042.log` → 42).
pub fn parse_segment_file_name(name: &str) -> Option<u64> {
    let rest = name.strip_prefix(WAL_SEG_PREFIX)?;
    let num = rest.strip_suffix(&format!(".{}", WAL_SEG_EXT))?;
    num.parse::<u64>().ok()
}

/// Все сегменты каталога WAL по возрастанию id.
pub fn list_segments(dir: &Path) -> Result<Vec<u64>> {
    let mut out = Vec::new();
    if !dir.exists() {
        return Ok(out);
    }
    for e in std::fs::read_dir(dir)? {
        let e = e?;
        if let Some(id) = e.file_name().to_str().and_then(parse_segment_file_name) {
            out.push(id);
        }
    }
    out.sort_unstable();
    Ok(out)
}

/// Записать заголовок сегмента (позиция 0).
pub fn write_segment_header(f: &mut File, segment: u64) -> Result<()> {
    let mut hdr = [0u8; WAL_HDR_SIZE];
    hdr[..8].copy_from_slice(WAL_MAGIC);
    LittleEndian::write_u64(&mut hdr[8..16], segment);
    f.seek(SeekFrom::Start(0))?;
    f.write_all(&hdr)?;
    Ok(())
}

/// Прочитать и проверить заголовок сегмента, вернуть записанный в нём id.
pub fn read_segment_header(f: &mut File) -> Result<u64> {
    if f.metadata()?.len() < WAL_HDR_SIZE as u64 {
        return Err(anyhow!("wal segment too small (< header)"));
    }
    let mut hdr = [0u8; WAL_HDR_SIZE];
    f.seek(SeekFrom::Start(0))?;
    f.read_exact(&mut hdr)?;
    if &hdr[..8] != WAL_MAGIC {
        return Err(anyhow!("bad WAL segment magic"));
    }
    Ok(LittleEndian::read_u64(&hdr[8..16]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_names() {
        assert_eq!(segment_file_name(7), "wal-000007.log");
        assert_eq!(parse_segment_file_name("wal-000007.log"), Some(7));
        assert_eq!(parse_segment_file_name("wal-000007.log.tmp"), None);
        assert_eq!(parse_segment_file_name("data-000007.log"), None);
    }
}
