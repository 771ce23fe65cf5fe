//! wal/reader — последовательное чтение кадров одного сегмента с проверкой CRC.
//!
//! Исходы read_frame_at:
//! - Frame::Record — кадр валиден, запись декодирована;
//! - Frame::End    — конец данных сегмента: EOF, нулевой заголовок (type 0)
//!   или частичный хвост (рваная запись на момент падения);
//! - Err(StorageError::WalPageBroken) — CRC mismatch / мусорная длина / недекодируемый payload.
//!   Остальные Err — ошибки ввода-вывода.

use anyhow::{anyhow, Result};
use byteorder::{ByteOrder, LittleEndian};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use super::log::LoggedRecord;
use super::record::WalRecord;
use super::{crc32c_of_parts, list_segments, read_segment_header, segment_path, WAL_HDR_SIZE};
use crate::consts::{
    WAL_MAX_PAYLOAD, WAL_REC_END_OF_SEGMENT, WAL_REC_HDR_SIZE, WAL_REC_OFF_CRC32,
    WAL_REC_OFF_LEN, WAL_REC_OFF_TYPE,
};
use crate::error::StorageError;
use crate::lsn::Lsn;

#[derive(Debug)]
pub enum Frame {
    /// Запись и позиция следующего кадра.
    Record(WalRecord, u64),
    End,
}

fn broken(segment: u64, pos: u64, reason: impl Into<String>) -> anyhow::Error {
    anyhow::Error::from(StorageError::WalPageBroken {
        lsn: Lsn::new(segment, pos),
        reason: reason.into(),
    })
}

/// Прочитать кадр сегмента `segment` на позиции `pos`; `file_len` — видимая длина файла.
pub fn read_frame_at(f: &mut File, segment: u64, pos: u64, file_len: u64) -> Result<Frame> {
    if pos + (WAL_REC_HDR_SIZE as u64) > file_len {
        return Ok(Frame::End);
    }

    f.seek(SeekFrom::Start(pos))?;
    let mut hdr = [0u8; WAL_REC_HDR_SIZE];
    if let Err(e) = f.read_exact(&mut hdr) {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            return Ok(Frame::End);
        }
        return Err(anyhow!("wal read header at {}:{}: {}", segment, pos, e));
    }

    // нулевой заголовок — хвост сегмента (ничего не писалось)
    if hdr[WAL_REC_OFF_TYPE] == WAL_REC_END_OF_SEGMENT && hdr.iter().all(|b| *b == 0) {
        return Ok(Frame::End);
    }

    let payload_len = LittleEndian::read_u32(&hdr[WAL_REC_OFF_LEN..WAL_REC_OFF_LEN + 4]);
    if payload_len > WAL_MAX_PAYLOAD {
        return Err(broken(
            segment,
            pos,
            format!("payload length {} exceeds limit", payload_len),
        ));
    }
    let next = pos + WAL_REC_HDR_SIZE as u64 + payload_len as u64;
    if next > file_len {
        // частичный хвост: кадр не дописан до падения
        return Ok(Frame::End);
    }

    let mut payload = vec![0u8; payload_len as usize];
    if let Err(e) = f.read_exact(&mut payload) {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            return Ok(Frame::End);
        }
        return Err(anyhow!("wal read payload at {}:{}: {}", segment, pos, e));
    }

    let stored = LittleEndian::read_u32(&hdr[WAL_REC_OFF_CRC32..WAL_REC_OFF_CRC32 + 4]);
    let actual = crc32c_of_parts(&hdr[..WAL_REC_OFF_CRC32], &payload);
    if stored != actual {
        return Err(broken(
            segment,
            pos,
            format!("crc mismatch (stored={:#010x}, actual={:#010x})", stored, actual),
        ));
    }

    match WalRecord::decode(hdr[WAL_REC_OFF_TYPE], &payload) {
        Ok(rec) => Ok(Frame::Record(rec, next)),
        Err(e) => Err(broken(segment, pos, format!("{:#}", e))),
    }
}

/// Пройти журнал в каталоге `dir` только на чтение (без открытия на дозапись).
/// Битая страница останавливает проход и возвращается ошибкой после того, как
/// всё прочитанное до неё уже передано в `visit`.
pub fn scan_segments(dir: &Path, mut visit: impl FnMut(LoggedRecord) -> Result<()>) -> Result<u64> {
    let mut seen = 0u64;
    for seg in list_segments(dir)? {
        let path = segment_path(dir, seg);
        let mut f = File::open(&path)
            .map_err(|e| anyhow!("open wal segment {}: {}", path.display(), e))?;
        let id = read_segment_header(&mut f)?;
        if id != seg {
            return Err(anyhow!(
                "wal segment {} has id {} in its header",
                path.display(),
                id
            ));
        }
        let len = f.metadata()?.len();
        let mut pos = WAL_HDR_SIZE as u64;
        while let Frame::Record(record, next) = read_frame_at(&mut f, seg, pos, len)? {
            visit(LoggedRecord {
                lsn: Lsn::new(seg, pos),
                record,
            })?;
            seen += 1;
            pos = next;
        }
    }
    Ok(seen)
}
