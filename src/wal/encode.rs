//! wal/encode — кодирование кадров WAL.
//!
//! - build_frame_header: заголовок кадра (12 байт) с CRC32C по header[0..8) + payload.
//! - encode_frame: полный кадр [header][payload] одним буфером (одна write_all на append).

use anyhow::{anyhow, Result};
use byteorder::{ByteOrder, LittleEndian};

use super::crc32c_of_parts;
use super::record::WalRecord;
use crate::consts::{
    WAL_MAX_PAYLOAD, WAL_REC_HDR_SIZE, WAL_REC_OFF_CRC32, WAL_REC_OFF_FLAGS, WAL_REC_OFF_LEN,
    WAL_REC_OFF_RESERVED, WAL_REC_OFF_TYPE,
};

pub fn build_frame_header(rec_type: u8, payload: &[u8]) -> [u8; WAL_REC_HDR_SIZE] {
    let mut hdr = [0u8; WAL_REC_HDR_SIZE];
    hdr[WAL_REC_OFF_TYPE] = rec_type;
    hdr[WAL_REC_OFF_FLAGS] = 0;
    LittleEndian::write_u16(&mut hdr[WAL_REC_OFF_RESERVED..WAL_REC_OFF_RESERVED + 2], 0);
    LittleEndian::write_u32(
        &mut hdr[WAL_REC_OFF_LEN..WAL_REC_OFF_LEN + 4],
        payload.len() as u32,
    );
    let crc = crc32c_of_parts(&hdr[..WAL_REC_OFF_CRC32], payload);
    LittleEndian::write_u32(&mut hdr[WAL_REC_OFF_CRC32..WAL_REC_OFF_CRC32 + 4], crc);
    hdr
}

/// Закодировать запись в готовый кадр.
pub fn encode_frame(rec: &WalRecord) -> Result<Vec<u8>> {
    let payload = rec.encode_payload()?;
    if payload.len() > WAL_MAX_PAYLOAD as usize {
        return Err(anyhow!(
            "payload too large for WAL record: {} bytes (max {})",
            payload.len(),
            WAL_MAX_PAYLOAD
        ));
    }
    let hdr = build_frame_header(rec.rec_type(), &payload);
    let mut frame = Vec::with_capacity(WAL_REC_HDR_SIZE + payload.len());
    frame.extend_from_slice(&hdr);
    frame.extend_from_slice(&payload);
    Ok(frame)
}
