//! wal/record — закрытый набор записей WAL и кодирование payload.
//!
//! Payload (LE) по типам:
//! - AtomicUnitStart            [op_id u64][meta?]
//! - AtomicUnitEnd              [op_id u64][meta?]
//! - UpdatePage                 [op_id u64][file_id u64][page_index u64][initial_lsn 2×u64][changes]
//! - FileCreated                [op_id u64][file_id u64][name_len u16][name utf8]
//! - FileDeleted                [op_id u64][file_id u64]
//! - HighLevelTransactionChange [op_id u64][len u32][bytes]
//! - MetaData                   [len u32][bytes]
//! - NonTxOperationPerformed / Empty — пустой payload
//!
//! meta? = [present u8] + при present=1 [len u32][bytes].

use anyhow::{anyhow, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read};

use crate::consts::{
    WAL_REC_ATOMIC_UNIT_END, WAL_REC_ATOMIC_UNIT_START, WAL_REC_EMPTY, WAL_REC_FILE_CREATED,
    WAL_REC_FILE_DELETED, WAL_REC_HIGH_LEVEL_TX_CHANGE, WAL_REC_METADATA,
    WAL_REC_NON_TX_OPERATION, WAL_REC_UPDATE_PAGE,
};
use crate::lsn::Lsn;
use crate::page::PageChanges;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalRecord {
    AtomicUnitStart {
        op_id: u64,
        metadata: Option<Vec<u8>>,
    },
    AtomicUnitEnd {
        op_id: u64,
        metadata: Option<Vec<u8>>,
    },
    UpdatePage {
        op_id: u64,
        file_id: u64,
        page_index: u64,
        initial_lsn: Lsn,
        changes: PageChanges,
    },
    FileCreated {
        op_id: u64,
        file_id: u64,
        name: String,
    },
    FileDeleted {
        op_id: u64,
        file_id: u64,
    },
    HighLevelTransactionChange {
        op_id: u64,
        payload: Vec<u8>,
    },
    MetaData {
        bytes: Vec<u8>,
    },
    NonTxOperationPerformed,
    Empty,
}

impl WalRecord {
    pub fn rec_type(&self) -> u8 {
        match self {
            WalRecord::AtomicUnitStart { .. } => WAL_REC_ATOMIC_UNIT_START,
            WalRecord::AtomicUnitEnd { .. } => WAL_REC_ATOMIC_UNIT_END,
            WalRecord::UpdatePage { .. } => WAL_REC_UPDATE_PAGE,
            WalRecord::FileCreated { .. } => WAL_REC_FILE_CREATED,
            WalRecord::FileDeleted { .. } => WAL_REC_FILE_DELETED,
            WalRecord::HighLevelTransactionChange { .. } => WAL_REC_HIGH_LEVEL_TX_CHANGE,
            WalRecord::MetaData { .. } => WAL_REC_METADATA,
            WalRecord::NonTxOperationPerformed => WAL_REC_NON_TX_OPERATION,
            WalRecord::Empty => WAL_REC_EMPTY,
        }
    }

    /// Id атомарной операции, к которой относится запись.
    pub fn op_id(&self) -> Option<u64> {
        match self {
            WalRecord::AtomicUnitStart { op_id, .. }
            | WalRecord::AtomicUnitEnd { op_id, .. }
            | WalRecord::UpdatePage { op_id, .. }
            | WalRecord::FileCreated { op_id, .. }
            | WalRecord::FileDeleted { op_id, .. }
            | WalRecord::HighLevelTransactionChange { op_id, .. } => Some(*op_id),
            WalRecord::MetaData { .. } | WalRecord::NonTxOperationPerformed | WalRecord::Empty => {
                None
            }
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            WalRecord::AtomicUnitStart { .. } => "atomic_unit_start",
            WalRecord::AtomicUnitEnd { .. } => "atomic_unit_end",
            WalRecord::UpdatePage { .. } => "update_page",
            WalRecord::FileCreated { .. } => "file_created",
            WalRecord::FileDeleted { .. } => "file_deleted",
            WalRecord::HighLevelTransactionChange { .. } => "high_level_tx_change",
            WalRecord::MetaData { .. } => "metadata",
            WalRecord::NonTxOperationPerformed => "non_tx_operation",
            WalRecord::Empty => "empty",
        }
    }

    pub fn encode_payload(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        match self {
            WalRecord::AtomicUnitStart { op_id, metadata }
            | WalRecord::AtomicUnitEnd { op_id, metadata } => {
                out.write_u64::<LittleEndian>(*op_id)?;
                write_opt_bytes(&mut out, metadata.as_deref())?;
            }
            WalRecord::UpdatePage {
                op_id,
                file_id,
                page_index,
                initial_lsn,
                changes,
            } => {
                out.write_u64::<LittleEndian>(*op_id)?;
                out.write_u64::<LittleEndian>(*file_id)?;
                out.write_u64::<LittleEndian>(*page_index)?;
                out.write_u64::<LittleEndian>(initial_lsn.segment)?;
                out.write_u64::<LittleEndian>(initial_lsn.position)?;
                changes.encode_into(&mut out)?;
            }
            WalRecord::FileCreated {
                op_id,
                file_id,
                name,
            } => {
                if name.len() > u16::MAX as usize {
                    return Err(anyhow!("file name too long for WAL: {} bytes", name.len()));
                }
                out.write_u64::<LittleEndian>(*op_id)?;
                out.write_u64::<LittleEndian>(*file_id)?;
                out.write_u16::<LittleEndian>(name.len() as u16)?;
                out.extend_from_slice(name.as_bytes());
            }
            WalRecord::FileDeleted { op_id, file_id } => {
                out.write_u64::<LittleEndian>(*op_id)?;
                out.write_u64::<LittleEndian>(*file_id)?;
            }
            WalRecord::HighLevelTransactionChange { op_id, payload } => {
                out.write_u64::<LittleEndian>(*op_id)?;
                write_bytes(&mut out, payload)?;
            }
            WalRecord::MetaData { bytes } => {
                write_bytes(&mut out, bytes)?;
            }
            WalRecord::NonTxOperationPerformed | WalRecord::Empty => {}
        }
        Ok(out)
    }

    pub fn decode(rec_type: u8, payload: &[u8]) -> Result<WalRecord> {
        let mut c = Cursor::new(payload);
        let rec = match rec_type {
            WAL_REC_ATOMIC_UNIT_START => WalRecord::AtomicUnitStart {
                op_id: c.read_u64::<LittleEndian>()?,
                metadata: read_opt_bytes(&mut c)?,
            },
            WAL_REC_ATOMIC_UNIT_END => WalRecord::AtomicUnitEnd {
                op_id: c.read_u64::<LittleEndian>()?,
                metadata: read_opt_bytes(&mut c)?,
            },
            WAL_REC_UPDATE_PAGE => {
                let op_id = c.read_u64::<LittleEndian>()?;
                let file_id = c.read_u64::<LittleEndian>()?;
                let page_index = c.read_u64::<LittleEndian>()?;
                let seg = c.read_u64::<LittleEndian>()?;
                let pos = c.read_u64::<LittleEndian>()?;
                let changes = PageChanges::decode_from(&mut c)?;
                WalRecord::UpdatePage {
                    op_id,
                    file_id,
                    page_index,
                    initial_lsn: Lsn::new(seg, pos),
                    changes,
                }
            }
            WAL_REC_FILE_CREATED => {
                let op_id = c.read_u64::<LittleEndian>()?;
                let file_id = c.read_u64::<LittleEndian>()?;
                let n = c.read_u16::<LittleEndian>()? as usize;
                let mut name = vec![0u8; n];
                c.read_exact(&mut name)?;
                WalRecord::FileCreated {
                    op_id,
                    file_id,
                    name: String::from_utf8(name)
                        .map_err(|_| anyhow!("file name in WAL is not utf-8"))?,
                }
            }
            WAL_REC_FILE_DELETED => WalRecord::FileDeleted {
                op_id: c.read_u64::<LittleEndian>()?,
                file_id: c.read_u64::<LittleEndian>()?,
            },
            WAL_REC_HIGH_LEVEL_TX_CHANGE => WalRecord::HighLevelTransactionChange {
                op_id: c.read_u64::<LittleEndian>()?,
                payload: read_bytes(&mut c)?,
            },
            WAL_REC_METADATA => WalRecord::MetaData {
                bytes: read_bytes(&mut c)?,
            },
            WAL_REC_NON_TX_OPERATION => WalRecord::NonTxOperationPerformed,
            WAL_REC_EMPTY => WalRecord::Empty,
            other => return Err(anyhow!("unknown WAL record type {}", other)),
        };
        if (c.position() as usize) != payload.len() {
            return Err(anyhow!(
                "trailing {} bytes in WAL record type {}",
                payload.len() - c.position() as usize,
                rec_type
            ));
        }
        Ok(rec)
    }
}

// ---------- helpers ----------

fn write_bytes(out: &mut Vec<u8>, b: &[u8]) -> Result<()> {
    out.write_u32::<LittleEndian>(b.len() as u32)?;
    out.extend_from_slice(b);
    Ok(())
}

fn read_bytes(c: &mut Cursor<&[u8]>) -> Result<Vec<u8>> {
    let n = c.read_u32::<LittleEndian>()? as usize;
    let left = c.get_ref().len() - c.position() as usize;
    if n > left {
        return Err(anyhow!("WAL byte field of {} exceeds payload ({} left)", n, left));
    }
    let mut v = vec![0u8; n];
    c.read_exact(&mut v)?;
    Ok(v)
}

fn write_opt_bytes(out: &mut Vec<u8>, b: Option<&[u8]>) -> Result<()> {
    match b {
        Some(b) => {
            out.write_u8(1)?;
            write_bytes(out, b)
        }
        None => {
            out.write_u8(0)?;
            Ok(())
        }
    }
}

fn read_opt_bytes(c: &mut Cursor<&[u8]>) -> Result<Option<Vec<u8>>> {
    match c.read_u8()? {
        0 => Ok(None),
        1 => Ok(Some(read_bytes(c)?)),
        x => Err(anyhow!("bad optional marker {} in WAL record", x)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_page_payload_decodes() -> Result<()> {
        let mut after = vec![0u8; 64];
        after[20] = 0xAB;
        let changes = PageChanges::diff(&[0u8; 64], &after, 0, 64)?;
        let rec = WalRecord::UpdatePage {
            op_id: 11,
            file_id: 7,
            page_index: 2,
            initial_lsn: Lsn::new(1, 16),
            changes,
        };
        let back = WalRecord::decode(rec.rec_type(), &rec.encode_payload()?)?;
        assert_eq!(back, rec);
        assert_eq!(back.op_id(), Some(11));
        Ok(())
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(WalRecord::decode(WAL_REC_METADATA, &[9, 0, 0, 0, 1]).is_err());
        assert!(WalRecord::decode(WAL_REC_EMPTY, &[1]).is_err());
        assert!(WalRecord::decode(42, &[]).is_err());
    }
}
