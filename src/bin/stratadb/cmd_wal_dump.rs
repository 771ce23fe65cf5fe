use anyhow::{anyhow, Result};
use serde_json::json;
use std::path::PathBuf;

use StrataDB::lock::{try_lock_dir, LockMode};
use StrataDB::wal::reader::scan_segments;
use StrataDB::wal::wal_dir;
use StrataDB::{LoggedRecord, Lsn, WalRecord};

use crate::util::display_bytes;

/// Печать записей журнала. Разделяемая блокировка каталога не даёт запустить
/// дамп рядом с работающим движком (тот держит эксклюзивную).
pub fn exec(path: PathBuf, json_out: bool, from: Option<String>, limit: Option<u64>) -> Result<()> {
    let _lock = try_lock_dir(&path, LockMode::Shared)?;
    let from: Option<Lsn> = from.as_deref().map(str::parse).transpose()?;
    let dir = wal_dir(&path);
    if !dir.exists() {
        return Err(anyhow!("no WAL directory in {}", path.display()));
    }

    let mut printed = 0u64;
    let scan = scan_segments(&dir, |lr| {
        if from.map_or(false, |f| lr.lsn < f) {
            return Ok(());
        }
        if limit.map_or(false, |l| printed >= l) {
            return Ok(());
        }
        printed += 1;
        if json_out {
            println!("{}", serde_json::to_string(&record_json(&lr))?);
        } else {
            println!("{}", record_line(&lr));
        }
        Ok(())
    });

    match scan {
        Ok(total) => {
            if !json_out {
                println!("-- {} record(s) in WAL, {} printed", total, printed);
            }
            Ok(())
        }
        Err(e) => {
            // всё, что до битой страницы, уже напечатано
            Err(e.context(format!("WAL scan stopped after {} printed record(s)", printed)))
        }
    }
}

fn record_line(lr: &LoggedRecord) -> String {
    let head = format!("{:>16}  {:<20}", lr.lsn.to_string(), lr.record.kind_name());
    let tail = match &lr.record {
        WalRecord::AtomicUnitStart { op_id, metadata } | WalRecord::AtomicUnitEnd { op_id, metadata } => {
            match metadata {
                Some(m) => format!("op={} metadata={}", op_id, display_bytes(m)),
                None => format!("op={}", op_id),
            }
        }
        WalRecord::UpdatePage {
            op_id,
            file_id,
            page_index,
            initial_lsn,
            changes,
        } => format!(
            "op={} file={} page={} initial_lsn={} chunks={} bytes={}",
            op_id,
            file_id,
            page_index,
            initial_lsn,
            changes.chunks().len(),
            changes.changed_bytes()
        ),
        WalRecord::FileCreated { op_id, file_id, name } => {
            format!("op={} file={} name='{}'", op_id, file_id, name)
        }
        WalRecord::FileDeleted { op_id, file_id } => format!("op={} file={}", op_id, file_id),
        WalRecord::HighLevelTransactionChange { op_id, payload } => {
            format!("op={} payload_len={}", op_id, payload.len())
        }
        WalRecord::MetaData { bytes } => format!("metadata={}", display_bytes(bytes)),
        WalRecord::NonTxOperationPerformed | WalRecord::Empty => String::new(),
    };
    format!("{}{}", head, tail)
}

fn record_json(lr: &LoggedRecord) -> serde_json::Value {
    let mut v = json!({
        "lsn": lr.lsn.to_string(),
        "kind": lr.record.kind_name(),
    });
    if let Some(op) = lr.record.op_id() {
        v["op_id"] = json!(op);
    }
    match &lr.record {
        WalRecord::UpdatePage {
            file_id,
            page_index,
            initial_lsn,
            changes,
            ..
        } => {
            v["file_id"] = json!(file_id);
            v["page_index"] = json!(page_index);
            v["initial_lsn"] = json!(initial_lsn.to_string());
            v["changed_bytes"] = json!(changes.changed_bytes());
        }
        WalRecord::FileCreated { file_id, name, .. } => {
            v["file_id"] = json!(file_id);
            v["name"] = json!(name);
        }
        WalRecord::FileDeleted { file_id, .. } => v["file_id"] = json!(file_id),
        WalRecord::AtomicUnitStart { metadata: Some(m), .. }
        | WalRecord::AtomicUnitEnd { metadata: Some(m), .. }
        | WalRecord::MetaData { bytes: m } => v["metadata"] = json!(display_bytes(m)),
        _ => {}
    }
    v
}
