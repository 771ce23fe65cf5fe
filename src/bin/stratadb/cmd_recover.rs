use anyhow::Result;
use std::path::PathBuf;

use crate::util::open_engine;

/// Открытие хранилища уже прогоняет восстановление, если прошлое закрытие было
/// аварийным; здесь только печатаем отчёт.
pub fn exec(path: PathBuf, json_out: bool) -> Result<()> {
    let engine = open_engine(&path)?;
    let report = engine.last_recovery_report().cloned();
    let restored = engine.were_data_restored_after_open();
    let non_tx = engine.were_non_tx_operations_performed_in_previous_open();
    engine.close()?;

    if json_out {
        let out = serde_json::json!({
            "restored": restored,
            "non_tx_operations_in_previous_open": non_tx,
            "report": report,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }
    match report {
        None => println!("storage {} was closed cleanly, nothing to recover", path.display()),
        Some(r) => {
            println!("{}", r);
            println!("data restored: {}", restored);
        }
    }
    if non_tx {
        println!("warning: non-transactional operations were performed in the previous session");
    }
    Ok(())
}
