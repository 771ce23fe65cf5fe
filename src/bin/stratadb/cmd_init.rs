use anyhow::Result;
use std::path::PathBuf;

use StrataDB::{StorageEngine, StrataConfig};

pub fn exec(path: PathBuf, page_size: u32) -> Result<()> {
    let cfg = StrataConfig::from_env().with_page_size(page_size);
    let engine = StorageEngine::create(&path, cfg)?;
    println!(
        "Initialized storage at {} (page_size={}, instance_id={})",
        path.display(),
        engine.page_size(),
        engine.instance_id()
    );
    engine.close()?;
    Ok(())
}
