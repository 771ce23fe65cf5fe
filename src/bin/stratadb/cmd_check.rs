use anyhow::{anyhow, Result};
use std::path::PathBuf;

use crate::util::open_engine;

pub fn exec(path: PathBuf, verbose: bool) -> Result<()> {
    let engine = open_engine(&path)?;
    let ok = engine.check(verbose, &mut |msg: &str| println!("{}", msg))?;
    for b in engine.broken_pages() {
        println!(
            "broken page: file='{}' page={} ({})",
            b.file_name, b.page_index, b.reason
        );
    }
    engine.close()?;
    if !ok {
        return Err(anyhow!("check found problems in {}", path.display()));
    }
    println!("OK");
    Ok(())
}
