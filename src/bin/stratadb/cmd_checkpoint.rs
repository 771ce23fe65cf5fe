use anyhow::Result;
use std::path::PathBuf;

use crate::util::open_engine;

pub fn exec(path: PathBuf, full: bool) -> Result<()> {
    let engine = open_engine(&path)?;
    if full {
        engine.synch()?;
        println!("full checkpoint done");
    } else {
        match engine.vacuum_wal()? {
            Some(w) => println!("WAL vacuum done, watermark segment {}", w),
            None => println!("WAL vacuum: nothing to do"),
        }
    }
    let m = engine.metrics_snapshot();
    println!(
        "checkpoints: fuzzy={} full={} segments_cut={}",
        m.fuzzy_checkpoints, m.full_checkpoints, m.wal_segments_cut
    );
    engine.close()?;
    Ok(())
}
