use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Административный CLI для хранилища StrataDB
#[derive(Parser, Debug)]
#[command(name = "stratadb", version, about = "StrataDB storage CLI")]
pub struct Cli {
    #[command(subcommand)]
    pub cmd: Cmd,
}

#[derive(Subcommand, Debug)]
pub enum Cmd {
    /// Create a new storage (meta + empty WAL + registry)
    Init {
        #[arg(long)]
        path: PathBuf,
        #[arg(long, default_value_t = 8192)]
        page_size: u32,
    },
    /// Offline status: meta, components, WAL segments (does not open the storage)
    Status {
        #[arg(long)]
        path: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Integrity check: page CRCs, cluster/index headers, every record readable
    Check {
        #[arg(long)]
        path: PathBuf,
        #[arg(long)]
        verbose: bool,
    },
    /// Run a WAL vacuum round (fuzzy checkpoint) or, with --full, a full checkpoint
    Checkpoint {
        #[arg(long)]
        path: PathBuf,
        #[arg(long)]
        full: bool,
    },
    /// Open the storage (restoring from WAL if needed) and print the recovery report
    Recover {
        #[arg(long)]
        path: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Print WAL records read-only (refuses to run next to a live engine)
    WalDump {
        #[arg(long)]
        path: PathBuf,
        #[arg(long)]
        json: bool,
        /// Skip records before this LSN (<segment>:<position>)
        #[arg(long)]
        from: Option<String>,
        /// Stop after N records
        #[arg(long)]
        limit: Option<u64>,
    },
    /// Add a cluster
    AddCluster {
        #[arg(long)]
        path: PathBuf,
        #[arg(long)]
        name: String,
    },
    /// Create a record; value: literal, hex:..., @file or - (stdin)
    Put {
        #[arg(long)]
        path: PathBuf,
        /// Cluster name or numeric id
        #[arg(long)]
        cluster: String,
        #[arg(long)]
        value: String,
    },
    /// Read a record by RID (#cluster:position)
    Get {
        #[arg(long)]
        path: PathBuf,
        #[arg(long)]
        rid: String,
        /// Optional file to write raw content into
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Delete a record by RID
    Del {
        #[arg(long)]
        path: PathBuf,
        #[arg(long)]
        rid: String,
        /// Expected version (-1 skips the check)
        #[arg(long, default_value_t = -1, allow_negative_numbers = true)]
        version: i32,
    },
}
