use anyhow::Result;
use clap::Parser;
use env_logger::{Builder, Env};
use log::error;

mod cli;
mod cmd_check;
mod cmd_checkpoint;
mod cmd_init;
mod cmd_records;
mod cmd_recover;
mod cmd_status;
mod cmd_wal_dump;
mod util;

fn init_logger() {
    // Уровень берём из RUST_LOG, иначе дефолт — info.
    // Пример: RUST_LOG=debug stratadb check --path ./db
    Builder::from_env(Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();
}

fn main() {
    init_logger();

    if let Err(e) = run() {
        error!("{:?}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = cli::Cli::parse();
    match cli.cmd {
        cli::Cmd::Init { path, page_size } => cmd_init::exec(path, page_size),

        cli::Cmd::Status { path, json } => cmd_status::exec(path, json),

        cli::Cmd::Check { path, verbose } => cmd_check::exec(path, verbose),

        cli::Cmd::Checkpoint { path, full } => cmd_checkpoint::exec(path, full),

        cli::Cmd::Recover { path, json } => cmd_recover::exec(path, json),

        cli::Cmd::WalDump {
            path,
            json,
            from,
            limit,
        } => cmd_wal_dump::exec(path, json, from, limit),

        cli::Cmd::AddCluster { path, name } => cmd_records::exec_add_cluster(path, name),

        cli::Cmd::Put { path, cluster, value } => cmd_records::exec_put(path, cluster, value),

        cli::Cmd::Get { path, rid, out } => cmd_records::exec_get(path, rid, out),

        cli::Cmd::Del { path, rid, version } => cmd_records::exec_del(path, rid, version),
    }
}
