#![allow(non_snake_case)]

// Базовые модули
pub mod config;
pub mod consts;
pub mod error;
pub mod lock;
pub mod lsn;
pub mod meta;
pub mod metrics;
pub mod util;

// Журнал и страницы
pub mod page;  // src/page/{mod,checksum,changes}.rs
pub mod wal;   // src/wal/{mod,record,encode,reader,log}.rs
pub mod cache; // src/cache/{mod,file_cache,lru}.rs

// Атомарные операции, восстановление, чекпоинты
pub mod atomic;     // src/atomic/{mod,operation,table,locks,freeze,manager}.rs
pub mod recovery;   // src/recovery/{mod,restore,report}.rs
pub mod checkpoint; // src/checkpoint/{mod,fuzzy,full,vacuum}.rs

// Записи, кластеры, индексы и движок
pub mod storage; // src/storage/{mod,rid,version,tx,cluster,index,registry,state,striped}.rs
pub mod engine;  // src/engine/{mod,open,commit,records,ddl,maintenance}.rs

// Удобные реэкспорты
pub use config::{StrataBuilder, StrataConfig};
pub use engine::StorageEngine;
pub use error::{StorageError, StorageResult};
pub use lsn::Lsn;
pub use recovery::RecoveryReport;
pub use storage::{
    IndexKeyOp, PhysicalPosition, RawRecord, Record, RecordOperation, RecordOperationKind, Rid,
    Transaction,
};
pub use wal::{LoggedRecord, WalRecord, WriteAheadLog};
