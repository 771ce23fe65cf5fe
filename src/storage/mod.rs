//! storage — уровень записей поверх атомарных операций.
//!
//! - rid.rs      — идентичность записи `#cluster:position`, PhysicalPosition.
//! - version.rs  — MVCC-правила версий.
//! - tx.rs       — клиентская транзакция (операции + изменения индексов).
//! - cluster.rs  — PagedCluster: карта позиций и цепочки страниц данных.
//! - index.rs    — IndexEngine и хэш-индекс на страницах.
//! - registry.rs — реестр компонентов storage.json.
//! - state.rs    — StateLock (read / write / migration).
//! - striped.rs  — пул полосатых блокировок записей.

pub mod cluster;
pub mod index;
pub mod registry;
pub mod rid;
pub mod state;
pub mod striped;
pub mod tx;
pub mod version;

pub use cluster::{PagedCluster, RawRecord};
pub use index::{HashIndex, IndexEngine};
pub use registry::{ClusterDef, IndexDef, StorageRegistry};
pub use rid::{PhysicalPosition, Rid};
pub use state::StateLock;
pub use striped::StripedLocks;
pub use tx::{IndexChanges, IndexKeyOp, Record, RecordOperation, RecordOperationKind, Transaction};
