//! atomic — атомарные операции над страницами: всё или ничего, без вложенности.
//!
//! Подмодули:
//! - operation.rs — буфер одной операции (страницы, новые/удалённые файлы, локи).
//! - table.rs     — таблица операций для удержания сегментов WAL.
//! - locks.rs     — именованные локи компонентов до конца операции.
//! - freeze.rs    — заморозка старта новых операций.
//! - manager.rs   — AtomicOperationsManager (start/end/execute/calculate).

pub mod freeze;
pub mod locks;
pub mod manager;
pub mod operation;
pub mod table;

pub use manager::{AtomicOperationsManager, OperationContext};
pub use operation::AtomicOperation;
pub use table::{AtomicOperationsTable, OperationStatus};
