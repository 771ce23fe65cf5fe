//! recovery — redo-восстановление из WAL после нечистого завершения.
//!
//! - restore.rs — проход по журналу: группировка записей по op_id, применение
//!   завершённых операций, отбрасывание незавершённых.
//! - report.rs  — RecoveryReport (счётчики для лога, CLI и метрик).

pub mod report;
pub mod restore;

pub use report::RecoveryReport;
pub use restore::restore_from_wal;
