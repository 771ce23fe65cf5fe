//! error — закрытая таксономия ошибок движка хранения.
//!
//! Внутренние слои работают с `anyhow::Result` и контекстом; классифицированные
//! условия (конфликты, not-found, битая страница WAL и т.п.) переносятся как
//! `StorageError` внутри `anyhow::Error` и восстанавливаются downcast'ом на границе
//! публичного API (`StorageError::classify`).
//!
//! Единственная функция классификации — `is_poisoning()`: отравляющие ошибки
//! переводят движок в «липкое» состояние ошибки до перезапуска.

use std::hash::Hasher;
use std::sync::Mutex;

use log::{debug, error, warn};
use thiserror::Error;

use crate::lsn::Lsn;
use crate::storage::Rid;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("concurrent modification of {rid}: stored version {expected}, supplied {supplied}")]
    ConcurrentModification {
        rid: Rid,
        expected: i32,
        supplied: i32,
    },

    #[error("concurrent create: expected position {expected}, allocated {actual}")]
    ConcurrentCreate { expected: Rid, actual: Rid },

    #[error("record {0} not found")]
    RecordNotFound(Rid),

    #[error("cluster {0} does not exist")]
    ClusterNotFound(String),

    #[error("index engine '{0}' does not exist")]
    IndexNotFound(String),

    #[error("WAL page is broken at {lsn}: {reason}")]
    WalPageBroken { lsn: Lsn, reason: String },

    #[error("modification prohibited: {0}")]
    ModificationProhibited(String),

    #[error("atomic operation is already started for this context")]
    NestedAtomicOperation,

    #[error("illegal argument: {0}")]
    IllegalArgument(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("i/o failure: {0}")]
    Io(String),

    #[error("storage failure: {0}")]
    Storage(String),

    #[error("storage is in error state: {0}")]
    InError(String),
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;

impl StorageError {
    /// Переводит ли ошибка хранилище в состояние ошибки.
    pub fn is_poisoning(&self) -> bool {
        match self {
            StorageError::ConcurrentModification { .. }
            | StorageError::ConcurrentCreate { .. }
            | StorageError::RecordNotFound(_)
            | StorageError::ClusterNotFound(_)
            | StorageError::IndexNotFound(_)
            | StorageError::WalPageBroken { .. }
            | StorageError::ModificationProhibited(_)
            | StorageError::NestedAtomicOperation
            | StorageError::IllegalArgument(_)
            | StorageError::InError(_) => false,
            StorageError::InvalidState(_) | StorageError::Io(_) | StorageError::Storage(_) => {
                true
            }
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            StorageError::ConcurrentModification { .. } | StorageError::ConcurrentCreate { .. }
        )
    }

    /// Восстановить классифицированную ошибку из anyhow-цепочки.
    ///
    /// Порядок:
    /// - StorageError где-либо в цепочке → он сам;
    /// - std::io::Error в цепочке → Io;
    /// - иначе → Storage (неклассифицированная, отравляет хранилище).
    pub fn classify(err: anyhow::Error) -> StorageError {
        for cause in err.chain() {
            if let Some(se) = cause.downcast_ref::<StorageError>() {
                return se.clone();
            }
        }
        let msg = format!("{:#}", err);
        if err.chain().any(|c| c.is::<std::io::Error>()) {
            StorageError::Io(msg)
        } else {
            StorageError::Storage(msg)
        }
    }

    /// Классифицированная ошибка в anyhow-цепочке без её потребления.
    pub fn find(err: &anyhow::Error) -> Option<&StorageError> {
        err.chain().find_map(|c| c.downcast_ref::<StorageError>())
    }

    /// Идентификатор для корреляции строки лога и ошибки у вызывающего.
    pub fn correlation_id(&self) -> u64 {
        let mut h = twox_hash::XxHash64::with_seed(0x5EED_0F_E770);
        h.write(self.to_string().as_bytes());
        h.finish()
    }
}

/// «Липкое» состояние ошибки движка: после первой отравляющей ошибки все
/// операции отвечают InError до перезапуска.
#[derive(Debug, Default)]
pub struct ErrorState {
    slot: Mutex<Option<String>>,
}

impl ErrorState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn check(&self) -> StorageResult<()> {
        match &*self.slot.lock().unwrap() {
            Some(m) => Err(StorageError::InError(m.clone())),
            None => Ok(()),
        }
    }

    pub fn is_set(&self) -> bool {
        self.slot.lock().unwrap().is_some()
    }

    /// Граница публичного API: классифицировать, залогировать с correlation id,
    /// отравить хранилище, если ошибка того требует.
    pub fn handle(&self, op_name: &str, err: anyhow::Error) -> StorageError {
        let se = StorageError::classify(err);
        let id = se.correlation_id();
        if se.is_poisoning() {
            error!("{}: [{:016x}] {}; storage switched to error state", op_name, id, se);
            let mut slot = self.slot.lock().unwrap();
            if slot.is_none() {
                *slot = Some(format!("[{:016x}] {}", id, se));
            }
        } else if se.is_conflict() || matches!(se, StorageError::RecordNotFound(_)) {
            debug!("{}: [{:016x}] {}", op_name, id, se);
        } else {
            warn!("{}: [{:016x}] {}", op_name, id, se);
        }
        se
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn poisoning_split() {
        let rid = Rid::new(3, 0);
        assert!(!StorageError::ConcurrentModification {
            rid,
            expected: 2,
            supplied: 1
        }
        .is_poisoning());
        assert!(!StorageError::RecordNotFound(rid).is_poisoning());
        assert!(!StorageError::NestedAtomicOperation.is_poisoning());
        assert!(StorageError::InvalidState("x".into()).is_poisoning());
        assert!(StorageError::Io("disk".into()).is_poisoning());
    }

    #[test]
    fn classify_finds_wrapped_kind() {
        let rid = Rid::new(1, 5);
        let e = anyhow::Error::from(StorageError::RecordNotFound(rid)).context("read_record");
        assert_eq!(StorageError::classify(e), StorageError::RecordNotFound(rid));

        let io = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        let e = Err::<(), _>(io).context("write page").unwrap_err();
        assert!(matches!(StorageError::classify(e), StorageError::Io(_)));

        let e = anyhow::anyhow!("something odd");
        assert!(matches!(StorageError::classify(e), StorageError::Storage(_)));
    }

    #[test]
    fn error_state_is_sticky() {
        let st = ErrorState::new();
        let e = st.handle("commit", StorageError::RecordNotFound(Rid::new(1, 1)).into());
        assert!(matches!(e, StorageError::RecordNotFound(_)));
        assert!(st.check().is_ok());

        st.handle("commit", anyhow::anyhow!("page vanished"));
        assert!(st.is_set());
        let err = st.check().unwrap_err();
        assert!(matches!(err, StorageError::InError(_)));
        // первая причина сохраняется
        st.handle("close", StorageError::Io("disk".into()).into());
        assert!(err.to_string().contains("page vanished"));
        assert_eq!(st.check().unwrap_err(), err);
    }
}
