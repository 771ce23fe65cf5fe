//! MVCC: проверка и продвижение версии записи.
//!
//! Значение, переданное вызывающим:
//! - -1      — без проверки, версия +1;
//! - -2      — без проверки, версия не меняется;
//! - < -2    — overwrite: версия принудительно выставляется (маркер отката снимается);
//! - иначе   — должна совпасть с хранимой, затем +1; иначе ConcurrentModification.

use crate::consts::{VERSION_PRESERVE, VERSION_UNCHECKED};
use crate::error::StorageError;
use crate::storage::Rid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionCheck {
    Unchecked,
    Preserve,
    Overwrite(i32),
    Exact(i32),
}

impl VersionCheck {
    pub fn from_supplied(v: i32) -> Self {
        match v {
            VERSION_UNCHECKED => VersionCheck::Unchecked,
            VERSION_PRESERVE => VersionCheck::Preserve,
            v if v < VERSION_PRESERVE => VersionCheck::Overwrite(clear_rollback_marker(v)),
            v => VersionCheck::Exact(v),
        }
    }
}

/// Пометить версию для пути восстановления конфликтов (overwrite).
#[inline]
pub fn set_rollback_mode(version: i32) -> i32 {
    i32::MIN.wrapping_add(version)
}

#[inline]
pub fn clear_rollback_marker(version: i32) -> i32 {
    version.wrapping_sub(i32::MIN)
}

/// Новая версия после update, либо ConcurrentModification{expected=stored, supplied}.
pub fn check_and_increment(rid: Rid, stored: i32, supplied: i32) -> Result<i32, StorageError> {
    match VersionCheck::from_supplied(supplied) {
        VersionCheck::Unchecked => Ok(stored.wrapping_add(1)),
        VersionCheck::Preserve => Ok(stored),
        VersionCheck::Overwrite(v) => Ok(v),
        VersionCheck::Exact(v) if v == stored => Ok(stored.wrapping_add(1)),
        VersionCheck::Exact(v) => Err(StorageError::ConcurrentModification {
            rid,
            expected: stored,
            supplied: v,
        }),
    }
}

/// Удаление проверяет версию только если она передана явно (>= 0).
pub fn check_delete(rid: Rid, stored: i32, supplied: i32) -> Result<(), StorageError> {
    if supplied > VERSION_UNCHECKED && supplied != stored {
        return Err(StorageError::ConcurrentModification {
            rid,
            expected: stored,
            supplied,
        });
    }
    Ok(())
}

/// Версия новой записи: переданная v > -1 даёт v + 1, иначе 1.
pub fn initial_version(supplied: i32) -> i32 {
    if supplied > VERSION_UNCHECKED {
        supplied.wrapping_add(1)
    } else {
        1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const R: Rid = Rid::new(3, 0);

    #[test]
    fn mvcc_law() {
        for c in [0, 1, 2, 17, 1000] {
            assert_eq!(check_and_increment(R, c, -1), Ok(c + 1));
            assert_eq!(check_and_increment(R, c, -2), Ok(c));
            assert_eq!(check_and_increment(R, c, c), Ok(c + 1));
            for v in [0, 1, 5, 999, 1001] {
                if v != c {
                    assert_eq!(
                        check_and_increment(R, c, v),
                        Err(StorageError::ConcurrentModification {
                            rid: R,
                            expected: c,
                            supplied: v
                        })
                    );
                }
            }
        }
    }

    #[test]
    fn overwrite_clears_marker() {
        let marked = set_rollback_mode(42);
        assert!(marked < VERSION_PRESERVE);
        assert_eq!(check_and_increment(R, 7, marked), Ok(42));
        assert_eq!(VersionCheck::from_supplied(marked), VersionCheck::Overwrite(42));
    }

    #[test]
    fn delete_and_create_rules() {
        assert!(check_delete(R, 4, -1).is_ok());
        assert!(check_delete(R, 4, 4).is_ok());
        assert!(check_delete(R, 4, 3).is_err());
        assert_eq!(initial_version(-1), 1);
        assert_eq!(initial_version(0), 1);
        assert_eq!(initial_version(5), 6);
    }
}
