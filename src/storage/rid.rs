//! Record identity `#cluster:position`.
//!
//! Отрицательная позиция — временный RID внутри ещё не закоммиченной транзакции;
//! при коммите он заменяется позицией, выделенной кластером.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Rid {
    pub cluster_id: i32,
    pub position: i64,
}

impl Rid {
    #[inline]
    pub const fn new(cluster_id: i32, position: i64) -> Self {
        Self {
            cluster_id,
            position,
        }
    }

    #[inline]
    pub fn is_persistent(&self) -> bool {
        self.cluster_id >= 0 && self.position >= 0
    }

    #[inline]
    pub fn is_temporary(&self) -> bool {
        self.position < 0
    }
}

impl fmt::Display for Rid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}:{}", self.cluster_id, self.position)
    }
}

impl FromStr for Rid {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let body = s.strip_prefix('#').unwrap_or(s);
        let (c, p) = body
            .split_once(':')
            .ok_or_else(|| anyhow!("rid '{}' must look like #cluster:position", s))?;
        Ok(Rid::new(
            c.trim().parse().map_err(|e| anyhow!("rid '{}': cluster: {}", s, e))?,
            p.trim().parse().map_err(|e| anyhow!("rid '{}': position: {}", s, e))?,
        ))
    }
}

/// Физическое положение записи внутри кластера.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PhysicalPosition {
    pub cluster_position: i64,
    pub record_version: i32,
    pub record_type: u8,
    pub record_size: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rid_parse_and_flags() -> Result<()> {
        let r: Rid = "#3:17".parse()?;
        assert_eq!(r, Rid::new(3, 17));
        assert_eq!(r.to_string(), "#3:17");
        assert!(r.is_persistent());
        assert!(Rid::new(3, -2).is_temporary());
        assert!("3-17".parse::<Rid>().is_err());
        Ok(())
    }
}
