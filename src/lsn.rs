//! Log sequence number: (segment, position) внутри WAL.
//!
//! Порядок — лексикографический: сначала сегмент, затем позиция кадра в сегменте.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, Result};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Lsn {
    pub segment: u64,
    pub position: u64,
}

impl Lsn {
    pub const ZERO: Lsn = Lsn {
        segment: 0,
        position: 0,
    };

    #[inline]
    pub const fn new(segment: u64, position: u64) -> Self {
        Self { segment, position }
    }

    #[inline]
    pub fn is_zero(&self) -> bool {
        self.segment == 0 && self.position == 0
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.segment, self.position)
    }
}

/// Разбор вида "segment:position" (используется CLI wal-dump --from).
impl FromStr for Lsn {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (seg, pos) = s
            .split_once(':')
            .ok_or_else(|| anyhow!("bad LSN '{}', expected <segment>:<position>", s))?;
        Ok(Lsn::new(seg.trim().parse()?, pos.trim().parse()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_is_segment_major() {
        assert!(Lsn::new(1, 900) < Lsn::new(2, 16));
        assert!(Lsn::new(2, 16) < Lsn::new(2, 17));
        assert_eq!(Lsn::new(3, 3).max(Lsn::new(3, 1)), Lsn::new(3, 3));
    }

    #[test]
    fn parse_and_display() {
        let l: Lsn = "7:4096".parse().unwrap();
        assert_eq!(l, Lsn::new(7, 4096));
        assert_eq!(l.to_string(), "7:4096");
        assert!("7".parse::<Lsn>().is_err());
    }
}
