use anyhow::{anyhow, Result};
use std::io::Read;
use std::path::{Path, PathBuf};

use StrataDB::{StorageEngine, StrataConfig};

/// Значение аргумента: "-" (stdin), "@file", "hex:..." или литерал UTF-8.
pub fn decode_value_arg(arg: &str) -> Result<Vec<u8>> {
    if arg == "-" {
        let mut buf = Vec::new();
        std::io::stdin().read_to_end(&mut buf)?;
        return Ok(buf);
    }
    if let Some(p) = arg.strip_prefix('@') {
        let path = PathBuf::from(p);
        return std::fs::read(&path).map_err(|e| anyhow!("read value file {}: {}", path.display(), e));
    }
    if let Some(hx) = arg.strip_prefix("hex:") {
        return decode_hex(hx);
    }
    Ok(arg.as_bytes().to_vec())
}

pub fn decode_hex(s: &str) -> Result<Vec<u8>> {
    let s = s.trim();
    if s.len() % 2 != 0 {
        return Err(anyhow!("hex string must have even length"));
    }
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(s.len() / 2);
    for i in (0..bytes.len()).step_by(2) {
        let h = (bytes[i] as char)
            .to_digit(16)
            .ok_or_else(|| anyhow!("invalid hex at pos {}", i))?;
        let l = (bytes[i + 1] as char)
            .to_digit(16)
            .ok_or_else(|| anyhow!("invalid hex at pos {}", i + 1))?;
        out.push(((h << 4) | l) as u8);
    }
    Ok(out)
}

/// Печатное представление содержимого: UTF-8, если возможно, иначе hex.
pub fn display_bytes(b: &[u8]) -> String {
    match std::str::from_utf8(b) {
        Ok(s) if !s.chars().any(|c| c.is_control()) => s.to_string(),
        _ => {
            let mut out = String::with_capacity(4 + b.len() * 2);
            out.push_str("hex:");
            for x in b {
                out.push_str(&format!("{:02x}", x));
            }
            out
        }
    }
}

pub fn open_engine(path: &Path) -> Result<StorageEngine> {
    if !path.exists() {
        return Err(anyhow!("storage root does not exist: {}", path.display()));
    }
    Ok(StorageEngine::open(path, StrataConfig::from_env())?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_and_display() -> Result<()> {
        assert_eq!(decode_hex("00ff10")?, vec![0x00, 0xff, 0x10]);
        assert!(decode_hex("abc").is_err());
        assert_eq!(display_bytes(b"hello"), "hello");
        assert_eq!(display_bytes(&[0, 1]), "hex:0001");
        Ok(())
    }
}
