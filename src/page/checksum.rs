//! page/checksum — 8-байтовый трейлер страницы.
//!
//! - trailer[0..4] — CRC32C (LE) по всей странице с занулённым трейлером;
//! - trailer[4..8] — нули (резерв);
//! - страница из одних нулей (выделена, но ни разу не записана) считается валидной.

use anyhow::{anyhow, Result};
use byteorder::{ByteOrder, LittleEndian};

use crate::consts::PAGE_TRAILER_SIZE;

/// CRC32C страницы с мысленно занулённым трейлером (без копирования буфера).
fn page_crc(page: &[u8]) -> u32 {
    let ps = page.len();
    let c = crc32c::crc32c(&page[..ps - PAGE_TRAILER_SIZE]);
    crc32c::crc32c_append(c, &[0u8; PAGE_TRAILER_SIZE])
}

/// Обновить трейлер чексуммы страницы.
pub fn page_update_checksum(page: &mut [u8]) -> Result<()> {
    if page.len() <= PAGE_TRAILER_SIZE {
        return Err(anyhow!("page buffer too small for checksum"));
    }
    let ps = page.len();
    for b in &mut page[ps - PAGE_TRAILER_SIZE..ps] {
        *b = 0;
    }
    let crc = page_crc(page);
    LittleEndian::write_u32(&mut page[ps - PAGE_TRAILER_SIZE..ps - PAGE_TRAILER_SIZE + 4], crc);
    Ok(())
}

/// Проверить трейлер. Ok(false) — несовпадение CRC.
pub fn page_verify_checksum(page: &[u8]) -> Result<bool> {
    if page.len() <= PAGE_TRAILER_SIZE {
        return Err(anyhow!("page buffer too small for checksum"));
    }
    let ps = page.len();
    let stored = LittleEndian::read_u32(&page[ps - PAGE_TRAILER_SIZE..ps - PAGE_TRAILER_SIZE + 4]);
    if stored == 0 && page.iter().all(|b| *b == 0) {
        return Ok(true);
    }
    Ok(stored == page_crc(page))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_detects_flip() -> Result<()> {
        let mut p = vec![0u8; 1024];
        assert!(page_verify_checksum(&p)?);
        p[100] = 7;
        page_update_checksum(&mut p)?;
        assert!(page_verify_checksum(&p)?);
        p[101] ^= 1;
        assert!(!page_verify_checksum(&p)?);
        Ok(())
    }
}
