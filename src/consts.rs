//! Общие константы форматов (meta, registry, pages, WAL, clusters, indexes).

// -------- Meta --------
pub const MAGIC: &[u8; 8] = b"STRMETA1";
pub const META_FILE: &str = "meta";
pub const META_VERSION: u32 = 1;

// -------- Registry (clusters / index engines) --------
pub const STORAGE_REGISTRY_FILE: &str = "storage.json";
pub const FILE_REGISTRY_FILE: &str = "files.json";
pub const LOCK_FILE: &str = "LOCK";

// -------- Pages --------
// [MAGIC4][ver u16][flags u16][lsn_segment u64][lsn_position u64] ... [crc32c u32][reserved u32]
pub const PAGE_MAGIC: &[u8; 4] = b"STPG";
pub const PAGE_VERSION: u16 = 1;
pub const PAGE_HDR_SIZE: usize = 24;
pub const PAGE_TRAILER_SIZE: usize = 8;
pub const DEFAULT_PAGE_SIZE: u32 = 8192;
pub const MIN_PAGE_SIZE: u32 = 1024;
pub const MAX_PAGE_SIZE: u32 = 1 << 20;

pub const NO_PAGE: u64 = u64::MAX;

// -------- Data files --------
pub const DATA_DIR: &str = "data";
pub const CLUSTER_DATA_EXT: &str = "pcl";
pub const CLUSTER_MAP_EXT: &str = "cpm";
pub const HASH_INDEX_EXT: &str = "hix";

// -------- WAL --------
pub const WAL_DIR: &str = "wal";
pub const WAL_SEG_PREFIX: &str = "wal-";
pub const WAL_SEG_EXT: &str = "log";
pub const WAL_MAGIC: &[u8; 8] = b"STRWAL01";
/// [magic8][segment_id u64]
pub const WAL_HDR_SIZE: usize = 16;
pub const DEFAULT_WAL_SEGMENT_SIZE: u64 = 64 * 1024 * 1024;

// Формат кадра WAL:
// [type u8][flags u8][reserved u16][len u32][crc32c u32][payload...]
// CRC считается по header[0..8] + payload.
pub const WAL_REC_HDR_SIZE: usize = 12;
pub const WAL_REC_OFF_TYPE: usize = 0;
pub const WAL_REC_OFF_FLAGS: usize = 1;
pub const WAL_REC_OFF_RESERVED: usize = 2;
pub const WAL_REC_OFF_LEN: usize = 4;
pub const WAL_REC_OFF_CRC32: usize = 8;
/// Верхняя граница payload одного кадра (защита от мусора в len).
pub const WAL_MAX_PAYLOAD: u32 = 64 * 1024 * 1024;

// Типы записей WAL (0 — конец данных сегмента / преаллоцированный хвост).
pub const WAL_REC_END_OF_SEGMENT: u8 = 0;
pub const WAL_REC_ATOMIC_UNIT_START: u8 = 1;
pub const WAL_REC_ATOMIC_UNIT_END: u8 = 2;
pub const WAL_REC_UPDATE_PAGE: u8 = 3;
pub const WAL_REC_FILE_CREATED: u8 = 4;
pub const WAL_REC_FILE_DELETED: u8 = 5;
pub const WAL_REC_HIGH_LEVEL_TX_CHANGE: u8 = 6;
pub const WAL_REC_METADATA: u8 = 7;
pub const WAL_REC_NON_TX_OPERATION: u8 = 8;
pub const WAL_REC_EMPTY: u8 = 9;

// -------- Records / MVCC --------
/// Версия без проверки: сервер инкрементирует.
pub const VERSION_UNCHECKED: i32 = -1;
/// Версия без проверки и без инкремента.
pub const VERSION_PRESERVE: i32 = -2;

// -------- Locks --------
pub const DEFAULT_RECORD_LOCK_STRIPES: usize = 64;
pub const DEFAULT_INDEX_BUCKETS: u32 = 64;
