//! cache — контракт страничного кэша и файловая реализация.
//!
//! Ядро (атомарные операции, восстановление, чекпоинты) видит кэш только через
//! трейт `PageCache`. Политика вытеснения не оговаривается: FilePageCache держит
//! грязные страницы в памяти до flush/sync_data_files, а чистые — в LRU.
//!
//! Подмодули:
//! - file_cache.rs — FilePageCache (файлы данных в <root>/data, реестр files.json).
//! - lru.rs        — LRU чистых страниц.

pub mod file_cache;
pub(crate) mod lru;

use anyhow::Result;
use serde::Serialize;

pub use file_cache::FilePageCache;

use crate::lsn::Lsn;
use crate::page::Page;

/// Страница, не прошедшая проверку целостности.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BrokenPage {
    pub file_id: u64,
    pub file_name: String,
    pub page_index: u64,
    pub reason: String,
}

pub trait PageCache: Send + Sync {
    fn page_size(&self) -> usize;

    /// Копия страницы для чтения (грязная версия приоритетнее дисковой).
    fn load_for_read(&self, file_id: u64, page_index: u64) -> Result<Page>;

    /// Копия страницы для изменения; вернуть её следует через release_from_write.
    fn load_for_write(&self, file_id: u64, page_index: u64) -> Result<Page>;

    /// Принять изменённую страницу (LSN уже проставлен) и пометить её грязной.
    ///
    /// `start_lsn` — LSN записи AtomicUnitStart операции: грязная страница удерживает
    /// сегмент начала операции, а не только сегмент своей UpdatePage.
    fn release_from_write(&self, page: Page, start_lsn: Lsn) -> Result<()>;

    /// Выделить следующую страницу в конце файла.
    fn allocate_new_page(&self, file_id: u64) -> Result<Page>;

    /// Число логически выделенных страниц файла.
    fn filled_up_to(&self, file_id: u64) -> Result<u64>;

    /// Зарезервировать id под будущий файл (создаётся при коммите операции).
    fn book_file_id(&self, name: &str) -> Result<u64>;

    fn add_file(&self, name: &str) -> Result<u64>;

    fn add_file_with_id(&self, name: &str, file_id: u64) -> Result<()>;

    fn delete_file(&self, file_id: u64) -> Result<()>;

    fn exists(&self, file_id: u64) -> bool;

    fn exists_by_name(&self, name: &str) -> bool;

    fn file_id_by_name(&self, name: &str) -> Option<u64>;

    fn file_name(&self, file_id: u64) -> Option<String>;

    /// Вернуть в реестр файл, оставшийся на диске без записи в реестре.
    fn restore_file_by_id(&self, file_id: u64) -> Result<Option<String>>;

    /// Сбросить все грязные страницы (WAL сбрасывается первым).
    fn flush(&self) -> Result<()>;

    /// Сбросить грязные страницы, впервые испачканные в сегментах < upto_segment.
    fn sync_data_files(&self, upto_segment: u64, metadata: Option<&[u8]>) -> Result<()>;

    /// Самый ранний сегмент WAL, чьи изменения ещё не сброшены в файлы данных.
    fn min_not_flushed_segment(&self) -> Option<u64>;

    fn restore_mode_on(&self);

    fn restore_mode_off(&self);

    /// Метаданные, переданные последним sync_data_files.
    fn last_synced_metadata(&self) -> Option<Vec<u8>>;

    /// Проверить CRC всех страниц на диске.
    fn check_stored_pages(&self, listener: &mut dyn FnMut(&str)) -> Result<Vec<BrokenPage>>;

    fn close(&self) -> Result<()>;

    fn delete(&self) -> Result<()>;
}

/// Источник страниц только для чтения: кэш напрямую или атомарная операция
/// (которая видит свои ещё не закоммиченные изменения).
pub trait PageSource {
    fn read_page(&self, file_id: u64, page_index: u64) -> Result<Page>;

    fn pages_in_file(&self, file_id: u64) -> Result<u64>;
}

/// Чтение закоммиченного состояния прямо из кэша.
pub struct CacheReader<'a>(pub &'a dyn PageCache);

impl PageSource for CacheReader<'_> {
    fn read_page(&self, file_id: u64, page_index: u64) -> Result<Page> {
        self.0.load_for_read(file_id, page_index)
    }

    fn pages_in_file(&self, file_id: u64) -> Result<u64> {
        self.0.filled_up_to(file_id)
    }
}
