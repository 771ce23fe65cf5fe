//! atomic/operation — одна атомарная операция: буфер изменённых страниц и файлов.
//!
//! Ничего не пишется ни в кэш, ни в WAL, пока операция не закоммичена менеджером.
//! Страница при первой загрузке запоминает свой LSN (initial_lsn) и исходный образ;
//! при коммите из пары (исходный образ, итоговый образ) строится diff для UpdatePage.
//! Откат = выбросить буферы: кэш никогда не видел изменений операции.

use anyhow::{anyhow, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::cache::{PageCache, PageSource};
use crate::error::StorageError;
use crate::lsn::Lsn;
use crate::page::Page;

pub(crate) struct BufferedPage {
    /// Образ на момент загрузки (None — страница добавлена этой операцией).
    pub(crate) original: Option<Vec<u8>>,
    pub(crate) current: Page,
    pub(crate) initial_lsn: Lsn,
}

pub struct AtomicOperation {
    op_id: u64,
    start_lsn: Lsn,
    start_segment: u64,
    metadata: Option<Vec<u8>>,
    cache: Arc<dyn PageCache>,
    pub(crate) pages: BTreeMap<(u64, u64), BufferedPage>,
    /// file_id -> число страниц, добавленных операцией в конец файла.
    pub(crate) appended: BTreeMap<u64, u64>,
    pub(crate) files_to_create: BTreeMap<u64, String>,
    pub(crate) files_to_delete: BTreeSet<u64>,
    pub(crate) locked: BTreeSet<String>,
}

impl AtomicOperation {
    pub(crate) fn new(
        op_id: u64,
        start_lsn: Lsn,
        metadata: Option<Vec<u8>>,
        cache: Arc<dyn PageCache>,
    ) -> Self {
        Self {
            op_id,
            start_lsn,
            start_segment: start_lsn.segment,
            metadata,
            cache,
            pages: BTreeMap::new(),
            appended: BTreeMap::new(),
            files_to_create: BTreeMap::new(),
            files_to_delete: BTreeSet::new(),
            locked: BTreeSet::new(),
        }
    }

    #[inline]
    pub fn op_id(&self) -> u64 {
        self.op_id
    }

    #[inline]
    pub fn start_lsn(&self) -> Lsn {
        self.start_lsn
    }

    #[inline]
    pub fn start_segment(&self) -> u64 {
        self.start_segment
    }

    pub fn metadata(&self) -> Option<&[u8]> {
        self.metadata.as_deref()
    }

    /// Заменить метаданные операции (попадут в AtomicUnitStart/End).
    pub fn set_metadata(&mut self, metadata: Option<Vec<u8>>) {
        self.metadata = metadata;
    }

    pub fn page_size(&self) -> usize {
        self.cache.page_size()
    }

    /// Компоненты, заблокированные операцией до её завершения.
    pub fn locked_objects(&self) -> impl Iterator<Item = &str> {
        self.locked.iter().map(|s| s.as_str())
    }

    /// Есть ли что записывать в WAL при коммите.
    pub fn has_changes(&self) -> bool {
        !self.pages.is_empty() || !self.files_to_create.is_empty() || !self.files_to_delete.is_empty()
    }

    fn check_file_alive(&self, file_id: u64) -> Result<()> {
        if self.files_to_delete.contains(&file_id) {
            return Err(anyhow!(
                "file {} is deleted inside atomic operation {}",
                file_id,
                self.op_id
            ));
        }
        if !self.files_to_create.contains_key(&file_id) && !self.cache.exists(file_id) {
            return Err(anyhow!("file {} does not exist", file_id));
        }
        Ok(())
    }

    fn base_pages(&self, file_id: u64) -> Result<u64> {
        if self.files_to_create.contains_key(&file_id) {
            Ok(0)
        } else {
            self.cache.filled_up_to(file_id)
        }
    }

    /// Страница для изменения; загружается в буфер операции при первом обращении.
    pub fn page_mut(&mut self, file_id: u64, page_index: u64) -> Result<&mut Page> {
        if !self.pages.contains_key(&(file_id, page_index)) {
            self.check_file_alive(file_id)?;
            let page = self.cache.load_for_write(file_id, page_index)?;
            let initial_lsn = page.lsn();
            self.pages.insert(
                (file_id, page_index),
                BufferedPage {
                    original: Some(page.as_bytes().to_vec()),
                    current: page,
                    initial_lsn,
                },
            );
        }
        self.pages
            .get_mut(&(file_id, page_index))
            .map(|b| &mut b.current)
            .ok_or_else(|| anyhow!("page {}:{} vanished from operation buffer", file_id, page_index))
    }

    /// Добавить страницу в конец файла; возвращает её индекс.
    pub fn add_page(&mut self, file_id: u64) -> Result<u64> {
        self.check_file_alive(file_id)?;
        let index = self.base_pages(file_id)? + self.appended.get(&file_id).copied().unwrap_or(0);
        *self.appended.entry(file_id).or_insert(0) += 1;
        self.pages.insert(
            (file_id, index),
            BufferedPage {
                original: None,
                current: Page::new(file_id, index, self.cache.page_size()),
                initial_lsn: Lsn::ZERO,
            },
        );
        Ok(index)
    }

    /// Число страниц файла с учётом добавленных операцией.
    pub fn filled_up_to(&self, file_id: u64) -> Result<u64> {
        self.check_file_alive(file_id)?;
        Ok(self.base_pages(file_id)? + self.appended.get(&file_id).copied().unwrap_or(0))
    }

    /// Зарегистрировать новый файл; на диске он появится при коммите.
    pub fn add_file(&mut self, name: &str) -> Result<u64> {
        if self.file_id_by_name(name).is_some() {
            return Err(StorageError::IllegalArgument(format!("file '{}' already exists", name)).into());
        }
        let id = self.cache.book_file_id(name)?;
        self.files_to_create.insert(id, name.to_string());
        Ok(id)
    }

    pub fn delete_file(&mut self, file_id: u64) -> Result<()> {
        self.check_file_alive(file_id)?;
        if self.files_to_create.remove(&file_id).is_some() {
            // файл родился и умер внутри операции: в WAL его нет вовсе
            self.pages.retain(|(f, _), _| *f != file_id);
            self.appended.remove(&file_id);
            return Ok(());
        }
        self.pages.retain(|(f, _), _| *f != file_id);
        self.appended.remove(&file_id);
        self.files_to_delete.insert(file_id);
        Ok(())
    }

    pub fn file_id_by_name(&self, name: &str) -> Option<u64> {
        if let Some((id, _)) = self.files_to_create.iter().find(|(_, n)| n.as_str() == name) {
            return Some(*id);
        }
        self.cache
            .file_id_by_name(name)
            .filter(|id| !self.files_to_delete.contains(id))
    }

    pub fn is_file_exists(&self, name: &str) -> bool {
        self.file_id_by_name(name).is_some()
    }
}

impl PageSource for AtomicOperation {
    fn read_page(&self, file_id: u64, page_index: u64) -> Result<Page> {
        if let Some(b) = self.pages.get(&(file_id, page_index)) {
            return Ok(b.current.clone());
        }
        self.check_file_alive(file_id)?;
        if self.files_to_create.contains_key(&file_id) {
            return Err(anyhow!(
                "page {}:{} of a file created by this operation was never added",
                file_id,
                page_index
            ));
        }
        self.cache.load_for_read(file_id, page_index)
    }

    fn pages_in_file(&self, file_id: u64) -> Result<u64> {
        self.filled_up_to(file_id)
    }
}

impl std::fmt::Debug for AtomicOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AtomicOperation")
            .field("op_id", &self.op_id)
            .field("start_lsn", &self.start_lsn)
            .field("pages", &self.pages.len())
            .field("files_to_create", &self.files_to_create)
            .field("files_to_delete", &self.files_to_delete)
            .field("locked", &self.locked)
            .finish()
    }
}
