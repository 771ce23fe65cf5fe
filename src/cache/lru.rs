//! LRU чистых страниц по ключу (file_id, page_index).
//!
//! Каждое обращение получает новый тик; `order` хранит тик → ключ, так что
//! самая старая страница — первая в BTreeMap. Грязные страницы сюда не
//! попадают: владелец инвалидирует ключ при записи.
//!
//! Ёмкость 0 отключает кэш.

use std::collections::{BTreeMap, HashMap};

pub type PageKey = (u64, u64);

pub(crate) struct LruPages {
    cap: usize,
    tick: u64,
    pages: HashMap<PageKey, (u64, Vec<u8>)>,
    order: BTreeMap<u64, PageKey>,
}

impl LruPages {
    pub(crate) fn new(cap: usize) -> Self {
        Self {
            cap,
            tick: 0,
            pages: HashMap::with_capacity(cap.clamp(1, 4096)),
            order: BTreeMap::new(),
        }
    }

    fn touch(&mut self, key: PageKey) -> Option<&mut (u64, Vec<u8>)> {
        self.tick += 1;
        let tick = self.tick;
        let slot = self.pages.get_mut(&key)?;
        self.order.remove(&slot.0);
        self.order.insert(tick, key);
        slot.0 = tick;
        Some(slot)
    }

    pub(crate) fn get(&mut self, key: PageKey) -> Option<Vec<u8>> {
        if self.cap == 0 {
            return None;
        }
        self.touch(key).map(|(_, data)| data.clone())
    }

    pub(crate) fn put(&mut self, key: PageKey, data: &[u8]) {
        if self.cap == 0 {
            return;
        }
        if let Some((_, bytes)) = self.touch(key) {
            bytes.clear();
            bytes.extend_from_slice(data);
            return;
        }
        while self.pages.len() >= self.cap {
            match self.order.pop_first() {
                Some((_, victim)) => {
                    self.pages.remove(&victim);
                }
                None => break,
            }
        }
        self.tick += 1;
        self.order.insert(self.tick, key);
        self.pages.insert(key, (self.tick, data.to_vec()));
    }

    pub(crate) fn invalidate(&mut self, key: PageKey) {
        if let Some((tick, _)) = self.pages.remove(&key) {
            self.order.remove(&tick);
        }
    }

    /// Выбросить все страницы файла (удаление файла).
    pub(crate) fn invalidate_file(&mut self, file_id: u64) {
        self.pages.retain(|(f, _), _| *f != file_id);
        self.order.retain(|_, (f, _)| *f != file_id);
    }

    pub(crate) fn len(&self) -> usize {
        self.pages.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_least_recently_used() {
        let mut c = LruPages::new(2);
        c.put((1, 0), &[1]);
        c.put((1, 1), &[2]);
        assert_eq!(c.get((1, 0)), Some(vec![1]));
        c.put((2, 0), &[3]); // вытесняет (1,1)
        assert!(c.get((1, 1)).is_none());
        assert_eq!(c.len(), 2);
        c.put((2, 0), &[4, 4]);
        assert_eq!(c.get((2, 0)), Some(vec![4, 4]));
        c.invalidate_file(1);
        assert_eq!(c.len(), 1);
        c.invalidate((2, 0));
        assert_eq!(c.len(), 0);
    }

    #[test]
    fn zero_capacity_is_noop() {
        let mut c = LruPages::new(0);
        c.put((0, 0), &[9]);
        assert!(c.get((0, 0)).is_none());
    }
}
