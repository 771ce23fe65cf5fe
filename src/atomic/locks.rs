//! atomic/locks — именованные эксклюзивные блокировки компонентов (кластеры,
//! индексы, реестры), удерживаемые до конца атомарной операции.
//!
//! Повторный захват той же операцией — no-op. Порядок захвата задаёт вызывающий
//! (сортировка по стабильному ключу), сам реестр дедлоки не ищет.

use std::collections::HashMap;
use std::sync::{Condvar, Mutex};

#[derive(Debug, Default)]
pub struct ComponentLocks {
    owners: Mutex<HashMap<String, u64>>,
    cv: Condvar,
}

impl ComponentLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Захватить `key` для операции `op_id`, ожидая освобождения.
    /// true — захвачен сейчас, false — уже принадлежал этой операции.
    pub fn acquire(&self, key: &str, op_id: u64) -> bool {
        let mut m = self.owners.lock().unwrap();
        loop {
            match m.get(key) {
                None => {
                    m.insert(key.to_string(), op_id);
                    return true;
                }
                Some(owner) if *owner == op_id => return false,
                Some(_) => {
                    m = self.cv.wait(m).unwrap();
                }
            }
        }
    }

    pub fn try_acquire(&self, key: &str, op_id: u64) -> bool {
        let mut m = self.owners.lock().unwrap();
        match m.get(key) {
            None => {
                m.insert(key.to_string(), op_id);
                true
            }
            Some(owner) => *owner == op_id,
        }
    }

    pub fn release_all<'a>(&self, op_id: u64, keys: impl IntoIterator<Item = &'a str>) {
        let mut m = self.owners.lock().unwrap();
        let mut any = false;
        for k in keys {
            if m.get(k) == Some(&op_id) {
                m.remove(k);
                any = true;
            }
        }
        if any {
            self.cv.notify_all();
        }
    }

    pub fn owner(&self, key: &str) -> Option<u64> {
        self.owners.lock().unwrap().get(key).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn reentrant_and_blocking() {
        let l = Arc::new(ComponentLocks::new());
        assert!(l.acquire("cluster:3", 1));
        assert!(!l.acquire("cluster:3", 1));
        assert!(!l.try_acquire("cluster:3", 2));

        let l2 = l.clone();
        let h = std::thread::spawn(move || {
            l2.acquire("cluster:3", 2);
            l2.owner("cluster:3")
        });
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(l.owner("cluster:3"), Some(1));
        l.release_all(1, ["cluster:3"]);
        assert_eq!(h.join().unwrap(), Some(2));
    }
}
