//! StateLock — блокировка состояния хранилища: read / write / migration.
//!
//! - read: CRUD и commit (много одновременных держателей);
//! - write: жизненный цикл и DDL (add/drop cluster, add/remove index engine);
//! - migration: пока активна, новые read ждут (используется вокруг open/recovery).

use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct St {
    readers: usize,
    writer: bool,
    migration: bool,
}

#[derive(Debug, Default)]
pub struct StateLock {
    st: Mutex<St>,
    cv: Condvar,
}

pub struct StateReadGuard<'a> {
    lock: &'a StateLock,
}

pub struct StateWriteGuard<'a> {
    lock: &'a StateLock,
}

pub struct MigrationGuard<'a> {
    lock: &'a StateLock,
}

impl StateLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read(&self) -> StateReadGuard<'_> {
        let mut st = self.st.lock().unwrap();
        while st.writer || st.migration {
            st = self.cv.wait(st).unwrap();
        }
        st.readers += 1;
        StateReadGuard { lock: self }
    }

    /// Read с ограниченным ожиданием; None — не удалось за `timeout`.
    pub fn try_read_for(&self, timeout: Duration) -> Option<StateReadGuard<'_>> {
        let deadline = Instant::now() + timeout;
        let mut st = self.st.lock().unwrap();
        while st.writer || st.migration {
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (g, _) = self.cv.wait_timeout(st, deadline - now).unwrap();
            st = g;
        }
        st.readers += 1;
        Some(StateReadGuard { lock: self })
    }

    pub fn write(&self) -> StateWriteGuard<'_> {
        let mut st = self.st.lock().unwrap();
        while st.writer || st.readers > 0 {
            st = self.cv.wait(st).unwrap();
        }
        st.writer = true;
        StateWriteGuard { lock: self }
    }

    pub fn start_migration(&self) -> MigrationGuard<'_> {
        let mut st = self.st.lock().unwrap();
        st.migration = true;
        MigrationGuard { lock: self }
    }

    fn release(&self, f: impl FnOnce(&mut St)) {
        let mut st = self.st.lock().unwrap();
        f(&mut st);
        self.cv.notify_all();
    }
}

impl Drop for StateReadGuard<'_> {
    fn drop(&mut self) {
        self.lock.release(|st| st.readers -= 1);
    }
}

impl Drop for StateWriteGuard<'_> {
    fn drop(&mut self) {
        self.lock.release(|st| st.writer = false);
    }
}

impl Drop for MigrationGuard<'_> {
    fn drop(&mut self) {
        self.lock.release(|st| st.migration = false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writer_excludes_readers() {
        let l = StateLock::new();
        let r1 = l.read();
        let r2 = l.read();
        drop((r1, r2));
        let w = l.write();
        assert!(l.try_read_for(Duration::from_millis(20)).is_none());
        drop(w);
        assert!(l.try_read_for(Duration::from_millis(20)).is_some());

        let m = l.start_migration();
        assert!(l.try_read_for(Duration::from_millis(20)).is_none());
        drop(m);
        let _r = l.read();
    }
}
