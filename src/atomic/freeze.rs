//! atomic/freeze — глобальная заморозка старта новых атомарных операций.
//!
//! freeze(msg) ставит заморозку и ждёт, пока активные операции не завершатся;
//! hold(msg) только закрывает вход.
//! Пока заморозка стоит, enter() либо ждёт, либо (если хоть одна заморозка несёт
//! сообщение об ошибке) сразу падает с ModificationProhibited.

use anyhow::Result;
use std::collections::BTreeMap;
use std::sync::{Condvar, Mutex};

use crate::error::StorageError;

#[derive(Debug, Default)]
struct FreezeState {
    active: usize,
    freezes: BTreeMap<u64, Option<String>>,
    next_token: u64,
}

#[derive(Debug, Default)]
pub struct FreezeGate {
    state: Mutex<FreezeState>,
    cv: Condvar,
}

impl FreezeGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Впустить новую операцию (учитывается в active до leave()).
    pub fn enter(&self) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        loop {
            if st.freezes.is_empty() {
                st.active += 1;
                return Ok(());
            }
            if let Some(msg) = st.freezes.values().flatten().next() {
                return Err(StorageError::ModificationProhibited(msg.clone()).into());
            }
            st = self.cv.wait(st).unwrap();
        }
    }

    pub fn leave(&self) {
        let mut st = self.state.lock().unwrap();
        st.active = st.active.saturating_sub(1);
        self.cv.notify_all();
    }

    /// Заморозить и дождаться нуля активных операций. Возвращает токен для release.
    pub fn freeze(&self, error: Option<String>) -> u64 {
        let token = self.hold(error);
        let mut st = self.state.lock().unwrap();
        while st.active > 0 {
            st = self.cv.wait(st).unwrap();
        }
        token
    }

    /// Закрыть вход новым операциям, не дожидаясь уже идущих.
    pub fn hold(&self, error: Option<String>) -> u64 {
        let mut st = self.state.lock().unwrap();
        st.next_token += 1;
        let token = st.next_token;
        st.freezes.insert(token, error);
        token
    }

    pub fn release(&self, token: u64) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        if st.freezes.remove(&token).is_none() {
            return Err(StorageError::IllegalArgument(format!("unknown freeze token {}", token)).into());
        }
        self.cv.notify_all();
        Ok(())
    }

    pub fn active(&self) -> usize {
        self.state.lock().unwrap().active
    }

    pub fn is_frozen(&self) -> bool {
        !self.state.lock().unwrap().freezes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn freeze_with_error_fails_fast() -> Result<()> {
        let g = FreezeGate::new();
        let t = g.freeze(Some("backup in progress".into()));
        let err = g.enter().unwrap_err();
        assert!(matches!(
            StorageError::classify(err),
            StorageError::ModificationProhibited(_)
        ));
        g.release(t)?;
        g.enter()?;
        assert_eq!(g.active(), 1);
        g.leave();
        assert!(g.release(t).is_err());
        Ok(())
    }

    #[test]
    fn freeze_waits_for_active_and_blocks_new() -> Result<()> {
        let g = Arc::new(FreezeGate::new());
        g.enter()?;

        let g2 = g.clone();
        let freezer = std::thread::spawn(move || g2.freeze(None));
        std::thread::sleep(Duration::from_millis(50));
        assert!(!freezer.is_finished());
        g.leave();
        let token = freezer.join().unwrap();

        let g3 = g.clone();
        let starter = std::thread::spawn(move || g3.enter().is_ok());
        std::thread::sleep(Duration::from_millis(50));
        assert!(!starter.is_finished());
        g.release(token)?;
        assert!(starter.join().unwrap());
        Ok(())
    }

    #[test]
    fn hold_blocks_new_without_waiting_for_active() -> Result<()> {
        let g = Arc::new(FreezeGate::new());
        g.enter()?;
        let token = g.hold(None);
        assert_eq!(g.active(), 1);
        assert!(g.is_frozen());

        let g2 = g.clone();
        let starter = std::thread::spawn(move || g2.enter().is_ok());
        std::thread::sleep(Duration::from_millis(50));
        assert!(!starter.is_finished());
        g.leave();
        g.release(token)?;
        assert!(starter.join().unwrap());
        assert_eq!(g.active(), 1);
        Ok(())
    }
}
