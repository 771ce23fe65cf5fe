//! WAL vacuum: фоновый поток нечётких чекпоинтов.
//!
//! Журнал дёргает request() при переходе в новый сегмент. Одновременно идёт не
//! больше одного прогона: запрос, пришедший во время работы, отбрасывается.
//! Прогон повторяет нечёткий чекпоинт, пока watermark не перестанет расти
//! (не больше vacuum_max_rounds раз), затем сбрасывает страницы до него.

use anyhow::{Context, Result};
use log::{debug, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use super::Checkpointer;

enum VacuumMsg {
    Run,
    Stop,
}

/// Клонируемая ручка для запросов прогона (её держит checkpoint listener журнала).
#[derive(Clone)]
pub struct VacuumHandle {
    tx: Arc<Mutex<Sender<VacuumMsg>>>,
    running: Arc<AtomicBool>,
}

impl VacuumHandle {
    pub fn request(&self) {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("wal vacuum: run already in progress, request dropped");
            return;
        }
        if self.tx.lock().unwrap().send(VacuumMsg::Run).is_err() {
            self.running.store(false, Ordering::Release);
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

pub struct WalVacuum {
    handle: VacuumHandle,
    thread: Option<JoinHandle<()>>,
}

impl WalVacuum {
    pub fn start(cp: Arc<Checkpointer>) -> Result<Self> {
        let (tx, rx) = channel();
        let running = Arc::new(AtomicBool::new(false));
        let flag = running.clone();
        let thread = std::thread::Builder::new()
            .name("strata-wal-vacuum".into())
            .spawn(move || worker(cp, rx, flag))
            .context("spawn wal vacuum thread")?;
        Ok(Self {
            handle: VacuumHandle {
                tx: Arc::new(Mutex::new(tx)),
                running,
            },
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> VacuumHandle {
        self.handle.clone()
    }

    /// Остановить поток и дождаться его (текущий прогон доводится до конца).
    pub fn stop(&mut self) {
        let _ = self.handle.tx.lock().unwrap().send(VacuumMsg::Stop);
        if let Some(t) = self.thread.take() {
            if t.join().is_err() {
                warn!("wal vacuum: worker thread panicked");
            }
        }
    }
}

impl Drop for WalVacuum {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker(cp: Arc<Checkpointer>, rx: Receiver<VacuumMsg>, running: Arc<AtomicBool>) {
    for msg in rx {
        match msg {
            VacuumMsg::Run => {
                if let Err(e) = run_rounds(&cp) {
                    cp.errors().handle("wal_vacuum", e);
                }
                running.store(false, Ordering::Release);
            }
            VacuumMsg::Stop => break,
        }
    }
    debug!("wal vacuum: worker stopped");
}

/// Один прогон очистки; возвращает достигнутый watermark.
pub fn run_rounds(cp: &Checkpointer) -> Result<Option<u64>> {
    if cp.errors().is_set() {
        return Ok(None);
    }
    let mut last: Option<u64> = None;
    for _ in 0..cp.vacuum_max_rounds() {
        let w = cp.make_fuzzy_checkpoint()?.watermark();
        if w.is_none() || w == last {
            break;
        }
        last = w;
    }
    if let Some(w) = last {
        cp.sync_up_to(w)?;
    }
    cp.metrics.record_vacuum_run();
    debug!("wal vacuum: run finished, watermark={:?}", last);
    Ok(last)
}
