use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};

use log::debug;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Holds at most one background task and a generation counter.
///
/// Installing a task bumps the generation and aborts the previous handle.
/// Task bodies receive their generation and should check `is_current`
/// before acting, since an abort does not reach work that already left the
/// handle (for example a detached election round).
pub struct TaskSlot {
    name: &'static str,
    generation: AtomicU64,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl TaskSlot {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            generation: AtomicU64::new(0),
            handle: Mutex::new(None),
        }
    }

    /// Cancels the pending task, if any, and installs a new one built from
    /// the next generation number. Returns that generation.
    pub async fn replace<F, Fut>(&self, task: F) -> u64
    where
        F: FnOnce(u64) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut guard = self.handle.lock().await;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(previous) = guard.take() {
            if !previous.is_finished() {
                debug!("Replacing pending {} task", self.name);
            }
            previous.abort();
        }
        *guard = Some(tokio::spawn(task(generation)));
        generation
    }

    /// Cancels the pending task. Returns false if nothing was pending.
    pub async fn cancel(&self) -> bool {
        let mut guard = self.handle.lock().await;
        self.generation.fetch_add(1, Ordering::SeqCst);
        match guard.take() {
            Some(handle) if !handle.is_finished() => {
                debug!("Cancelling pending {} task", self.name);
                handle.abort();
                true
            }
            _ => false,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    pub async fn is_active(&self) -> bool {
        self.handle
            .lock()
            .await
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }
}
