// src/host/pool.rs

//! Per-host session limiting.
//!
//! Host connections are pooled per host key; the pool hands out permits so
//! that no host sees more than `max_per_host` concurrent sessions, whatever
//! the engine's worker parallelism is.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};

use crate::host::Host;

/// Caps concurrent sessions per host.
#[derive(Debug)]
pub struct SessionPool {
    max_per_host: usize,
    semaphores: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl SessionPool {
    pub fn new(max_per_host: usize) -> Self {
        Self {
            max_per_host,
            semaphores: Mutex::new(HashMap::new()),
        }
    }

    /// Wait for a session slot on `host`. The slot is released when the
    /// returned permit is dropped.
    pub async fn acquire(&self, host: &Host) -> OwnedSemaphorePermit {
        let sem = {
            let mut map = self.semaphores.lock().await;
            map.entry(host.key())
                .or_insert_with(|| Arc::new(Semaphore::new(self.max_per_host)))
                .clone()
        };
        match sem.acquire_owned().await {
            Ok(permit) => permit,
            // Semaphores in this pool are never closed.
            Err(_) => unreachable!("session semaphore closed"),
        }
    }

    /// Take a slot only if one is free right now.
    pub async fn try_acquire(&self, host: &Host) -> Option<OwnedSemaphorePermit> {
        let sem = {
            let mut map = self.semaphores.lock().await;
            map.entry(host.key())
                .or_insert_with(|| Arc::new(Semaphore::new(self.max_per_host)))
                .clone()
        };
        sem.try_acquire_owned().ok()
    }
}
