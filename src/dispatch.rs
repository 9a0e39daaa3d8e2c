// SPDX-License-Identifier: EUPL-1.2-or-later
// Copyright © 2026-present ARI Contributors

//! Deferred-work dispatch
//!
//! Lower-layer callbacks may run on any thread and must return
//! quickly. Work that can block (port-id reservation, controller
//! notifications, queue draining, accept-path socket setup) is handed
//! to a per-shim-family [`WorkQueue`]: a single-consumer channel
//! drained by one dedicated thread, preserving submission order.

use std::thread::JoinHandle;
use tokio::sync::mpsc;

/// A single-worker queue. Items are processed strictly in submission
/// order (concurrency 1). Dropping the queue stops the worker after
/// the pending items drain.
pub struct WorkQueue<T: Send + 'static> {
    tx: Option<mpsc::UnboundedSender<T>>,
    worker: Option<JoinHandle<()>>,
}

impl<T: Send + 'static> WorkQueue<T> {
    /// Spawns the worker thread running `handler` for every posted
    /// item.
    pub fn spawn<F>(name: &str, mut handler: F) -> Self
    where
        F: FnMut(T) + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<T>();
        let worker = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                while let Some(item) = rx.blocking_recv() {
                    handler(item);
                }
            })
            .expect("failed to spawn work queue thread");

        Self {
            tx: Some(tx),
            worker: Some(worker),
        }
    }

    /// Posts one work item. Returns false if the worker is gone.
    pub fn post(&self, item: T) -> bool {
        match &self.tx {
            Some(tx) => tx.send(item).is_ok(),
            None => false,
        }
    }
}

impl<T: Send + 'static> Drop for WorkQueue<T> {
    fn drop(&mut self) {
        // Closing the channel lets the worker drain and exit. Joining
        // is skipped if the queue itself is being dropped from its own
        // worker (the last family reference held by a work item).
        self.tx.take();
        if let Some(worker) = self.worker.take() {
            if worker.thread().id() != std::thread::current().id() {
                let _ = worker.join();
            }
        }
    }
}
