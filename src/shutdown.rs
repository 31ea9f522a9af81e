//! Cooperative cancellation.
//!
//! A `Shutdown` is a cloneable token. Triggering it any number of times has the same effect as
//! triggering it once; loops poll `is_triggered` or park in `wait_timeout`, which returns early
//! when the token fires.

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

#[derive(Clone, Default)]
pub struct Shutdown {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    triggered: Mutex<bool>,
    cv: Condvar,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request shutdown. Returns `true` only for the call that actually flipped the token.
    pub fn trigger(&self) -> bool {
        let mut triggered = match self.inner.triggered.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if *triggered {
            return false;
        }
        *triggered = true;
        self.inner.cv.notify_all();
        true
    }

    pub fn is_triggered(&self) -> bool {
        match self.inner.triggered.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Sleep for up to `timeout`. Returns `true` if shutdown was requested before or during
    /// the wait.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut triggered = match self.inner.triggered.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        while !*triggered {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            triggered = match self.inner.cv.wait_timeout(triggered, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        true
    }

    /// Route SIGINT / Ctrl-C into this token. A repeated interrupt is logged and otherwise
    /// ignored, so shutdown runs once.
    pub fn install_ctrlc(&self, component: &'static str) -> Result<()> {
        let token = self.clone();
        ctrlc::set_handler(move || {
            if token.trigger() {
                log::info!("{}: interrupt received, shutting down", component);
            } else {
                log::info!("{}: shutdown already in progress", component);
            }
        })
        .context("failed to install Ctrl-C handler")
    }
}
