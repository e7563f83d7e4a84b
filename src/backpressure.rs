// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Backpressure
//!
//! [`SystemState`] is the shared saturation flag consulted by the priority scheduler and
//! by producer-side admission. It is a cheaply clonable handle: every clone observes the
//! same state.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Default)]
struct Inner {
    saturated: bool,
    last_saturated: Option<DateTime<Utc>>,
}

/// Shared saturation flag.
#[derive(Debug, Clone, Default)]
pub struct SystemState {
    inner: Arc<Mutex<Inner>>,
}

impl SystemState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the system saturated. Returns `false` when it already was.
    pub fn trigger(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.saturated {
            return false;
        }
        inner.saturated = true;
        inner.last_saturated = Some(Utc::now());
        warn!("system saturated, pausing intake");
        true
    }

    /// Clears the saturation flag. Returns `false` when it was not set.
    pub fn release(&self) -> bool {
        let mut inner = self.inner.lock();
        if !inner.saturated {
            return false;
        }
        inner.saturated = false;
        info!("system load recovered, resuming intake");
        true
    }

    pub fn is_saturated(&self) -> bool {
        self.inner.lock().saturated
    }

    /// When the flag was last raised.
    pub fn last_saturated(&self) -> Option<DateTime<Utc>> {
        self.inner.lock().last_saturated
    }
}
