// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Logging Setup
//!
//! Installs a `tracing-subscriber` formatter for processes embedding the crate.

use std::str::FromStr;
use tracing::metadata::LevelFilter;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, Layer};

/// Environment variable consulted for the log level.
pub const LOG_LEVEL_ENV: &str = "LOG_LEVEL";

/// Resolves the level filter from a raw value, falling back to `default` when absent or invalid.
pub fn level_from(raw: Option<&str>, default: LevelFilter) -> LevelFilter {
    match raw {
        Some(level) => LevelFilter::from_str(level).unwrap_or_else(|_| {
            eprintln!("Invalid log level specified {level}, defaulting to {default}");
            default
        }),
        None => default,
    }
}

/// Installs the global subscriber. Subsequent calls are no-ops.
pub fn init() {
    let default = if cfg!(debug_assertions) {
        LevelFilter::TRACE
    } else {
        LevelFilter::INFO
    };

    let raw = std::env::var(LOG_LEVEL_ENV).ok();
    let level = level_from(raw.as_deref(), default);

    let _ = tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_file(false)
                .with_line_number(false)
                .compact()
                .with_ansi(true)
                .with_timer(fmt::time::ChronoUtc::rfc_3339())
                .with_filter(level),
        )
        .try_init();
}
