// SPDX-License-Identifier: MIT
// Copyright (c) 2025 the apx authors

use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the process-wide subscriber. Filter via `RUST_LOG`; defaults to
/// info.
pub fn init_logging() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_level(true)
                .with_thread_ids(true),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "apx client initialized");
}
