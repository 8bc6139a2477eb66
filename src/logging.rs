// SPDX-License-Identifier: MIT

use tracing_subscriber::EnvFilter;

/// Install the global fmt subscriber. `RUST_LOG` controls verbosity; the
/// default keeps the crate at info and everything else at warn. Calling this
/// twice is harmless: the second install attempt is ignored.
pub fn init() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,palaver=info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
