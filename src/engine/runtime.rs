// src/engine/runtime.rs

//! Service mode: repeat ticks until stopped.
//!
//! The loop re-ticks immediately after any advancement and sleeps the
//! configured idle delay otherwise. A store I/O failure propagates out and
//! halts the loop; that is deliberate — the engine must not keep making
//! decisions against a store it cannot write.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::engine::Engine;
use crate::errors::Result;

/// Options for [`run_service`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ServiceOptions {
    /// Exit once no target is in progress and no retry is pending
    /// (used by `run loop --once` and tests).
    pub exit_when_idle: bool,
}

/// Drive the engine until interrupted (or idle, when so configured).
pub async fn run_service(engine: &mut Engine, options: ServiceOptions) -> Result<()> {
    let idle_delay = Duration::from_millis(engine.config().idle_delay_ms);
    info!("engine service loop started");

    loop {
        let events = engine.step().await?;
        if !events.is_empty() {
            debug!(count = events.len(), "tick advanced; ticking again");
            continue;
        }

        if options.exit_when_idle && engine.is_idle() {
            info!("nothing in progress; service loop exiting");
            return Ok(());
        }

        tokio::select! {
            _ = tokio::time::sleep(idle_delay) => {}
            result = tokio::signal::ctrl_c() => {
                match result {
                    Ok(()) => {
                        info!("interrupt received; service loop exiting");
                        return Ok(());
                    }
                    Err(e) => warn!(error = %e, "failed to listen for interrupt"),
                }
            }
        }
    }
}
