//! Local network interface presence checks.
//!
//! Gateway health is defined by whether its TUN device exists, so the
//! interface table is polled rather than watched.

use crate::error::{Result, VifError};
use std::time::Duration;
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};
use tracing::debug;

/// Answers "does a network interface with this name exist right now".
pub trait LinkProbe: Send + Sync {
    fn link_exists(&self, name: &str) -> bool;
}

/// Probe backed by the host interface table.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemLinkProbe;

impl LinkProbe for SystemLinkProbe {
    fn link_exists(&self, name: &str) -> bool {
        nix::net::if_::if_nametoindex(name).is_ok()
    }
}

/// Poll until `name` is present (or absent, if `present` is false).
///
/// Checks immediately, then every `poll_interval` until `deadline` expires.
/// Dropping the returned future cancels the wait.
pub async fn wait_for_link(
    probe: &dyn LinkProbe,
    name: &str,
    present: bool,
    poll_interval: Duration,
    deadline: Duration,
) -> Result<()> {
    let start = Instant::now();
    let mut ticker = interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let poll = async {
        loop {
            ticker.tick().await;
            if probe.link_exists(name) == present {
                return;
            }
        }
    };

    match timeout(deadline, poll).await {
        Ok(()) => {
            debug!(
                link = %name,
                present,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "Link reached expected state"
            );
            Ok(())
        }
        Err(_) => Err(VifError::TunTimeout { tun_name: name.to_string(), timeout: deadline }),
    }
}
