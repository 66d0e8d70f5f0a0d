//! The cooldown gate shared between the forwarding and reload paths
//!
//! The gate tracks a single timestamp: when the last reload was stamped.
//! While `now - last_reload < cooldown` the gate is "Cooling" and the proxy
//! serves the placeholder page; once the window expires the gate is "Fresh"
//! and traffic flows to the upstream again. There is no explicit transition
//! back to Fresh, the predicate is re-evaluated on every check.

use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::Instant;

/// Shared gate state guarding the forwarding decision.
///
/// All reads and writes of the reload timestamp go through one async mutex.
/// A reload holds the mutex for its entire duration (see [`ReloadGuard`]),
/// so a forwarding decision can never interleave with a reload in progress.
pub struct Gate {
    state: Mutex<GateState>,
    cooldown: Duration,
}

struct GateState {
    last_reload: Instant,
}

impl Gate {
    /// Create a gate that starts inside its cooldown window.
    ///
    /// Starting Cooling is the conservative default: at process start the
    /// upstream is assumed not yet ready, so the placeholder is served for
    /// the first `cooldown` after startup.
    pub fn new(cooldown: Duration) -> Self {
        Self {
            state: Mutex::new(GateState {
                last_reload: Instant::now(),
            }),
            cooldown,
        }
    }

    /// The configured cooldown window.
    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    /// Whether the current instant falls inside the cooldown window.
    ///
    /// Evaluated fresh on every call; never cached. Blocks while a
    /// [`ReloadGuard`] is alive, so requests stall for the full duration of
    /// an in-progress reload rather than observing a half-applied state.
    pub async fn check_gated(&self) -> bool {
        let state = self.state.lock().await;
        state.last_reload.elapsed() < self.cooldown
    }

    /// Stamp the reload timestamp and take exclusive ownership of the gate.
    ///
    /// The window opens the instant this returns, before any reconfiguration
    /// step has run. The returned guard keeps the gate lock until dropped;
    /// callers hold it across the whole reload pipeline.
    pub async fn begin_reload(&self) -> ReloadGuard<'_> {
        let mut state = self.state.lock().await;
        state.last_reload = Instant::now();
        ReloadGuard { _state: state }
    }
}

/// Exclusive hold on the gate for the duration of a reload.
///
/// Dropping the guard releases the lock; RAII guarantees release on every
/// exit path of the reload handler, success or failure.
pub struct ReloadGuard<'a> {
    _state: MutexGuard<'a, GateState>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn starts_cooling_until_window_expires() {
        let gate = Gate::new(Duration::from_secs(60));

        assert!(gate.check_gated().await);

        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(gate.check_gated().await);

        // Boundary: at exactly t0 + D the gate is open
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(!gate.check_gated().await);
    }

    #[tokio::test(start_paused = true)]
    async fn reload_rearms_the_window() {
        let gate = Gate::new(Duration::from_secs(60));

        tokio::time::advance(Duration::from_secs(120)).await;
        assert!(!gate.check_gated().await);

        drop(gate.begin_reload().await);
        assert!(gate.check_gated().await);

        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(!gate.check_gated().await);
    }

    #[tokio::test(start_paused = true)]
    async fn overlapping_reloads_serialize() {
        let gate = Arc::new(Gate::new(Duration::from_secs(10)));

        let guard = gate.begin_reload().await;

        let gate2 = Arc::clone(&gate);
        let second = tokio::spawn(async move {
            let _guard = gate2.begin_reload().await;
        });

        tokio::task::yield_now().await;
        assert!(!second.is_finished());

        drop(guard);
        second.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn checks_block_while_reload_in_progress() {
        let gate = Arc::new(Gate::new(Duration::from_secs(10)));

        let guard = gate.begin_reload().await;

        let gate2 = Arc::clone(&gate);
        let check = tokio::spawn(async move { gate2.check_gated().await });

        tokio::task::yield_now().await;
        assert!(!check.is_finished());

        drop(guard);
        assert!(check.await.unwrap());
    }
}
