//! Per-connection liveness.
//!
//! Every dispatched request resets the timer; a connection that stays idle
//! past the configured window is terminated and its resources released.

use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

pub struct HeartMonitor {
    deadline: Mutex<Instant>,
    timeout: Duration,
}

impl HeartMonitor {
    pub fn new(timeout: Duration) -> Self {
        Self {
            deadline: Mutex::new(Instant::now() + timeout),
            timeout,
        }
    }

    /// Pushes the idle deadline out by the full window.
    pub fn heartbeat(&self) {
        let mut deadline = self.deadline.lock().expect("deadline lock");
        *deadline = Instant::now() + self.timeout;
    }

    /// Resolves once the connection has been idle for the full window.
    pub async fn expired(&self) {
        loop {
            let deadline = *self.deadline.lock().expect("deadline lock");
            if Instant::now() >= deadline {
                return;
            }
            tokio::time::sleep_until(deadline).await;
        }
    }
}
