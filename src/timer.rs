//! Stack timer driver
//!
//! A single thread ticks the embedded stack on a fixed cadence, driving TCP
//! retransmission, delayed ACKs and the other time-based machinery. The
//! stack lock is taken only around the tick, never across the sleep. The
//! thread exits once the run flag clears, which is what unblocks
//! `Tunnel::run`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::info;

use crate::stack::Stack;

/// Tick interval
const TIMER_INTERVAL: Duration = Duration::from_millis(250);

/// Handle to the running timer thread
pub struct TimerDriver {
    handle: JoinHandle<()>,
}

impl TimerDriver {
    /// Spawn the timer thread
    #[must_use]
    pub fn start(stack: Arc<Mutex<Stack>>, run_flag: Arc<AtomicBool>) -> Self {
        let handle = std::thread::Builder::new()
            .name("stack-timer".into())
            .spawn(move || {
                info!("timer thread started");
                while run_flag.load(Ordering::Relaxed) {
                    std::thread::sleep(TIMER_INTERVAL);
                    stack.lock().tick();
                }
                info!("timer thread stopped");
            })
            .expect("spawn timer thread");
        Self { handle }
    }

    /// Block until the timer thread exits
    pub fn join(self) {
        let _ = self.handle.join();
    }
}
