//! Periodic telemetry polling
//!
//! A timer thread that enqueues a voltage and a current reading at a fixed
//! rate while the connection is running.

use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::{Command, CommandKind, CommandSender};

/// Handle to a running poll timer; stops the timer when dropped
pub struct PollSource {
    stop_tx: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl PollSource {
    /// Start ticking: first tick after `delay`, then every `period`
    ///
    /// Ticks are scheduled at a fixed rate from the start time, so a slow
    /// enqueue does not drift the schedule.
    pub fn start(sender: CommandSender, delay: Duration, period: Duration) -> Self {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();

        let spawned = thread::Builder::new()
            .name("labpower-poll".to_string())
            .spawn(move || {
                let mut next_tick = Instant::now() + delay;
                loop {
                    let wait = next_tick.saturating_duration_since(Instant::now());
                    match stop_rx.recv_timeout(wait) {
                        Err(RecvTimeoutError::Timeout) => {
                            sender.add_command(Command::query(CommandKind::ReadVoltage));
                            sender.add_command(Command::query(CommandKind::ReadCurrent));
                            next_tick += period;
                        }
                        // Stop requested or the handle is gone
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                debug!("Poll timer stopped");
            });

        let thread = match spawned {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!("Can't start poll timer: {}", e);
                None
            }
        };

        Self {
            stop_tx: Some(stop_tx),
            thread,
        }
    }

    /// Stop the timer and wait for its thread
    pub fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }

    /// Whether the timer thread is still alive
    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for PollSource {
    fn drop(&mut self) {
        self.stop();
    }
}
