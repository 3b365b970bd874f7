//! Cooperative cancellation
//!
//! A [`CancellationToken`] is shared by every phase of a command. Collectors,
//! the monitor wait and the drain loop poll it. Signals are translated into
//! token calls by [`install_signal_handlers`], which only the binary calls.

use anyhow::{Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// Granularity of interruptible waits
const WAIT_SLICE: Duration = Duration::from_millis(50);

#[derive(Debug, Default)]
struct Inner {
    cancelled: AtomicBool,
    /// Stop flag of the wait currently armed, if any
    armed: Mutex<Option<Arc<AtomicBool>>>,
}

#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

/// Result of an interruptible wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Elapsed,
    /// The armed wait was stopped by an interrupt
    Stopped,
    Cancelled,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hard cancel. Every phase observing the token aborts.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Soft interrupt. Stops the armed wait (ending a monitor phase normally)
    /// the first time; with nothing armed, or on a repeat, it cancels.
    pub fn interrupt(&self) {
        let armed = match self.inner.armed.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        match armed {
            Some(flag) => flag.store(true, Ordering::SeqCst),
            None => self.cancel(),
        }
    }

    /// Arm a stop flag for the next interrupt
    pub fn arm_stop(&self) -> StopHandle {
        let flag = Arc::new(AtomicBool::new(false));
        if let Ok(mut slot) = self.inner.armed.lock() {
            *slot = Some(Arc::clone(&flag));
        }
        StopHandle {
            flag,
            token: self.clone(),
        }
    }

    /// Sleep for `duration`, waking early on cancel or, when `stop` is given,
    /// on an interrupt. `None` waits until stopped or cancelled.
    pub fn wait(&self, duration: Option<Duration>, stop: Option<&StopHandle>) -> WaitOutcome {
        let deadline = duration.map(|d| Instant::now() + d);
        loop {
            if self.is_cancelled() {
                return WaitOutcome::Cancelled;
            }
            if stop.is_some_and(StopHandle::is_stopped) {
                return WaitOutcome::Stopped;
            }
            let slice = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return WaitOutcome::Elapsed;
                    }
                    (deadline - now).min(WAIT_SLICE)
                }
                None => WAIT_SLICE,
            };
            thread::sleep(slice);
        }
    }
}

/// Stop flag armed on a token. Disarms itself when dropped.
#[derive(Debug)]
pub struct StopHandle {
    flag: Arc<AtomicBool>,
    token: CancellationToken,
}

impl StopHandle {
    pub fn is_stopped(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Stop the wait directly, as an interrupt would
    pub fn stop(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }
}

impl Drop for StopHandle {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.token.inner.armed.lock() {
            if slot.as_ref().is_some_and(|armed| Arc::ptr_eq(armed, &self.flag)) {
                *slot = None;
            }
        }
    }
}

/// Route SIGINT to `interrupt()` and SIGTERM to `cancel()` on a background thread
pub fn install_signal_handlers(token: &CancellationToken) -> Result<()> {
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM]).context("Failed to register signal handlers")?;
    let token = token.clone();

    thread::Builder::new()
        .name("signals".to_string())
        .spawn(move || {
            for signal in signals.forever() {
                match signal {
                    SIGINT => {
                        log::info!("Interrupt received");
                        token.interrupt();
                    }
                    SIGTERM => {
                        log::info!("Termination requested");
                        token.cancel();
                    }
                    _ => {}
                }
            }
        })
        .context("Failed to spawn signal thread")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interrupt_without_armed_wait_cancels() {
        let token = CancellationToken::new();
        token.interrupt();
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_first_interrupt_stops_armed_wait_second_cancels() {
        let token = CancellationToken::new();
        let stop = token.arm_stop();

        token.interrupt();
        assert!(stop.is_stopped());
        assert!(!token.is_cancelled());

        token.interrupt();
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_dropped_handle_disarms() {
        let token = CancellationToken::new();
        {
            let _stop = token.arm_stop();
        }
        token.interrupt();
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_wait_outcomes() {
        let token = CancellationToken::new();
        assert_eq!(token.wait(Some(Duration::from_millis(10)), None), WaitOutcome::Elapsed);

        let stop = token.arm_stop();
        stop.stop();
        assert_eq!(token.wait(None, Some(&stop)), WaitOutcome::Stopped);

        token.cancel();
        assert_eq!(token.wait(Some(Duration::from_secs(60)), None), WaitOutcome::Cancelled);
    }

    #[test]
    fn test_clones_share_state() {
        let token = CancellationToken::new();
        let clone = token.clone();
        let waiter = thread::spawn(move || clone.wait(None, None));
        thread::sleep(Duration::from_millis(20));
        token.cancel();
        assert_eq!(waiter.join().unwrap(), WaitOutcome::Cancelled);
    }
}
