//! Engine time base and the periodic wake-up helper.
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::debug;

/// Monotonic milliseconds since engine start. All timestamps in the crate use it.
#[derive(Debug, Clone, Copy)]
pub struct EngineClock {
    origin: Instant,
}

impl EngineClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    pub fn now_ms(&self) -> f64 {
        self.origin.elapsed().as_secs_f64() * 1000.0
    }
}

impl Default for EngineClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Background thread that produces "tick available" wake-ups.
///
/// It holds no engine state. A wake-up is only produced after the previous
/// one was acknowledged with [`Ticker::request`], so wake-ups never pile up
/// behind a slow main loop.
pub struct Ticker {
    request_tx: Sender<()>,
    wake_rx: Receiver<()>,
    _thread: thread::JoinHandle<()>,
}

impl Ticker {
    pub fn spawn(interval: Duration) -> Self {
        let (request_tx, request_rx) = unbounded::<()>();
        let (wake_tx, wake_rx) = unbounded::<()>();

        let thread = thread::spawn(move || {
            // ends when the Ticker (and its request sender) is dropped
            for () in request_rx.iter() {
                thread::sleep(interval);
                if wake_tx.send(()).is_err() {
                    break;
                }
            }
            debug!("ticker stopped");
        });

        let ticker = Self {
            request_tx,
            wake_rx,
            _thread: thread,
        };
        ticker.request();
        ticker
    }

    pub fn wakes(&self) -> &Receiver<()> {
        &self.wake_rx
    }

    /// Ask for the next wake-up. Call once the current one has been handled.
    pub fn request(&self) {
        let _ = self.request_tx.send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_is_monotonic() {
        let clock = EngineClock::new();
        let a = clock.now_ms();
        let b = clock.now_ms();
        assert!(b >= a);
        assert!(a >= 0.0);
    }

    #[test]
    fn test_ticker_waits_for_request() {
        let ticker = Ticker::spawn(Duration::from_millis(1));
        ticker
            .wakes()
            .recv_timeout(Duration::from_secs(2))
            .expect("first wake-up");
        // no request yet, so no second wake-up
        assert!(ticker
            .wakes()
            .recv_timeout(Duration::from_millis(50))
            .is_err());
        ticker.request();
        assert!(ticker
            .wakes()
            .recv_timeout(Duration::from_secs(2))
            .is_ok());
    }
}
