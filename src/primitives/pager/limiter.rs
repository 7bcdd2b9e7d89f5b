use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Opaque token threaded through successive [`IoLimiter::maybe_limit_io`] calls.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct IoStamp(pub u64);

impl IoStamp {
    /// Stamp handed to the first call of a flush.
    pub const INITIAL: IoStamp = IoStamp(0);
}

/// Throttles flush IO.
///
/// The flusher calls the limiter after each completed write with the number of
/// IOs finished since the previous call; the limiter may block to slow it down.
pub trait IoLimiter: Send + Sync {
    /// Accounts for `recently_completed` IOs and possibly sleeps.
    fn maybe_limit_io(&self, previous: IoStamp, recently_completed: usize) -> IoStamp;
}

/// Limiter that never blocks.
#[derive(Default, Clone, Copy, Debug)]
pub struct Unlimited;

impl IoLimiter for Unlimited {
    fn maybe_limit_io(&self, previous: IoStamp, recently_completed: usize) -> IoStamp {
        IoStamp(previous.0 + recently_completed as u64)
    }
}

const QUANTUM: Duration = Duration::from_millis(10);

struct Window {
    started: Instant,
    ios: u64,
}

/// Limiter allowing at most `ios_per_second` IOs, enforced per 10ms quantum.
pub struct RateLimiter {
    per_quantum: u64,
    window: Mutex<Window>,
}

impl RateLimiter {
    /// Creates a limiter; `ios_per_second` is clamped to at least one IO per quantum.
    pub fn new(ios_per_second: u64) -> Self {
        let quanta_per_second = (Duration::from_secs(1).as_millis() / QUANTUM.as_millis()) as u64;
        Self {
            per_quantum: (ios_per_second / quanta_per_second).max(1),
            window: Mutex::new(Window {
                started: Instant::now(),
                ios: 0,
            }),
        }
    }
}

impl IoLimiter for RateLimiter {
    fn maybe_limit_io(&self, previous: IoStamp, recently_completed: usize) -> IoStamp {
        let mut window = self.window.lock();
        window.ios += recently_completed as u64;
        if window.ios >= self.per_quantum {
            let elapsed = window.started.elapsed();
            if elapsed < QUANTUM {
                thread::sleep(QUANTUM - elapsed);
            }
            window.started = Instant::now();
            window.ios = 0;
        }
        IoStamp(previous.0 + recently_completed as u64)
    }
}
