use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use Clock::{FixedOffset, Mock, System};

/// A source of "now" for every time-driven component in the engine.
///
/// Metrics, hosts and the mixer never read `SystemTime::now()` directly;
/// they hold a `Clock` so tests can drive deterministic sine waves, feature
/// toggles and TTL expiry without sleeping on the wall clock.
#[derive(Debug, Clone)]
pub enum Clock {
    /// Backed by the system clock.
    System,

    /// A fixed number of seconds offset (positive or negative) from the
    /// system clock. Test use only.
    FixedOffset(i64),

    /// A clock whose value is set explicitly. Test use only.
    Mock(Arc<AtomicU64>),
}

impl Clock {
    pub fn new_mock(now: u64) -> Clock {
        Mock(Arc::new(AtomicU64::new(now)))
    }

    /// Seconds since the UNIX epoch.
    pub fn now(&self) -> u64 {
        match self {
            System => match SystemTime::now().duration_since(UNIX_EPOCH) {
                Ok(n) => n.as_secs(),
                Err(e) => panic!("SystemTime before UNIX EPOCH! {e:?}"),
            },
            FixedOffset(offset) => System.now().saturating_add_signed(*offset),
            Mock(now) => now.load(SeqCst),
        }
    }

    /// Sets the current time of this Mock clock. Test use only.
    pub fn set_time(&self, now: u64) {
        match self {
            System => unreachable!("cannot set time on the system clock"),
            FixedOffset(_) => unreachable!("cannot set time on a fixed-offset clock"),
            Mock(n) => n.store(now, SeqCst),
        }
    }

    /// Advances this Mock clock by `secs` seconds. Test use only.
    pub fn advance(&self, secs: u64) {
        match self {
            System => unreachable!("cannot advance the system clock"),
            FixedOffset(_) => unreachable!("cannot advance a fixed-offset clock"),
            Mock(n) => {
                n.fetch_add(secs, SeqCst);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_reads_back_what_was_set() {
        let clock = Clock::new_mock(1_000);
        assert_eq!(clock.now(), 1_000);
        clock.set_time(2_000);
        assert_eq!(clock.now(), 2_000);
    }

    #[test]
    fn advance_accumulates() {
        let clock = Clock::new_mock(0);
        clock.advance(25);
        clock.advance(25);
        assert_eq!(clock.now(), 50);
    }

    #[test]
    fn cloned_clocks_share_underlying_time() {
        let clock1 = Clock::new_mock(10);
        let clock2 = clock1.clone();
        clock1.set_time(20);
        assert_eq!(clock2.now(), 20);
    }

    #[test]
    fn fixed_offset_shifts_system_time() {
        let system_time = System.now();
        let clock = FixedOffset(1_000);
        assert!(clock.now() >= system_time + 1_000);
    }
}
