use std::sync::{Mutex, OnceLock};
use std::time::{Duration, SystemTime};

use time::UtcOffset;

static LOCAL_OFFSET: OnceLock<UtcOffset> = OnceLock::new();

/// Determine the local UTC offset once and keep it for the life of the process.
///
/// The offset can only be read reliably while the process is single threaded, so binaries
/// should call this before spawning anything. If it cannot be determined we fall back to UTC,
/// which keeps every conversion in the process consistent with every other.
pub fn init_local_offset() -> UtcOffset {
    *LOCAL_OFFSET.get_or_init(|| match UtcOffset::current_local_offset() {
        Ok(offset) => offset,
        Err(_) => {
            spdlog::warn!("Could not determine the local UTC offset, timestamps will be UTC");
            UtcOffset::UTC
        }
    })
}

/// The offset used to turn file modification times into wall clock timestamps
pub fn local_offset() -> UtcOffset {
    init_local_offset()
}

/// Source of the current time. The watchdog never calls `SystemTime::now` directly so that
/// patience windows and waiting periods can be driven by hand.
pub trait Clock {
    fn now(&self) -> SystemTime;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// A clock which only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<SystemTime>,
}

impl ManualClock {
    pub fn new(start: SystemTime) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, step: Duration) {
        if let Ok(mut now) = self.now.lock() {
            *now += step;
        }
    }

    pub fn set(&self, time: SystemTime) {
        if let Ok(mut now) = self.now.lock() {
            *now = time;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> SystemTime {
        match self.now.lock() {
            Ok(now) => *now,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

impl<C: Clock + ?Sized> Clock for &C {
    fn now(&self) -> SystemTime {
        (**self).now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock() {
        let start = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000);
        let clock = ManualClock::new(start);
        assert_eq!(clock.now(), start);
        clock.advance(Duration::from_millis(1500));
        assert_eq!(clock.now(), start + Duration::from_millis(1500));
        clock.set(start);
        assert_eq!(clock.now(), start);
    }

    #[test]
    fn test_offset_is_stable() {
        assert_eq!(local_offset(), local_offset());
    }
}
