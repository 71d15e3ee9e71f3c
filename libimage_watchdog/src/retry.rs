use std::fmt::Display;
use std::time::Duration;

/// How long we are willing to put up with a misbehaving file system (network drive latency,
/// anti-virus locks, a camera still writing) before giving up on an operation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Patience {
    pub attempts: u32,
    pub interval: Duration,
}

impl Patience {
    pub fn new(attempts: u32, interval: Duration) -> Self {
        Self { attempts, interval }
    }

    /// Try `op` up to `attempts` times with a fixed sleep in between.
    /// The last error is returned once we run out of patience.
    pub fn retry<T, E, F>(&self, what: &str, mut op: F) -> Result<T, E>
    where
        E: Display,
        F: FnMut() -> Result<T, E>,
    {
        let attempts = self.attempts.max(1);
        let mut attempt = 1;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(e) if attempt < attempts => {
                    spdlog::warn!("{what} failed (attempt {attempt} of {attempts}): {e}");
                    std::thread::sleep(self.interval);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Default for Patience {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(100))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_recovers() {
        let patience = Patience::new(3, Duration::from_millis(1));
        let mut calls = 0;
        let result: Result<i32, String> = patience.retry("test", || {
            calls += 1;
            if calls < 3 {
                Err(String::from("busy"))
            } else {
                Ok(7)
            }
        });
        assert_eq!(result, Ok(7));
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_retry_gives_up() {
        let patience = Patience::new(2, Duration::from_millis(1));
        let mut calls = 0;
        let result: Result<(), String> = patience.retry("test", || {
            calls += 1;
            Err(format!("busy {calls}"))
        });
        assert_eq!(result, Err(String::from("busy 2")));
        assert_eq!(calls, 2);
    }
}
