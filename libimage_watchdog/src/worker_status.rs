use std::fmt;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WatchdogState {
    #[default]
    Starting,
    Watching,
    Draining,
    Stopped,
}

impl fmt::Display for WatchdogState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Starting => "starting",
            Self::Watching => "watching",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
        };
        write!(f, "{text}")
    }
}

/// Running totals sent from the watchdog thread to the front end
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchdogStatus {
    pub images_saved: usize,
    pub labelled: usize,
    pub unmatched: usize,
    pub frames_flushed: usize,
    /// Failed steps which were logged and left for a later poll
    pub errors: usize,
    pub state: WatchdogState,
}

impl WatchdogStatus {
    pub fn new(state: WatchdogState) -> Self {
        Self {
            state,
            ..Default::default()
        }
    }
}

impl fmt::Display for WatchdogStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} | saved {} | labelled {} | unmatched {} | flushed {} | errors {}",
            self.state,
            self.images_saved,
            self.labelled,
            self.unmatched,
            self.frames_flushed,
            self.errors
        )
    }
}
