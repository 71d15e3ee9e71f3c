use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::time::{Duration, SystemTime};

use super::aggregator::{AggregatorOutcome, FrameAggregator};
use super::clock::Clock;
use super::config::Config;
use super::error::{ConfigError, MatcherError, WatchdogError};
use super::matcher::RunMatcher;
use super::relocator::Relocator;
use super::service::RunService;
use super::worker_status::{WatchdogState, WatchdogStatus};

/// What one poll of the pipeline did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollReport {
    pub images_saved: usize,
    pub frames_flushed: usize,
    pub labelled: usize,
    pub unmatched: usize,
    /// Steps which failed and are retried on the next poll
    pub errors: usize,
}

impl PollReport {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// The whole pipeline: watch folder -> aggregator -> unlabeled area -> matcher -> archive
pub struct ImageWatchdog<S: RunService, C: Clock> {
    config: Config,
    aggregator: FrameAggregator,
    matcher: RunMatcher<S>,
    clock: C,
    status: WatchdogStatus,
}

impl<S: RunService, C: Clock> ImageWatchdog<S, C> {
    /// Prepare the archive layout and take the experiment parameters snapshot
    pub fn new(config: Config, service: S, clock: C) -> Result<Self, WatchdogError> {
        config.validate()?;
        if !config.watch_path.is_dir() {
            return Err(ConfigError::Invalid(format!(
                "watch path {} is not a directory",
                config.watch_path.display()
            ))
            .into());
        }
        for folder in [
            config.archive_path.clone(),
            config.unlabeled_directory(),
            config.no_id_directory(),
            config.lost_frames_directory(),
        ] {
            std::fs::create_dir_all(&folder)?;
        }

        let matcher = RunMatcher::from_config(&config, service);
        matcher.store().initialize()?;
        write_parameter_snapshot(&config)?;

        spdlog::info!(
            "Watching {} for {} image(s); archive is {}",
            config.watch_path.display(),
            config.images.len(),
            config.archive_path.display()
        );
        Ok(Self {
            aggregator: FrameAggregator::from_config(&config),
            matcher,
            clock,
            status: WatchdogStatus::new(WatchdogState::Starting),
            config,
        })
    }

    pub fn status(&self) -> &WatchdogStatus {
        &self.status
    }

    pub fn matcher(&self) -> &RunMatcher<S> {
        &self.matcher
    }

    /// One aggregator step followed by one association pass.
    ///
    /// Failures of either step are logged and counted in the report; the files involved stay
    /// where they are and the next poll tries again. Only an ambiguous run match is returned,
    /// since retrying cannot resolve it.
    pub fn poll_once(&mut self) -> Result<PollReport, WatchdogError> {
        let now = self.clock.now();
        let mut report = PollReport::default();
        match self.aggregator.poll(now) {
            Ok(AggregatorOutcome::Complete { images, .. }) => report.images_saved = images.len(),
            Ok(AggregatorOutcome::TimedOut { frames_flushed, .. }) => {
                report.frames_flushed = frames_flushed
            }
            Ok(AggregatorOutcome::Idle | AggregatorOutcome::Waiting { .. }) => (),
            Err(e) => {
                spdlog::warn!("Frame aggregation failed, retrying next poll: {e}");
                report.errors += 1;
            }
        }
        let waiting_period = self.config.labelling_waiting_period();
        let association = self.associate(now, waiting_period, &mut report);
        self.record(&report);
        association?;
        Ok(report)
    }

    /// Loop `poll_once` until `stop` is set, then drain whatever is still pending.
    ///
    /// The drain also runs when the loop ends early on an error; that error is returned
    /// once the drain is done.
    pub fn run(
        &mut self,
        stop: &AtomicBool,
        tx: &Sender<WatchdogStatus>,
    ) -> Result<(), WatchdogError> {
        let watched = self.watch(stop, tx);
        if let Err(e) = &watched {
            spdlog::error!("Watch loop stopped early: {e}");
        }

        self.status.state = WatchdogState::Draining;
        let draining = tx.send(self.status.clone());
        let drained = self.shutdown();
        self.status.state = WatchdogState::Stopped;
        let stopped = tx.send(self.status.clone());

        watched?;
        drained?;
        draining?;
        stopped?;
        Ok(())
    }

    fn watch(
        &mut self,
        stop: &AtomicBool,
        tx: &Sender<WatchdogStatus>,
    ) -> Result<(), WatchdogError> {
        self.status.state = WatchdogState::Watching;
        tx.send(self.status.clone())?;
        while !stop.load(Ordering::SeqCst) {
            let report = self.poll_once()?;
            if !report.is_empty() {
                tx.send(self.status.clone())?;
            }
            std::thread::sleep(self.config.sleep_interval());
        }
        Ok(())
    }

    /// Final association pass, ignoring the labelling waiting period
    pub fn shutdown(&mut self) -> Result<PollReport, WatchdogError> {
        spdlog::info!("Draining pending images before shutdown");
        let mut report = PollReport::default();
        let association = self.associate(self.clock.now(), Duration::ZERO, &mut report);
        self.record(&report);
        association?;
        Ok(report)
    }

    /// Everything but an ambiguous match is logged and left for the next poll
    fn associate(
        &self,
        now: SystemTime,
        waiting_period: Duration,
        report: &mut PollReport,
    ) -> Result<(), WatchdogError> {
        match self.matcher.associate_with_waiting(now, waiting_period) {
            Ok(association) => {
                report.labelled = association.labelled;
                report.unmatched = association.unmatched;
            }
            Err(e @ MatcherError::AmbiguousMatch { .. }) => return Err(e.into()),
            Err(MatcherError::MissingRunId {
                timestamps,
                labelled,
            }) => {
                spdlog::warn!(
                    "No run id yet for {} timestamp(s) {timestamps:?}; retrying next poll",
                    timestamps.len()
                );
                report.labelled = labelled;
            }
            Err(MatcherError::Service(e)) => {
                spdlog::warn!("Run service unavailable, images stay pending: {e}");
                report.errors += 1;
            }
            Err(e) => {
                spdlog::warn!("Labelling failed, images stay pending: {e}");
                report.errors += 1;
            }
        }
        Ok(())
    }

    fn record(&mut self, report: &PollReport) {
        self.status.images_saved += report.images_saved;
        self.status.frames_flushed += report.frames_flushed;
        self.status.labelled += report.labelled;
        self.status.unmatched += report.unmatched;
        self.status.errors += report.errors;
    }
}

/// Copy the experiment parameters into the archive as they were at startup
fn write_parameter_snapshot(config: &Config) -> Result<(), WatchdogError> {
    let bytes = match &config.experiment_parameters_path {
        Some(path) => {
            let text = std::fs::read_to_string(path)?;
            let parameters: serde_json::Value = serde_json::from_str(&text)?;
            serde_json::to_vec_pretty(&parameters)?
        }
        None => b"{}".to_vec(),
    };
    let destination = config.experiment_parameters_snapshot_path();
    Relocator::from_config(config).replace_bytes(&bytes, &destination)?;
    spdlog::info!("Wrote experiment parameters snapshot {}", destination.display());
    Ok(())
}
