//! Groups raw camera frames from the watch folder into logical images.
//!
//! Each aggregation attempt waits for one full synchronous set of frames, i.e. every slot of
//! every configured image. If the set completes within the lost frame patience the images are
//! written to the unlabeled area and the consumed frames are removed. Otherwise the frames the
//! attempt observed are flushed (deleted or quarantined) and the aggregator goes back to idle.
//!
//! Every attempt carries a generation number. An attempt only ever claims frames it observed
//! before its deadline, so a frame that shows up after an attempt expired is never flushed with
//! it; the frame seeds the next attempt instead.
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use fxhash::FxHashSet;
use serde::{Deserialize, Serialize};

use super::clock::Clock;
use super::config::{Config, ImageSpec};
use super::error::{AggregatorError, RelocatorError};
use super::filename::{frame_key, FrameFile, ImageFilename, Timestamp, FILENAME_DELIMITER};
use super::logical_image::LogicalImage;
use super::relocator::Relocator;
use super::retry::Patience;
use super::scanner::list_frame_files;

/// How frames are assigned to image slots
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationPolicy {
    /// Frames are recognized by the `imageName_frameName` substring of their file name
    #[default]
    MatchedName,
    /// Frames carry no usable label; they fill slots in order of modification time
    Sequential,
}

#[derive(Debug, Clone)]
struct Attempt {
    generation: u64,
    started_at: SystemTime,
    observed: FxHashSet<String>,
}

#[derive(Debug, Clone)]
enum AggregatorState {
    Idle,
    Collecting(Attempt),
}

/// The result of one aggregator step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AggregatorOutcome {
    /// No frames in the watch folder
    Idle,
    /// An attempt is running and `present` of `expected` slots are filled
    Waiting {
        generation: u64,
        present: usize,
        expected: usize,
    },
    /// The full set was seen; `images` are the new files in the unlabeled area
    Complete {
        generation: u64,
        images: Vec<PathBuf>,
        frames_consumed: usize,
    },
    /// The attempt ran out of patience and its frames were flushed
    TimedOut {
        generation: u64,
        frames_flushed: usize,
    },
}

/// A frame assigned to slot `slot` of image `image`
#[derive(Debug)]
struct Assignment<'a> {
    image: usize,
    slot: usize,
    frame: &'a FrameFile,
}

#[derive(Debug)]
pub struct FrameAggregator {
    watch_path: PathBuf,
    unlabeled_path: PathBuf,
    lost_frames_path: PathBuf,
    frame_extension: String,
    image_extension: String,
    images: Vec<ImageSpec>,
    policy: AggregationPolicy,
    lost_frame_patience: Duration,
    delete_lost_frames: bool,
    io_patience: Patience,
    relocator: Relocator,
    state: AggregatorState,
    next_generation: u64,
}

impl FrameAggregator {
    pub fn from_config(config: &Config) -> Self {
        Self {
            watch_path: config.watch_path.clone(),
            unlabeled_path: config.unlabeled_directory(),
            lost_frames_path: config.lost_frames_directory(),
            frame_extension: config.frame_extension.clone(),
            image_extension: config.image_extension.clone(),
            images: config.images.clone(),
            policy: config.aggregation,
            lost_frame_patience: config.lost_frame_patience(),
            delete_lost_frames: config.delete_lost_frames,
            io_patience: config.io_patience(),
            relocator: Relocator::from_config(config),
            state: AggregatorState::Idle,
            next_generation: 0,
        }
    }

    /// Generation of the running attempt, if any
    pub fn generation(&self) -> Option<u64> {
        match &self.state {
            AggregatorState::Idle => None,
            AggregatorState::Collecting(attempt) => Some(attempt.generation),
        }
    }

    fn expected_frames(&self) -> usize {
        self.images.iter().map(|i| i.frames.len()).sum()
    }

    fn name_filters(&self) -> Vec<String> {
        match self.policy {
            AggregationPolicy::MatchedName => self
                .images
                .iter()
                .flat_map(|i| i.frames.iter().map(|f| frame_key(&i.name, f)))
                .collect(),
            AggregationPolicy::Sequential => Vec::new(),
        }
    }

    /// Poll until the running attempt completes or times out, sleeping `sleep_interval`
    /// between steps. Returns immediately if the watch folder is empty.
    pub fn collect<C: Clock>(
        &mut self,
        clock: &C,
        sleep_interval: Duration,
    ) -> Result<AggregatorOutcome, AggregatorError> {
        loop {
            match self.poll(clock.now())? {
                AggregatorOutcome::Waiting { .. } => std::thread::sleep(sleep_interval),
                outcome => return Ok(outcome),
            }
        }
    }

    /// One non-blocking aggregation step at time `now`
    pub fn poll(&mut self, now: SystemTime) -> Result<AggregatorOutcome, AggregatorError> {
        let frames = list_frame_files(
            &self.watch_path,
            &self.frame_extension,
            &self.name_filters(),
        )?;

        let mut attempt = match std::mem::replace(&mut self.state, AggregatorState::Idle) {
            AggregatorState::Idle => {
                if frames.is_empty() {
                    return Ok(AggregatorOutcome::Idle);
                }
                let generation = self.next_generation;
                self.next_generation += 1;
                spdlog::debug!(
                    "Starting aggregation attempt {generation} with {} frame(s)",
                    frames.len()
                );
                Attempt {
                    generation,
                    started_at: now,
                    observed: FxHashSet::default(),
                }
            }
            AggregatorState::Collecting(attempt) => attempt,
        };

        let deadline = attempt.started_at + self.lost_frame_patience;
        if now >= deadline {
            let expired: Vec<&FrameFile> = frames
                .iter()
                .filter(|f| attempt.observed.contains(&f.file_name))
                .collect();
            let frames_flushed = self.flush(&expired, now)?;
            spdlog::warn!(
                "Aggregation attempt {} timed out; flushed {frames_flushed} frame(s)",
                attempt.generation
            );
            return Ok(AggregatorOutcome::TimedOut {
                generation: attempt.generation,
                frames_flushed,
            });
        }

        for frame in frames.iter() {
            attempt.observed.insert(frame.file_name.clone());
        }
        let generation = attempt.generation;
        let expected = self.expected_frames();
        let assignments = self.assign(&frames);

        if assignments.len() < expected {
            self.state = AggregatorState::Collecting(attempt);
            return Ok(AggregatorOutcome::Waiting {
                generation,
                present: assignments.len(),
                expected,
            });
        }

        // Stay in the attempt if writing fails, so the frames are flushed at the deadline
        self.state = AggregatorState::Collecting(attempt);
        let images = self.complete(&assignments)?;
        self.state = AggregatorState::Idle;
        Ok(AggregatorOutcome::Complete {
            generation,
            images,
            frames_consumed: assignments.len(),
        })
    }

    /// Match frames to slots. A slot is taken by the earliest frame that fits it; later
    /// duplicates are left in the watch folder.
    fn assign<'a>(&self, frames: &'a [FrameFile]) -> Vec<Assignment<'a>> {
        let mut ordered: Vec<&FrameFile> = frames.iter().collect();
        ordered.sort_by(|a, b| {
            a.modified
                .cmp(&b.modified)
                .then_with(|| a.file_name.cmp(&b.file_name))
        });

        let mut taken = FxHashSet::default();
        let mut assignments = Vec::new();
        match self.policy {
            AggregationPolicy::MatchedName => {
                let layouts: Vec<LogicalImage> =
                    self.images.iter().map(LogicalImage::new).collect();
                for frame in ordered {
                    let slot = layouts.iter().enumerate().find_map(|(image, layout)| {
                        layout.slot_of(&frame.file_name).map(|slot| (image, slot))
                    });
                    if let Some((image, slot)) = slot {
                        if taken.insert((image, slot)) {
                            assignments.push(Assignment { image, slot, frame });
                        }
                    }
                }
            }
            AggregationPolicy::Sequential => {
                let slots = self
                    .images
                    .iter()
                    .enumerate()
                    .flat_map(|(image, spec)| (0..spec.frames.len()).map(move |slot| (image, slot)));
                for ((image, slot), frame) in slots.zip(ordered) {
                    assignments.push(Assignment { image, slot, frame });
                }
            }
        }
        assignments
    }

    /// Build the logical images, write them to the unlabeled area and consume their frames
    fn complete(&self, assignments: &[Assignment]) -> Result<Vec<PathBuf>, AggregatorError> {
        let mut images: Vec<LogicalImage> = self.images.iter().map(LogicalImage::new).collect();
        for assignment in assignments.iter() {
            let bytes = self
                .io_patience
                .retry("Reading frame", || std::fs::read(&assignment.frame.path))?;
            images[assignment.image].fill(assignment.slot, bytes, assignment.frame.modified)?;
        }

        let latest = images
            .iter()
            .filter_map(|i| i.completed_at())
            .max()
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let timestamp = Timestamp::from_system_time(latest);

        let mut outputs = Vec::with_capacity(images.len());
        for image in images.iter() {
            let name = ImageFilename::unlabeled(timestamp, image.name(), &self.image_extension)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
            let path = self.unlabeled_path.join(name.to_string());
            if path.exists() {
                return Err(RelocatorError::DestinationExists(path).into());
            }
            outputs.push(path);
        }

        // The images of one set are published together or not at all
        let mut published: Vec<&Path> = Vec::with_capacity(outputs.len());
        for (image, path) in images.iter().zip(outputs.iter()) {
            if let Err(e) = self.publish(image, timestamp, path) {
                for written in published.iter() {
                    match remove_if_present(written) {
                        Ok(()) => spdlog::warn!("Withdrew image {}", written.display()),
                        Err(undo) => spdlog::error!(
                            "Could not withdraw image {}: {undo}",
                            written.display()
                        ),
                    }
                }
                return Err(e);
            }
            published.push(path);
        }

        for assignment in assignments.iter() {
            self.io_patience.retry("Removing consumed frame", || {
                remove_if_present(&assignment.frame.path)
            })?;
        }
        Ok(outputs)
    }

    fn publish(
        &self,
        image: &LogicalImage,
        timestamp: Timestamp,
        path: &Path,
    ) -> Result<(), AggregatorError> {
        if let Some(bytes) = image.to_fits(timestamp)? {
            self.relocator.stage_bytes(&bytes, path)?;
            spdlog::info!(
                "Saved image {} ({})",
                path.display(),
                human_bytes::human_bytes(bytes.len() as f64)
            );
        }
        Ok(())
    }

    /// Delete or quarantine `frames`. Returns how many were flushed.
    fn flush(&self, frames: &[&FrameFile], now: SystemTime) -> Result<usize, AggregatorError> {
        let flush_timestamp = Timestamp::from_system_time(now);
        let mut flushed = 0;
        for frame in frames.iter() {
            if self.delete_lost_frames {
                self.io_patience
                    .retry("Deleting lost frame", || remove_if_present(&frame.path))?;
                spdlog::info!("Deleted lost frame {}", frame.file_name);
                flushed += 1;
                continue;
            }
            let destination = self.lost_frames_path.join(format!(
                "{flush_timestamp}{FILENAME_DELIMITER}{}",
                frame.file_name
            ));
            match self.relocator.relocate(&frame.path, &destination) {
                Ok(_) => flushed += 1,
                Err(RelocatorError::MissingSource(path)) => {
                    spdlog::warn!("Lost frame {} vanished before it was flushed", path.display());
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(flushed)
    }
}

fn remove_if_present(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}
