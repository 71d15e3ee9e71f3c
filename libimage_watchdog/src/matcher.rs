//! Labels saved images with the run they belong to.
//!
//! Images in the unlabeled area are grouped by acquisition timestamp. Groups older than the
//! labelling waiting period are matched against the run service in one range query, then
//! moved into the archive as `<runId>_<timestamp>_<image>.<ext>` or into `no_id` as
//! `unmatched_<timestamp>_<image>.<ext>`.
//!
//! Two orderings hold for every pass:
//! * run parameters are merged into the metadata store before any image is moved, so a
//!   reader that finds a labelled image always finds its metadata;
//! * the images of one timestamp group move together or not at all.
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use super::config::Config;
use super::error::{MatcherError, RelocatorError};
use super::filename::{ImageFilename, RunLabel, Timestamp};
use super::relocator::Relocator;
use super::run_store::{RunMetadataStore, RunParameterBatch};
use super::scanner::list_candidates;
use super::service::{RunRecord, RunService};

/// Saved images sharing one acquisition timestamp, waiting for a run id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingAssociation {
    pub timestamp: Timestamp,
    pub filenames: BTreeSet<String>,
}

/// What one association pass did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AssociationReport {
    /// Timestamp groups labelled with a run id
    pub labelled: usize,
    /// Timestamp groups moved to the no-id area
    pub unmatched: usize,
}

impl AssociationReport {
    pub fn total(&self) -> usize {
        self.labelled + self.unmatched
    }
}

#[derive(Debug)]
enum Resolution {
    Run(RunRecord),
    Unmatched,
    Deferred,
}

pub struct RunMatcher<S: RunService> {
    service: S,
    unlabeled_path: PathBuf,
    archive_path: PathBuf,
    no_id_path: PathBuf,
    image_extension: String,
    image_names: Vec<String>,
    waiting_period: Duration,
    mismatch_tolerance_secs: f64,
    allow_missing_ids: bool,
    relocator: Relocator,
    store: RunMetadataStore,
}

impl<S: RunService> RunMatcher<S> {
    pub fn from_config(config: &Config, service: S) -> Self {
        Self {
            service,
            unlabeled_path: config.unlabeled_directory(),
            archive_path: config.archive_path.clone(),
            no_id_path: config.no_id_directory(),
            image_extension: config.image_extension.clone(),
            image_names: config.image_names(),
            waiting_period: config.labelling_waiting_period(),
            mismatch_tolerance_secs: config.mismatch_tolerance_secs,
            allow_missing_ids: config.allow_missing_ids,
            relocator: Relocator::from_config(config),
            store: RunMetadataStore::from_config(config),
        }
    }

    pub fn service(&self) -> &S {
        &self.service
    }

    pub fn store(&self) -> &RunMetadataStore {
        &self.store
    }

    /// Unlabeled images at least `waiting_period` old at `now`, grouped by timestamp (oldest first)
    pub fn pending(
        &self,
        now: SystemTime,
        waiting_period: Duration,
    ) -> Result<Vec<PendingAssociation>, MatcherError> {
        let names = list_candidates(
            &self.unlabeled_path,
            &self.image_extension,
            &self.image_names,
        )?;
        let mut groups: BTreeMap<Timestamp, BTreeSet<String>> = BTreeMap::new();
        for name in names {
            let parsed = match ImageFilename::parse(&name) {
                Ok(parsed) if parsed.label == RunLabel::Unlabeled => parsed,
                Ok(_) => continue,
                Err(e) => {
                    spdlog::debug!("Skipping {name} in the unlabeled area: {e}");
                    continue;
                }
            };
            let age = now
                .duration_since(parsed.timestamp.to_system_time())
                .unwrap_or(Duration::ZERO);
            if age >= waiting_period {
                groups.entry(parsed.timestamp).or_default().insert(name);
            }
        }
        Ok(groups
            .into_iter()
            .map(|(timestamp, filenames)| PendingAssociation {
                timestamp,
                filenames,
            })
            .collect())
    }

    /// Label every pending group old enough at `now`. Returns the number of groups moved.
    pub fn associate(&self, now: SystemTime) -> Result<usize, MatcherError> {
        Ok(self
            .associate_with_waiting(now, self.waiting_period)?
            .total())
    }

    /// `associate` with an explicit waiting period; the shutdown drain uses zero.
    ///
    /// Nothing is consumed if the service fails or any group matches several runs. Groups
    /// with no run while missing ids are not allowed stay pending, the rest are processed,
    /// and `MatcherError::MissingRunId` then lists the groups left behind.
    pub fn associate_with_waiting(
        &self,
        now: SystemTime,
        waiting_period: Duration,
    ) -> Result<AssociationReport, MatcherError> {
        let groups = self.pending(now, waiting_period)?;
        let (first, last) = match (groups.first(), groups.last()) {
            (Some(first), Some(last)) => (first.timestamp, last.timestamp),
            _ => return Ok(AssociationReport::default()),
        };

        let tolerance = self.mismatch_tolerance_secs;
        let runs = self
            .service
            .get_runs_by_time_range(first.shifted(-tolerance), last.shifted(tolerance))?;

        let mut resolutions = Vec::with_capacity(groups.len());
        for group in groups.iter() {
            resolutions.push(self.resolve(group, &runs)?);
        }

        let mut batch = RunParameterBatch::new();
        for resolution in resolutions.iter() {
            if let Resolution::Run(run) = resolution {
                batch.insert(run.run_id, run.stored_parameters());
            }
        }
        self.store.merge(&batch)?;

        let mut report = AssociationReport::default();
        let mut deferred = Vec::new();
        for (group, resolution) in groups.iter().zip(resolutions.into_iter()) {
            match resolution {
                Resolution::Run(run) => {
                    self.move_group(group, &self.archive_path, |name| {
                        name.labelled(run.run_id)
                    })?;
                    spdlog::info!(
                        "Labelled {} image(s) at {} with run {}",
                        group.filenames.len(),
                        group.timestamp,
                        run.run_id
                    );
                    report.labelled += 1;
                }
                Resolution::Unmatched => {
                    self.move_group(group, &self.no_id_path, |name| name.unmatched())?;
                    spdlog::warn!(
                        "No run found for {} image(s) at {}; moved to {}",
                        group.filenames.len(),
                        group.timestamp,
                        self.no_id_path.display()
                    );
                    report.unmatched += 1;
                }
                Resolution::Deferred => deferred.push(group.timestamp),
            }
        }

        if !deferred.is_empty() {
            return Err(MatcherError::MissingRunId {
                timestamps: deferred,
                labelled: report.labelled,
            });
        }
        Ok(report)
    }

    fn resolve(
        &self,
        group: &PendingAssociation,
        runs: &[RunRecord],
    ) -> Result<Resolution, MatcherError> {
        let mut candidates: Vec<&RunRecord> = runs
            .iter()
            .filter(|r| r.runtime.seconds_since(&group.timestamp).abs() <= self.mismatch_tolerance_secs)
            .collect();
        candidates.sort_by_key(|r| r.run_id);
        candidates.dedup_by_key(|r| r.run_id);
        match candidates.as_slice() {
            [run] => Ok(Resolution::Run((*run).clone())),
            [] if self.allow_missing_ids => Ok(Resolution::Unmatched),
            [] => Ok(Resolution::Deferred),
            several => Err(MatcherError::AmbiguousMatch {
                timestamp: group.timestamp,
                run_ids: several.iter().map(|r| r.run_id).collect(),
            }),
        }
    }

    /// Move every file of `group` into `folder` under the name `rename` gives it. If one move
    /// fails, the files already moved are put back.
    fn move_group<F>(
        &self,
        group: &PendingAssociation,
        folder: &Path,
        rename: F,
    ) -> Result<(), MatcherError>
    where
        F: Fn(&ImageFilename) -> ImageFilename,
    {
        let mut moves = Vec::with_capacity(group.filenames.len());
        for name in group.filenames.iter() {
            let parsed = match ImageFilename::parse(name) {
                Ok(parsed) => parsed,
                Err(_) => continue,
            };
            let destination = folder.join(rename(&parsed).to_string());
            if destination.exists() {
                return Err(RelocatorError::DestinationExists(destination).into());
            }
            moves.push((self.unlabeled_path.join(name), destination));
        }

        for (idx, (source, destination)) in moves.iter().enumerate() {
            if let Err(e) = self.relocator.relocate(source, destination) {
                for (source, destination) in moves[..idx].iter().rev() {
                    if let Err(undo) = self.relocator.relocate(destination, source) {
                        spdlog::error!(
                            "Could not roll {} back to {}: {undo}",
                            destination.display(),
                            source.display()
                        );
                    }
                }
                return Err(e.into());
            }
        }
        Ok(())
    }
}
