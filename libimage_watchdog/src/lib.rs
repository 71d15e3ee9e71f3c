//! # image_watchdog
//!
//! image_watchdog watches the folder cameras drop their frames into, stacks the frames of each
//! shot into logical images, labels every image with the experiment run it belongs to, and
//! files it into a run-labelled archive. Run parameters are collected alongside the images in
//! a JSON file which several processes (e.g. live analysis) can read and update concurrently.
//!
//! ## Installation
//!
//! The only method of install is from source. To build and install the CLI use
//! `cargo install --path ./image_watchdog_cli` from the top level repository. To use the CLI
//! see the `image_watchdog_cli` README.
//!
//! ### Platform Support
//!
//! image_watchdog aims to support Linux, MacOS, and Windows. The archive may live on a network
//! share; every write into it goes through a stage-then-rename protocol and transient I/O
//! errors are retried.
//!
//! ## Pipeline
//!
//! ```text
//! watch folder --(FrameAggregator)--> unlabeled area --(RunMatcher)--> archive
//!                                                          |
//!                                                          +--> run_params_dump.json
//! ```
//!
//! - The [`aggregator::FrameAggregator`] waits for a full set of frames (every frame of every
//! configured image). Frames are recognized by the `imageName_frameName` part of their file
//! name, or taken in order of arrival for cameras which cannot label frames. A set that is
//! not complete within `lost_frame_patience_secs` is deleted or moved to `lost_frames`.
//! - The [`matcher::RunMatcher`] waits `labelling_waiting_period_secs`, asks the run service for
//! the runs around the pending timestamps, merges their parameters into the
//! [`run_store::RunMetadataStore`] and only then moves the images into the archive.
//! - The [`checkout::CheckoutLock`] serializes updates to the metadata file across processes by
//! renaming it while it is held.
//!
//! ## Configuration
//!
//! The YAML format of a configuration file is as follows:
//!
//! ```yml
//! watch_path: /data/camera
//! archive_path: /data/archive
//! unlabeled_path: null
//! frame_extension: fits
//! image_extension: fits
//! images:
//! - name: TopA
//!   frames:
//!   - PWA
//!   - PWOA
//! aggregation: matched_name
//! lost_frame_patience_secs: 10.0
//! delete_lost_frames: false
//! sleep_interval_secs: 0.1
//! labelling_waiting_period_secs: 5.0
//! mismatch_tolerance_secs: 5.0
//! allow_missing_ids: true
//! checkout_patience: 3
//! checkout_retry_secs: 0.1
//! conflict_policy: fail
//! io_patience: 3
//! io_retry_secs: 0.1
//! service_attempts: 5
//! service_retry_secs: 0.2
//! run_log_path: /data/control/runs.json
//! experiment_parameters_path: null
//! ```
//!
//! If `unlabeled_path` is `null`, completed images wait in `<archive_path>/unlabeled`.
//!
//! ## Output
//!
//! ```text
//! archive/
//! |---- 42_2024-01-01--00-00-00_TopA.fits
//! |---- run_params_dump.json              {"42": {"run_id": 42, "runtime": ..., ...}}
//! |---- experiment_parameters.json        snapshot taken at startup
//! |---- unlabeled/2024-01-01--00-00-05_TopA.fits
//! |---- no_id/unmatched_2024-01-01--00-00-00_TopA.fits
//! |---- lost_frames/2024-01-01--00-00-10_2024-01-01--00-00-00_TopA_PWA.fits
//! ```
//!
//! Images are single HDU FITS files, one row of 8-bit pixels per frame.
pub mod aggregator;
pub mod camera;
pub mod checkout;
pub mod clock;
pub mod config;
pub mod error;
pub mod filename;
pub mod fits;
pub mod logical_image;
pub mod matcher;
pub mod migration;
pub mod relocator;
pub mod retry;
pub mod run_store;
pub mod scanner;
pub mod service;
pub mod watchdog;
pub mod worker_status;
