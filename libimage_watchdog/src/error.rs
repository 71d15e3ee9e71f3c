use std::path::PathBuf;
use thiserror::Error;

use super::filename::Timestamp;
use super::worker_status::WatchdogStatus;

#[derive(Debug, Clone, Error)]
pub enum FilenameError {
    #[error("Filename {0} has no file extension")]
    MissingExtension(String),
    #[error("Filename {0} does not have the expected number of fields")]
    BadFieldCount(String),
    #[error("Could not parse timestamp {0}; expected YYYY-MM-DD--HH-MM-SS")]
    BadTimestamp(String),
    #[error("Could not parse run id {0} from filename")]
    BadRunId(String),
    #[error("Filename field {0:?} is empty or contains the delimiter")]
    BadField(String),
}

#[derive(Debug, Error)]
pub enum CheckoutError {
    #[error("Could not check out {path:?} after {attempts} attempts: {source}")]
    Timeout {
        path: PathBuf,
        attempts: u32,
        source: std::io::Error,
    },
    #[error("Could not check in {checked_out:?}; {path:?} was recreated while it was checked out")]
    Conflict { path: PathBuf, checked_out: PathBuf },
    #[error("Checkout failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum RunStoreError {
    #[error("RunMetadataStore failed due to checkout error: {0}")]
    Checkout(#[from] CheckoutError),
    #[error("RunMetadataStore failed to parse JSON: {0}")]
    ParsingError(#[from] serde_json::Error),
    #[error("RunMetadataStore expected a JSON object in {0:?}")]
    NotAnObject(PathBuf),
    #[error("RunMetadataStore failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum ScannerError {
    #[error("Could not scan directory {0:?} because it does not exist")]
    BadDirectory(PathBuf),
    #[error("Scanner failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum FitsError {
    #[error("FITS keyword {0:?} is longer than 8 characters or not ASCII")]
    BadKeyword(String),
    #[error("FITS header card for {0} does not fit in 80 characters")]
    CardTooLong(String),
    #[error("FITS data is truncated; expected {expected} bytes, found {found}")]
    Truncated { expected: usize, found: usize },
    #[error("FITS header is missing required keyword {0}")]
    MissingKeyword(&'static str),
    #[error("Only BITPIX = 8 two-dimensional images are supported, found BITPIX = {0}")]
    UnsupportedBitpix(i64),
    #[error("FITS array could not be shaped: {0}")]
    ShapeError(#[from] ndarray::ShapeError),
}

#[derive(Debug, Error)]
pub enum RelocatorError {
    #[error("Relocator refused to overwrite existing file {0:?}")]
    DestinationExists(PathBuf),
    #[error("Relocator could not find source file {0:?}")]
    MissingSource(PathBuf),
    #[error("Relocator failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum AggregatorError {
    #[error("FrameAggregator failed due to scanner error: {0}")]
    Scanner(#[from] ScannerError),
    #[error("FrameAggregator failed due to relocator error: {0}")]
    Relocator(#[from] RelocatorError),
    #[error("FrameAggregator failed to encode FITS image: {0}")]
    Fits(#[from] FitsError),
    #[error("FrameAggregator was given slot {slot} for image {image} with only {slots} slots")]
    BadSlot {
        image: String,
        slot: usize,
        slots: usize,
    },
    #[error("FrameAggregator failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Run service reported a transient failure: {0}")]
    Transient(String),
    #[error("Run service response could not be decoded: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("Run service failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Run service is unavailable after {attempts} attempts; last error: {last}")]
    RetriesExhausted { attempts: u32, last: String },
}

impl ServiceError {
    /// Errors which are worth asking the service again for
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Decode(_) | Self::IOError(_))
    }
}

#[derive(Debug, Error)]
pub enum MatcherError {
    #[error("RunMatcher failed due to scanner error: {0}")]
    Scanner(#[from] ScannerError),
    #[error("RunMatcher could not query the run service: {0}")]
    Service(#[from] ServiceError),
    #[error("RunMatcher found several runs {run_ids:?} within tolerance of {timestamp}")]
    AmbiguousMatch {
        timestamp: Timestamp,
        run_ids: Vec<u64>,
    },
    #[error("RunMatcher found no run for timestamps {timestamps:?} and missing ids are not allowed ({labelled} other groups were labelled)")]
    MissingRunId {
        timestamps: Vec<Timestamp>,
        labelled: usize,
    },
    #[error("RunMatcher failed due to RunMetadataStore error: {0}")]
    RunStore(#[from] RunStoreError),
    #[error("RunMatcher failed due to relocator error: {0}")]
    Relocator(#[from] RelocatorError),
}

#[derive(Debug, Error)]
pub enum CameraError {
    #[error("Camera hardware error: {0}")]
    Hardware(String),
    #[error("Camera returned no frame")]
    NoFrame,
    #[error("Camera failed to save frame due to relocator error: {0}")]
    Relocator(#[from] RelocatorError),
}

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("None of the legacy filename formats could parse every file in {0:?}")]
    NoMatchingFormat(PathBuf),
    #[error("Legacy migration could not find exactly one run for {timestamp}; found {run_ids:?}")]
    RunLookup {
        timestamp: Timestamp,
        run_ids: Vec<u64>,
    },
    #[error("Legacy migration would overwrite existing file {0:?}")]
    Collision(PathBuf),
    #[error("Legacy migration found no labelled images in {0:?}")]
    NoImages(PathBuf),
    #[error("Legacy migration failed due to scanner error: {0}")]
    Scanner(#[from] ScannerError),
    #[error("Legacy migration failed due to run service error: {0}")]
    Service(#[from] ServiceError),
    #[error("Legacy migration failed due to RunMetadataStore error: {0}")]
    RunStore(#[from] RunStoreError),
    #[error("Legacy migration failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration as file {0:?} does not exist")]
    BadFilePath(PathBuf),
    #[error("Config failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Config failed to parse YAML: {0}")]
    ParsingError(#[from] serde_yaml::Error),
    #[error("Config is invalid: {0}")]
    Invalid(String),
}

#[derive(Debug, Error)]
pub enum WatchdogError {
    #[error("Watchdog failed due to configuration error: {0}")]
    ConfigError(#[from] ConfigError),
    #[error("Watchdog failed due to FrameAggregator error: {0}")]
    Aggregator(#[from] AggregatorError),
    #[error("Watchdog failed due to RunMatcher error: {0}")]
    Matcher(#[from] MatcherError),
    #[error("Watchdog failed due to RunMetadataStore error: {0}")]
    RunStore(#[from] RunStoreError),
    #[error("Watchdog failed due to relocator error: {0}")]
    Relocator(#[from] RelocatorError),
    #[error("Watchdog failed to parse the experiment parameters: {0}")]
    ParsingError(#[from] serde_json::Error),
    #[error("Watchdog failed due to Send error: {0}")]
    SendError(#[from] std::sync::mpsc::SendError<WatchdogStatus>),
    #[error("Watchdog failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
}
