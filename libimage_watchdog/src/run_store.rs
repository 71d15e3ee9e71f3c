use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};

use super::checkout::{CheckoutLock, CheckoutMode};
use super::config::Config;
use super::error::{CheckoutError, RunStoreError};
use super::retry::Patience;

/// Parameters of one run, as reported by the run service
pub type RunParameters = Map<String, Value>;

/// The run parameters discovered during one poll iteration, waiting to be merged into the store.
///
/// Owned by the caller of that iteration and handed to `RunMetadataStore::merge` explicitly.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunParameterBatch {
    runs: BTreeMap<u64, RunParameters>,
}

impl RunParameterBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, run_id: u64, parameters: RunParameters) {
        self.runs.insert(run_id, parameters);
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn run_ids(&self) -> Vec<u64> {
        self.runs.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&u64, &RunParameters)> {
        self.runs.iter()
    }
}

/// The run_params_dump.json file: run id (as a string key) -> parameters.
///
/// Writers serialize through a checkout of the file, so concurrent merges from several
/// processes never lose each other's keys. Readers take no lock and must tolerate the file
/// being briefly absent while someone holds it.
#[derive(Debug, Clone)]
pub struct RunMetadataStore {
    path: PathBuf,
    lock: CheckoutLock,
    io_patience: Patience,
    merge_attempts: u32,
}

impl RunMetadataStore {
    pub fn new(path: &Path, lock: CheckoutLock, io_patience: Patience) -> Self {
        Self {
            path: path.to_path_buf(),
            lock,
            io_patience,
            merge_attempts: 3,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            &config.run_params_path(),
            CheckoutLock::from_config(config, CheckoutMode::ReadWrite),
            config.io_patience(),
        )
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create an empty store if there is none yet
    pub fn initialize(&self) -> Result<(), RunStoreError> {
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
        {
            Ok(mut file) => {
                file.write_all(b"{}")?;
                file.sync_all()?;
                spdlog::info!("Created run metadata store {}", self.path.display());
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Overlay `batch` onto the stored runs. Keys not in the batch are kept as they are.
    /// Returns the number of runs written.
    pub fn merge(&self, batch: &RunParameterBatch) -> Result<usize, RunStoreError> {
        if batch.is_empty() {
            return Ok(0);
        }
        // A store which is checked out elsewhere is not "missing", so only create it when
        // it is absent and nobody holds it
        if !self.path.exists() && !self.is_checked_out()? {
            self.initialize()?;
        }

        let mut attempt = 1;
        loop {
            let result = self
                .lock
                .with_checkout(&self.path, |token| -> Result<(), RunStoreError> {
                    let file = token.file();
                    let mut text = String::new();
                    file.read_to_string(&mut text)?;
                    let mut runs = parse_object(&text, &self.path)?;
                    for (run_id, parameters) in batch.iter() {
                        runs.insert(run_id.to_string(), Value::Object(parameters.clone()));
                    }
                    let bytes = serde_json::to_vec_pretty(&Value::Object(runs))?;
                    file.seek(SeekFrom::Start(0))?;
                    file.set_len(0)?;
                    file.write_all(&bytes)?;
                    Ok(())
                });
            match result {
                Ok(()) => break,
                Err(RunStoreError::Checkout(CheckoutError::Timeout { .. }))
                    if attempt < self.merge_attempts =>
                {
                    spdlog::warn!(
                        "Lost the race for {} (attempt {attempt} of {}); retrying",
                        self.path.display(),
                        self.merge_attempts
                    );
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
        spdlog::info!(
            "Merged runs {:?} into {}",
            batch.run_ids(),
            self.path.display()
        );
        Ok(batch.len())
    }

    /// Read the stored runs without taking the lock.
    ///
    /// A file which stays absent through the I/O patience is treated as an empty store.
    pub fn load(&self) -> Result<BTreeMap<u64, RunParameters>, RunStoreError> {
        let text = match self
            .io_patience
            .retry("Reading run metadata", || std::fs::read_to_string(&self.path))
        {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(e.into()),
        };
        let mut runs = BTreeMap::new();
        for (key, value) in parse_object(&text, &self.path)? {
            let run_id = match key.parse::<u64>() {
                Ok(id) => id,
                Err(_) => {
                    spdlog::warn!("Ignoring non-numeric run key {key:?} in {}", self.path.display());
                    continue;
                }
            };
            if let Value::Object(parameters) = value {
                runs.insert(run_id, parameters);
            }
        }
        Ok(runs)
    }

    fn is_checked_out(&self) -> Result<bool, RunStoreError> {
        let (parent, name) = match (self.path.parent(), self.path.file_name()) {
            (Some(parent), Some(name)) => (parent, name.to_string_lossy().to_string()),
            _ => return Ok(false),
        };
        let parent = if parent.as_os_str().is_empty() {
            Path::new(".")
        } else {
            parent
        };
        let prefix = format!("{name}.checkout-");
        for item in parent.read_dir()? {
            if item?.file_name().to_string_lossy().starts_with(&prefix) {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

fn parse_object(text: &str, path: &Path) -> Result<Map<String, Value>, RunStoreError> {
    if text.trim().is_empty() {
        return Ok(Map::new());
    }
    match serde_json::from_str::<Value>(text)? {
        Value::Object(map) => Ok(map),
        _ => Err(RunStoreError::NotAnObject(path.to_path_buf())),
    }
}
