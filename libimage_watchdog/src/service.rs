//! The experiment-control run service, seen from the watchdog.
//!
//! Only the two queries the pipeline needs are modelled. Any real client (HTTP, database)
//! implements `RunService`; `RetryingService` adds the bounded fixed-interval retry around it.
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::config::Config;
use super::error::ServiceError;
use super::filename::Timestamp;
use super::run_store::RunParameters;

/// One run of the experiment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: u64,
    pub runtime: Timestamp,
    #[serde(default)]
    pub parameters: RunParameters,
}

impl RunRecord {
    pub fn new(run_id: u64, runtime: Timestamp) -> Self {
        Self {
            run_id,
            runtime,
            parameters: RunParameters::new(),
        }
    }

    /// The parameters as they are kept in the run metadata store, including id and runtime
    pub fn stored_parameters(&self) -> RunParameters {
        let mut parameters = self.parameters.clone();
        parameters.insert(String::from("run_id"), Value::from(self.run_id));
        parameters.insert(
            String::from("runtime"),
            Value::from(self.runtime.to_string()),
        );
        parameters
    }
}

pub trait RunService {
    /// All runs whose runtime lies in `[start, end]`
    fn get_runs_by_time_range(
        &self,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<Vec<RunRecord>, ServiceError>;

    fn get_newest_run(&self) -> Result<Option<RunRecord>, ServiceError>;
}

impl<S: RunService + ?Sized> RunService for &S {
    fn get_runs_by_time_range(
        &self,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<Vec<RunRecord>, ServiceError> {
        (**self).get_runs_by_time_range(start, end)
    }

    fn get_newest_run(&self) -> Result<Option<RunRecord>, ServiceError> {
        (**self).get_newest_run()
    }
}

/// Wraps a service with a fixed number of attempts and a fixed delay between them.
///
/// Only transient errors are retried. Once the attempts run out the caller gets
/// `ServiceError::RetriesExhausted`, which the matcher treats as "try again next poll".
#[derive(Debug)]
pub struct RetryingService<S> {
    inner: S,
    attempts: u32,
    delay: Duration,
}

impl<S: RunService> RetryingService<S> {
    pub fn new(inner: S, attempts: u32, delay: Duration) -> Self {
        Self {
            inner,
            attempts: attempts.max(1),
            delay,
        }
    }

    pub fn from_config(inner: S, config: &Config) -> Self {
        Self::new(inner, config.service_attempts, config.service_retry_interval())
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    fn call<T, F>(&self, what: &str, mut op: F) -> Result<T, ServiceError>
    where
        F: FnMut(&S) -> Result<T, ServiceError>,
    {
        let mut attempt = 1;
        loop {
            match op(&self.inner) {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_transient() => return Err(e),
                Err(e) if attempt >= self.attempts => {
                    return Err(ServiceError::RetriesExhausted {
                        attempts: self.attempts,
                        last: e.to_string(),
                    })
                }
                Err(e) => {
                    spdlog::warn!(
                        "{what} failed (attempt {attempt} of {}): {e}",
                        self.attempts
                    );
                    std::thread::sleep(self.delay);
                    attempt += 1;
                }
            }
        }
    }
}

impl<S: RunService> RunService for RetryingService<S> {
    fn get_runs_by_time_range(
        &self,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<Vec<RunRecord>, ServiceError> {
        self.call("Run range query", |inner| {
            inner.get_runs_by_time_range(start, end)
        })
    }

    fn get_newest_run(&self) -> Result<Option<RunRecord>, ServiceError> {
        self.call("Newest run query", |inner| inner.get_newest_run())
    }
}

/// Reads runs from a JSON array of `RunRecord`s which the control system keeps up to date.
///
/// The file is read on every query, so it is always current. A file which is missing or
/// half-written is a transient failure.
#[derive(Debug, Clone)]
pub struct RunLogService {
    path: PathBuf,
}

impl RunLogService {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }

    fn read_runs(&self) -> Result<Vec<RunRecord>, ServiceError> {
        let text = std::fs::read_to_string(&self.path)?;
        Ok(serde_json::from_str::<Vec<RunRecord>>(&text)?)
    }
}

impl RunService for RunLogService {
    fn get_runs_by_time_range(
        &self,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<Vec<RunRecord>, ServiceError> {
        Ok(self
            .read_runs()?
            .into_iter()
            .filter(|r| r.runtime >= start && r.runtime <= end)
            .collect())
    }

    fn get_newest_run(&self) -> Result<Option<RunRecord>, ServiceError> {
        Ok(self.read_runs()?.into_iter().max_by_key(|r| r.runtime))
    }
}

/// An in-memory run service, for dry runs and tests.
///
/// `fail_next(n)` makes the next `n` queries fail with a transient error.
#[derive(Debug, Default)]
pub struct StaticRunService {
    runs: Mutex<Vec<RunRecord>>,
    failures: AtomicU32,
    calls: AtomicUsize,
}

impl StaticRunService {
    pub fn new(runs: Vec<RunRecord>) -> Self {
        Self {
            runs: Mutex::new(runs),
            ..Default::default()
        }
    }

    pub fn push(&self, run: RunRecord) {
        if let Ok(mut runs) = self.runs.lock() {
            runs.push(run);
        }
    }

    pub fn fail_next(&self, count: u32) {
        self.failures.store(count, Ordering::SeqCst);
    }

    /// Number of queries made so far, including failed ones
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn query(&self) -> Result<Vec<RunRecord>, ServiceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(ServiceError::Transient(String::from(
                "service unavailable",
            )));
        }
        self.runs
            .lock()
            .map(|runs| runs.clone())
            .map_err(|_| ServiceError::Transient(String::from("run list poisoned")))
    }
}

impl RunService for StaticRunService {
    fn get_runs_by_time_range(
        &self,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<Vec<RunRecord>, ServiceError> {
        Ok(self
            .query()?
            .into_iter()
            .filter(|r| r.runtime >= start && r.runtime <= end)
            .collect())
    }

    fn get_newest_run(&self) -> Result<Option<RunRecord>, ServiceError> {
        Ok(self.query()?.into_iter().max_by_key(|r| r.runtime))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ts(s: &str) -> Timestamp {
        Timestamp::parse(s).unwrap()
    }

    #[test]
    fn test_range_query() {
        let service = StaticRunService::new(vec![
            RunRecord::new(1, ts("2024-01-01--00-00-00")),
            RunRecord::new(2, ts("2024-01-01--00-01-00")),
        ]);
        let runs = service
            .get_runs_by_time_range(ts("2023-12-31--23-59-55"), ts("2024-01-01--00-00-05"))
            .unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].run_id, 1);
        assert_eq!(service.get_newest_run().unwrap().unwrap().run_id, 2);
    }

    #[test]
    fn test_retrying_service_recovers() {
        let service = StaticRunService::new(vec![RunRecord::new(1, ts("2024-01-01--00-00-00"))]);
        service.fail_next(2);
        let retrying = RetryingService::new(&service, 3, Duration::from_millis(1));
        assert!(retrying.get_newest_run().unwrap().is_some());
        assert_eq!(service.calls(), 3);
    }

    #[test]
    fn test_retrying_service_gives_up() {
        let service = StaticRunService::new(Vec::new());
        service.fail_next(10);
        let retrying = RetryingService::new(&service, 3, Duration::from_millis(1));
        match retrying.get_newest_run() {
            Err(ServiceError::RetriesExhausted { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("unexpected result {other:?}"),
        }
        assert_eq!(service.calls(), 3);
    }

    #[test]
    fn test_run_log_service() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runs.json");
        let service = RunLogService::new(&path);
        assert!(service.get_newest_run().unwrap_err().is_transient());

        std::fs::write(
            &path,
            r#"[{"run_id": 42, "runtime": "2024-01-01--00-00-02", "parameters": {"detuning": 1.5}},
                {"run_id": 43, "runtime": "2024-01-01--00-05-00"}]"#,
        )
        .unwrap();
        let runs = service
            .get_runs_by_time_range(ts("2023-12-31--23-59-55"), ts("2024-01-01--00-00-05"))
            .unwrap();
        assert_eq!(runs.len(), 1);
        let stored = runs[0].stored_parameters();
        assert_eq!(stored["run_id"], json!(42));
        assert_eq!(stored["runtime"], json!("2024-01-01--00-00-02"));
        assert_eq!(stored["detuning"], json!(1.5));
        assert_eq!(service.get_newest_run().unwrap().unwrap().run_id, 43);
    }
}
