//! One-time clean up of archives written before the current file naming convention.
//!
//! Older datasets used other datetime formats and sometimes left out the run id or even the
//! image name. `migrate_folder` tries each known format in turn and only accepts one that
//! parses every image in the folder; mixed formats are refused rather than guessed at.
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::time::Duration;

use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use time::PrimitiveDateTime;

use super::checkout::{CheckoutLock, CheckoutMode, ConflictPolicy};
use super::config::RUN_PARAMS_FILENAME;
use super::error::MigrationError;
use super::filename::{ImageFilename, RunLabel, Timestamp, FILENAME_DELIMITER};
use super::relocator::rename_no_clobber;
use super::retry::Patience;
use super::run_store::{RunMetadataStore, RunParameterBatch};
use super::scanner::list_candidates;
use super::service::{RunRecord, RunService};

/// A datetime format used by some generation of the archive
#[derive(Debug, Clone, Copy)]
pub struct LegacyFormat {
    pub name: &'static str,
    items: &'static [BorrowedFormatItem<'static>],
}

impl LegacyFormat {
    /// Number of filename fields the datetime spans
    fn width(&self) -> usize {
        self.name.matches(FILENAME_DELIMITER).count() + 1
    }
}

/// Known formats, in the order they are tried
pub const LEGACY_FORMATS: &[LegacyFormat] = &[
    LegacyFormat {
        name: "[year]-[month]-[day]--[hour]-[minute]-[second]",
        items: format_description!("[year]-[month]-[day]--[hour]-[minute]-[second]"),
    },
    LegacyFormat {
        name: "[month]-[day]-[year]_[hour]_[minute]_[second]",
        items: format_description!("[month]-[day]-[year]_[hour]_[minute]_[second]"),
    },
];

#[derive(Debug, Clone, PartialEq, Eq)]
struct LegacyName {
    original: String,
    run_id: Option<u64>,
    timestamp: Timestamp,
    image_name: String,
}

/// What a migration did
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationReport {
    pub format: &'static str,
    pub renamed: usize,
    pub looked_up: usize,
}

fn parse_legacy(
    name: &str,
    extension: &str,
    format: &LegacyFormat,
    default_image_name: Option<&str>,
) -> Option<LegacyName> {
    let stem = name.strip_suffix(extension)?.strip_suffix('.')?;
    let fields: Vec<&str> = stem.split(FILENAME_DELIMITER).collect();
    let width = format.width();
    let delimiter = FILENAME_DELIMITER.to_string();
    let (run_id, datetime, image_name) = if fields.len() == width + 2 {
        (
            Some(fields[0].parse::<u64>().ok()?),
            fields[1..=width].join(&delimiter),
            fields[width + 1].to_string(),
        )
    } else if fields.len() == width + 1 {
        (None, fields[..width].join(&delimiter), fields[width].to_string())
    } else if fields.len() == width {
        (None, fields.join(&delimiter), default_image_name?.to_string())
    } else {
        return None;
    };
    if image_name.is_empty() || image_name.contains(FILENAME_DELIMITER) {
        return None;
    }
    // Some legacy datetimes carry a stray space
    let datetime = datetime.replace(' ', "");
    let datetime = PrimitiveDateTime::parse(&datetime, format.items).ok()?;
    Some(LegacyName {
        original: name.to_string(),
        run_id,
        timestamp: Timestamp::new(datetime),
        image_name,
    })
}

fn single_run(
    timestamp: Timestamp,
    runs: &[RunRecord],
    tolerance_secs: f64,
) -> Result<u64, MigrationError> {
    let ids: BTreeSet<u64> = runs
        .iter()
        .filter(|r| r.runtime.seconds_since(&timestamp).abs() <= tolerance_secs)
        .map(|r| r.run_id)
        .collect();
    let run_ids: Vec<u64> = ids.into_iter().collect();
    if run_ids.len() == 1 {
        return Ok(run_ids[0]);
    }
    Err(MigrationError::RunLookup { timestamp, run_ids })
}

/// Rename every `extension` image in `folder` to `<runId>_<timestamp>_<image>.<extension>`.
///
/// Images without a run id get one from `service`: exactly one run must lie within
/// `tolerance_secs` of the image. Every name is resolved before the first rename, so a folder
/// is either migrated completely or left alone.
pub fn migrate_folder<S: RunService>(
    folder: &Path,
    extension: &str,
    default_image_name: Option<&str>,
    service: &S,
    tolerance_secs: f64,
) -> Result<MigrationReport, MigrationError> {
    let extension = extension.trim_start_matches('.');
    let no_filters: [&str; 0] = [];
    let names = list_candidates(folder, extension, &no_filters)?;
    if names.is_empty() {
        return Err(MigrationError::NoImages(folder.to_path_buf()));
    }

    let (format, legacy) = LEGACY_FORMATS
        .iter()
        .find_map(|format| {
            names
                .iter()
                .map(|n| parse_legacy(n, extension, format, default_image_name))
                .collect::<Option<Vec<LegacyName>>>()
                .map(|parsed| (format, parsed))
        })
        .ok_or_else(|| MigrationError::NoMatchingFormat(folder.to_path_buf()))?;
    spdlog::info!(
        "Migrating {} image(s) in {} using format {}",
        legacy.len(),
        folder.display(),
        format.name
    );

    let missing: Vec<Timestamp> = legacy
        .iter()
        .filter(|l| l.run_id.is_none())
        .map(|l| l.timestamp)
        .collect();
    let runs = match (missing.iter().min(), missing.iter().max()) {
        (Some(first), Some(last)) => service.get_runs_by_time_range(
            first.shifted(-tolerance_secs),
            last.shifted(tolerance_secs),
        )?,
        _ => Vec::new(),
    };

    let mut renames = Vec::with_capacity(legacy.len());
    let mut targets = BTreeSet::new();
    let mut looked_up = 0;
    for entry in legacy.iter() {
        let run_id = match entry.run_id {
            Some(id) => id,
            None => {
                looked_up += 1;
                single_run(entry.timestamp, &runs, tolerance_secs)?
            }
        };
        let target = ImageFilename {
            label: RunLabel::Run(run_id),
            timestamp: entry.timestamp,
            image_name: entry.image_name.clone(),
            extension: extension.to_string(),
        }
        .to_string();
        let collides = !targets.insert(target.clone())
            || (target != entry.original && names.binary_search(&target).is_ok());
        if collides {
            return Err(MigrationError::Collision(folder.join(&target)));
        }
        renames.push((entry.original.clone(), target));
    }

    let mut renamed = 0;
    for (original, target) in renames.iter().filter(|(o, t)| o != t) {
        rename_no_clobber(&folder.join(original), &folder.join(target))?;
        spdlog::debug!("Renamed {original} to {target}");
        renamed += 1;
    }
    spdlog::info!("Renamed {renamed} image(s), looked up {looked_up} run id(s)");
    Ok(MigrationReport {
        format: format.name,
        renamed,
        looked_up,
    })
}

/// Write `run_params_dump.json` for a labelled folder which never had one, asking `service`
/// for the runs spanned by its images. Returns the number of runs stored.
pub fn rebuild_run_metadata<S: RunService>(
    folder: &Path,
    extension: &str,
    service: &S,
    tolerance_secs: f64,
) -> Result<usize, MigrationError> {
    let no_filters: [&str; 0] = [];
    let mut ids: BTreeMap<u64, Timestamp> = BTreeMap::new();
    for name in list_candidates(folder, extension, &no_filters)? {
        if let Ok(ImageFilename {
            label: RunLabel::Run(id),
            timestamp,
            ..
        }) = ImageFilename::parse(&name)
        {
            ids.insert(id, timestamp);
        }
    }
    let (first, last) = match (ids.values().min(), ids.values().max()) {
        (Some(first), Some(last)) => (*first, *last),
        _ => return Err(MigrationError::NoImages(folder.to_path_buf())),
    };

    let mut batch = RunParameterBatch::new();
    for run in service.get_runs_by_time_range(
        first.shifted(-tolerance_secs),
        last.shifted(tolerance_secs),
    )? {
        if ids.contains_key(&run.run_id) {
            batch.insert(run.run_id, run.stored_parameters());
        }
    }
    if batch.len() < ids.len() {
        spdlog::warn!(
            "The run service returned {} of the {} runs in {}",
            batch.len(),
            ids.len(),
            folder.display()
        );
    }

    let lock = CheckoutLock::new(
        CheckoutMode::ReadWrite,
        3,
        Duration::from_millis(100),
        ConflictPolicy::Fail,
    );
    let store = RunMetadataStore::new(
        &folder.join(RUN_PARAMS_FILENAME),
        lock,
        Patience::default(),
    );
    store.initialize()?;
    Ok(store.merge(&batch)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::StaticRunService;

    fn ts(s: &str) -> Timestamp {
        Timestamp::parse(s).unwrap()
    }

    fn touch(folder: &Path, names: &[&str]) {
        for name in names {
            std::fs::write(folder.join(name), name.as_bytes()).unwrap();
        }
    }

    fn listing(folder: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(folder)
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_parse_legacy() {
        let current = &LEGACY_FORMATS[0];
        let old = &LEGACY_FORMATS[1];
        let parsed = parse_legacy("7_2024-01-01--00-00-00_TopA.fits", "fits", current, None).unwrap();
        assert_eq!(parsed.run_id, Some(7));
        assert_eq!(parsed.image_name, "TopA");

        let parsed = parse_legacy("03-15-2023_10_20_30 _Side.fits", "fits", old, None).unwrap();
        assert_eq!(parsed.run_id, None);
        assert_eq!(parsed.timestamp, ts("2023-03-15--10-20-30"));

        let parsed = parse_legacy("03-15-2023_10_20_30.fits", "fits", old, Some("Side")).unwrap();
        assert_eq!(parsed.image_name, "Side");
        assert!(parse_legacy("03-15-2023_10_20_30.fits", "fits", old, None).is_none());
        assert!(parse_legacy("03-15-2023_10_20_30_Side.fits", "fits", current, None).is_none());
    }

    #[test]
    fn test_migrate_old_format() {
        let dir = tempfile::tempdir().unwrap();
        touch(
            dir.path(),
            &[
                "03-15-2023_10_20_30_Side.fits",
                "03-15-2023_10_20_31.fits",
                "12_03-15-2023_10_20_40_TopA.fits",
            ],
        );
        let service = StaticRunService::new(vec![
            RunRecord::new(5, ts("2023-03-15--10-20-31")),
            RunRecord::new(12, ts("2023-03-15--10-20-40")),
        ]);
        let report = migrate_folder(dir.path(), ".fits", Some("Side"), &service, 5.0).unwrap();
        assert_eq!(report.format, LEGACY_FORMATS[1].name);
        assert_eq!(report.renamed, 3);
        assert_eq!(report.looked_up, 2);
        assert_eq!(
            listing(dir.path()),
            vec![
                "12_2023-03-15--10-20-40_TopA.fits",
                "5_2023-03-15--10-20-30_Side.fits",
                "5_2023-03-15--10-20-31_Side.fits",
            ]
        );

        // Already canonical now: nothing to do, and the service is not asked
        let calls = service.calls();
        let report = migrate_folder(dir.path(), "fits", None, &service, 5.0).unwrap();
        assert_eq!(report.renamed, 0);
        assert_eq!(service.calls(), calls);
    }

    #[test]
    fn test_mixed_formats_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        let names = [
            "03-15-2023_10_20_30_Side.fits",
            "1_2023-03-15--10-20-30_Side.fits",
        ];
        touch(dir.path(), &names);
        let result = migrate_folder(dir.path(), "fits", None, &StaticRunService::default(), 5.0);
        assert!(matches!(result, Err(MigrationError::NoMatchingFormat(_))));
        assert_eq!(listing(dir.path()).len(), 2);
    }

    #[test]
    fn test_lookup_failure_renames_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let names = [
            "2023-03-15--10-20-30_Side.fits",
            "2023-03-15--11-00-00_Side.fits",
        ];
        touch(dir.path(), &names);
        let service = StaticRunService::new(vec![RunRecord::new(5, ts("2023-03-15--10-20-31"))]);
        match migrate_folder(dir.path(), "fits", None, &service, 5.0) {
            Err(MigrationError::RunLookup { timestamp, run_ids }) => {
                assert_eq!(timestamp, ts("2023-03-15--11-00-00"));
                assert!(run_ids.is_empty());
            }
            other => panic!("unexpected result {other:?}"),
        }
        assert_eq!(listing(dir.path()), names.to_vec());
    }

    #[test]
    fn test_rebuild_run_metadata() {
        let dir = tempfile::tempdir().unwrap();
        touch(
            dir.path(),
            &[
                "42_2024-01-01--00-00-00_TopA.fits",
                "43_2024-01-01--00-01-00_TopA.fits",
            ],
        );
        let service = StaticRunService::new(vec![
            RunRecord::new(42, ts("2024-01-01--00-00-00")),
            RunRecord::new(43, ts("2024-01-01--00-01-00")),
            RunRecord::new(44, ts("2024-01-01--00-00-30")),
        ]);
        assert_eq!(
            rebuild_run_metadata(dir.path(), "fits", &service, 5.0).unwrap(),
            2
        );
        let dump: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(dir.path().join(RUN_PARAMS_FILENAME)).unwrap(),
        )
        .unwrap();
        let keys: Vec<&String> = dump.as_object().unwrap().keys().collect();
        assert_eq!(keys, vec!["42", "43"]);
        assert_eq!(dump["42"]["runtime"], "2024-01-01--00-00-00");
    }
}
