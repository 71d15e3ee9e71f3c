//! Every piece of metadata the pipeline needs travels in file names. This module is the only
//! place those names are built or taken apart, so the rest of the crate deals in records.
//!
//! Conventions:
//!
//! ```text
//! watch folder frame     2024-01-01--00-00-00_TopA_PWA.fits
//! unlabeled image        2024-01-01--00-00-00_TopA.fits
//! labelled image         42_2024-01-01--00-00-00_TopA.fits
//! unmatched image        unmatched_2024-01-01--00-00-00_TopA.fits
//! ```
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::SystemTime;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime};

use super::clock::local_offset;
use super::error::FilenameError;

pub const FILENAME_DELIMITER: char = '_';
pub const UNMATCHED_LABEL: &str = "unmatched";

const TIMESTAMP_FORMAT: &[BorrowedFormatItem<'static>] =
    format_description!("[year]-[month]-[day]--[hour]-[minute]-[second]");

/// Wall clock acquisition time with one second resolution, as written into file names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(PrimitiveDateTime);

impl Timestamp {
    pub fn new(datetime: PrimitiveDateTime) -> Self {
        Self(datetime.replace_nanosecond(0).unwrap_or(datetime))
    }

    pub fn parse(s: &str) -> Result<Self, FilenameError> {
        PrimitiveDateTime::parse(s, TIMESTAMP_FORMAT)
            .map(Self::new)
            .map_err(|_| FilenameError::BadTimestamp(s.to_string()))
    }

    /// Convert a file system time (e.g. a modification time) to local wall clock time
    pub fn from_system_time(time: SystemTime) -> Self {
        let local = OffsetDateTime::from(time).to_offset(local_offset());
        Self::new(PrimitiveDateTime::new(local.date(), local.time()))
    }

    pub fn to_system_time(&self) -> SystemTime {
        SystemTime::from(self.0.assume_offset(local_offset()))
    }

    pub fn datetime(&self) -> PrimitiveDateTime {
        self.0
    }

    /// Signed number of seconds from `other` to `self`
    pub fn seconds_since(&self, other: &Timestamp) -> f64 {
        (self.0 - other.0).as_seconds_f64()
    }

    pub fn shifted(&self, seconds: f64) -> Self {
        match time::Duration::checked_seconds_f64(seconds) {
            Some(delta) => Self(self.0.saturating_add(delta)),
            None => *self,
        }
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04}-{:02}-{:02}--{:02}-{:02}-{:02}",
            self.0.year(),
            u8::from(self.0.month()),
            self.0.day(),
            self.0.hour(),
            self.0.minute(),
            self.0.second()
        )
    }
}

impl FromStr for Timestamp {
    type Err = FilenameError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for Timestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Timestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

fn check_field(field: &str) -> Result<(), FilenameError> {
    if field.is_empty() || field.contains(FILENAME_DELIMITER) {
        Err(FilenameError::BadField(field.to_string()))
    } else {
        Ok(())
    }
}

fn split_extension(name: &str) -> Result<(&str, &str), FilenameError> {
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => Ok((stem, ext)),
        _ => Err(FilenameError::MissingExtension(name.to_string())),
    }
}

/// The name a camera gives a single frame: `<timestamp>_<imageName>_<frameName>.<ext>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameName {
    pub timestamp: Timestamp,
    pub image_name: String,
    pub frame_name: String,
    pub extension: String,
}

impl FrameName {
    pub fn new(
        timestamp: Timestamp,
        image_name: &str,
        frame_name: &str,
        extension: &str,
    ) -> Result<Self, FilenameError> {
        check_field(image_name)?;
        check_field(frame_name)?;
        Ok(Self {
            timestamp,
            image_name: image_name.to_string(),
            frame_name: frame_name.to_string(),
            extension: extension.trim_start_matches('.').to_string(),
        })
    }

    pub fn parse(name: &str) -> Result<Self, FilenameError> {
        let (stem, ext) = split_extension(name)?;
        let fields: Vec<&str> = stem.split(FILENAME_DELIMITER).collect();
        if fields.len() != 3 {
            return Err(FilenameError::BadFieldCount(name.to_string()));
        }
        Self::new(Timestamp::parse(fields[0])?, fields[1], fields[2], ext)
    }

    /// The substring by which the matched-name policy recognizes this frame
    pub fn key(&self) -> String {
        frame_key(&self.image_name, &self.frame_name)
    }
}

impl fmt::Display for FrameName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{FILENAME_DELIMITER}{}.{}",
            self.timestamp,
            self.key(),
            self.extension
        )
    }
}

pub fn frame_key(image_name: &str, frame_name: &str) -> String {
    format!("{image_name}{FILENAME_DELIMITER}{frame_name}")
}

/// A frame sitting in the watch folder. Only directory metadata is used to build one; the
/// file itself is not opened until its image is complete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameFile {
    pub path: PathBuf,
    pub file_name: String,
    pub modified: SystemTime,
}

impl FrameFile {
    /// The parsed name, if the camera followed the naming convention
    pub fn frame_name(&self) -> Option<FrameName> {
        FrameName::parse(&self.file_name).ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunLabel {
    Unlabeled,
    Run(u64),
    Unmatched,
}

/// Name of a saved (multi-frame) image, before or after run labelling
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageFilename {
    pub label: RunLabel,
    pub timestamp: Timestamp,
    pub image_name: String,
    pub extension: String,
}

impl ImageFilename {
    pub fn unlabeled(
        timestamp: Timestamp,
        image_name: &str,
        extension: &str,
    ) -> Result<Self, FilenameError> {
        check_field(image_name)?;
        Ok(Self {
            label: RunLabel::Unlabeled,
            timestamp,
            image_name: image_name.to_string(),
            extension: extension.trim_start_matches('.').to_string(),
        })
    }

    pub fn parse(name: &str) -> Result<Self, FilenameError> {
        let (stem, ext) = split_extension(name)?;
        let fields: Vec<&str> = stem.split(FILENAME_DELIMITER).collect();
        let (label, timestamp, image_name) = match fields.as_slice() {
            [timestamp, image_name] => (RunLabel::Unlabeled, *timestamp, *image_name),
            [label, timestamp, image_name] => {
                let label = if *label == UNMATCHED_LABEL {
                    RunLabel::Unmatched
                } else {
                    RunLabel::Run(
                        label
                            .parse()
                            .map_err(|_| FilenameError::BadRunId(label.to_string()))?,
                    )
                };
                (label, *timestamp, *image_name)
            }
            _ => return Err(FilenameError::BadFieldCount(name.to_string())),
        };
        let mut parsed = Self::unlabeled(Timestamp::parse(timestamp)?, image_name, ext)?;
        parsed.label = label;
        Ok(parsed)
    }

    pub fn labelled(&self, run_id: u64) -> Self {
        Self {
            label: RunLabel::Run(run_id),
            ..self.clone()
        }
    }

    pub fn unmatched(&self) -> Self {
        Self {
            label: RunLabel::Unmatched,
            ..self.clone()
        }
    }
}

impl fmt::Display for ImageFilename {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.label {
            RunLabel::Unlabeled => (),
            RunLabel::Run(id) => write!(f, "{id}{FILENAME_DELIMITER}")?,
            RunLabel::Unmatched => write!(f, "{UNMATCHED_LABEL}{FILENAME_DELIMITER}")?,
        }
        write!(
            f,
            "{}{FILENAME_DELIMITER}{}.{}",
            self.timestamp, self.image_name, self.extension
        )
    }
}

impl FromStr for ImageFilename {
    type Err = FilenameError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
