use std::time::SystemTime;

use bit_set::BitSet;
use ndarray::Array2;

use super::config::ImageSpec;
use super::error::{AggregatorError, FitsError};
use super::filename::{frame_key, Timestamp};
use super::fits::{encode_image, FitsHeader, HeaderValue};

/// LogicalImage is one named image built from one or more camera frames.
///
/// There is one slot per configured frame name, in the configured order. The image is
/// complete once every slot has been filled.
#[derive(Debug, Clone)]
pub struct LogicalImage {
    name: String,
    frame_names: Vec<String>,
    frames: Vec<Option<Vec<u8>>>,
    filled: BitSet,
    completed_at: Option<SystemTime>,
}

impl LogicalImage {
    pub fn new(spec: &ImageSpec) -> Self {
        Self {
            name: spec.name.clone(),
            frame_names: spec.frames.clone(),
            frames: vec![None; spec.frames.len()],
            filled: BitSet::with_capacity(spec.frames.len()),
            completed_at: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn frame_names(&self) -> &[String] {
        &self.frame_names
    }

    pub fn slot_count(&self) -> usize {
        self.frames.len()
    }

    /// Find the slot a watch folder file belongs to by its `image_frame` substring.
    ///
    /// If several frame names match (one is a substring of another) the longest wins.
    pub fn slot_of(&self, file_name: &str) -> Option<usize> {
        self.frame_names
            .iter()
            .enumerate()
            .map(|(slot, frame)| (slot, frame_key(&self.name, frame)))
            .filter(|(_, key)| file_name.contains(key.as_str()))
            .max_by_key(|(_, key)| key.len())
            .map(|(slot, _)| slot)
    }

    pub fn is_filled(&self, slot: usize) -> bool {
        self.filled.contains(slot)
    }

    /// Put a frame into a slot. Returns false if the slot was already filled, in which case
    /// the original frame is kept.
    pub fn fill(
        &mut self,
        slot: usize,
        bytes: Vec<u8>,
        modified: SystemTime,
    ) -> Result<bool, AggregatorError> {
        if slot >= self.frames.len() {
            return Err(AggregatorError::BadSlot {
                image: self.name.clone(),
                slot,
                slots: self.frames.len(),
            });
        }
        if !self.filled.insert(slot) {
            return Ok(false);
        }
        self.frames[slot] = Some(bytes);
        self.completed_at = match self.completed_at {
            Some(latest) if latest >= modified => Some(latest),
            _ => Some(modified),
        };
        Ok(true)
    }

    /// Put a frame into the first empty slot, for cameras which cannot label their frames.
    /// Returns the slot used, or None if the image is already complete.
    pub fn fill_next(&mut self, bytes: Vec<u8>, modified: SystemTime) -> Option<usize> {
        let slot = (0..self.frames.len()).find(|slot| !self.filled.contains(*slot))?;
        match self.fill(slot, bytes, modified) {
            Ok(true) => Some(slot),
            _ => None,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.filled.len() == self.frames.len()
    }

    /// Modification time of the most recent contributing frame
    pub fn completed_at(&self) -> Option<SystemTime> {
        self.completed_at
    }

    /// Stack the frames into a (frames x bytes) array, zero padding short frames.
    /// Returns None until the image is complete.
    pub fn to_array(&self) -> Option<Array2<u8>> {
        if !self.is_complete() {
            return None;
        }
        let width = self
            .frames
            .iter()
            .map(|f| f.as_ref().map_or(0, |f| f.len()))
            .max()
            .unwrap_or(0);
        let mut array = Array2::<u8>::zeros((self.frames.len(), width));
        for (mut row, frame) in array.rows_mut().into_iter().zip(self.frames.iter()) {
            if let Some(frame) = frame {
                for (pixel, byte) in row.iter_mut().zip(frame.iter()) {
                    *pixel = *byte;
                }
            }
        }
        Some(array)
    }

    /// Encode the stacked frames as FITS, tagged with the image name, frame names and
    /// acquisition timestamp
    pub fn to_fits(&self, timestamp: Timestamp) -> Result<Option<Vec<u8>>, FitsError> {
        let array = match self.to_array() {
            Some(array) => array,
            None => return Ok(None),
        };
        let mut header = FitsHeader::new();
        header.push("IMAGE", HeaderValue::Text(self.name.clone()), None)?;
        header.push(
            "DATE-OBS",
            HeaderValue::Text(timestamp.to_string()),
            Some("time of the last frame"),
        )?;
        for (idx, frame) in self.frame_names.iter().enumerate() {
            header.push(
                &format!("FRAME{idx}"),
                HeaderValue::Text(frame.clone()),
                None,
            )?;
        }
        for (idx, frame) in self.frames.iter().enumerate() {
            let length = frame.as_ref().map_or(0, |f| f.len());
            header.push(
                &format!("FLEN{idx}"),
                HeaderValue::Integer(length as i64),
                Some("frame length before padding"),
            )?;
        }
        Ok(Some(encode_image(array.view(), &header)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fits::decode_image;
    use std::time::Duration;

    fn spec() -> ImageSpec {
        ImageSpec::new("TopA", &["PWA", "PWOA", "DF"])
    }

    #[test]
    fn test_slot_of() {
        let image = LogicalImage::new(&spec());
        assert_eq!(image.slot_of("2024-01-01--00-00-00_TopA_PWA.fits"), Some(0));
        assert_eq!(image.slot_of("2024-01-01--00-00-00_TopA_PWOA.fits"), Some(1));
        assert_eq!(image.slot_of("2024-01-01--00-00-00_TopA_DF.fits"), Some(2));
        assert_eq!(image.slot_of("2024-01-01--00-00-00_TopB_PWA.fits"), None);

        let overlapping = LogicalImage::new(&ImageSpec::new("Side", &["A", "AB"]));
        assert_eq!(overlapping.slot_of("x_Side_AB.fits"), Some(1));
        assert_eq!(overlapping.slot_of("x_Side_A.fits"), Some(0));
    }

    #[test]
    fn test_fill_and_complete() {
        let t0 = SystemTime::UNIX_EPOCH + Duration::from_secs(100);
        let mut image = LogicalImage::new(&spec());
        assert!(image.fill(1, vec![1, 2], t0 + Duration::from_secs(5)).unwrap());
        assert!(!image.fill(1, vec![9], t0).unwrap());
        assert!(!image.is_complete());
        assert!(image.to_array().is_none());
        assert_eq!(image.fill_next(vec![3], t0), Some(0));
        assert_eq!(image.fill_next(vec![4, 5, 6], t0), Some(2));
        assert_eq!(image.fill_next(vec![7], t0), None);
        assert!(image.is_complete());
        assert_eq!(image.completed_at(), Some(t0 + Duration::from_secs(5)));
        assert!(image.fill(3, vec![], t0).is_err());

        let array = image.to_array().unwrap();
        assert_eq!(array.dim(), (3, 3));
        assert_eq!(array.row(0).to_vec(), vec![3, 0, 0]);
        assert_eq!(array.row(1).to_vec(), vec![1, 2, 0]);
        assert_eq!(array.row(2).to_vec(), vec![4, 5, 6]);
    }

    #[test]
    fn test_to_fits() {
        let t0 = SystemTime::UNIX_EPOCH;
        let mut image = LogicalImage::new(&ImageSpec::new("TopA", &["PWA", "PWOA"]));
        let timestamp = Timestamp::parse("2024-01-01--00-00-00").unwrap();
        assert!(image.to_fits(timestamp).unwrap().is_none());
        image.fill(0, vec![10, 11], t0).unwrap();
        image.fill(1, vec![12, 13], t0).unwrap();
        let bytes = image.to_fits(timestamp).unwrap().unwrap();
        let (header, data) = decode_image(&bytes).unwrap();
        assert_eq!(header.get_text("IMAGE"), Some("TopA"));
        assert_eq!(header.get_text("FRAME1"), Some("PWOA"));
        assert_eq!(header.get_text("DATE-OBS"), Some("2024-01-01--00-00-00"));
        assert_eq!(data.row(1).to_vec(), vec![12, 13]);
    }
}
