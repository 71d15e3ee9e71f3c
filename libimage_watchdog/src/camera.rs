use std::path::{Path, PathBuf};

use super::error::CameraError;
use super::filename::FrameName;
use super::relocator::Relocator;

/// A camera driver. Frames are opaque byte buffers; decoding them is the driver's business.
pub trait Camera {
    fn get_frame(&mut self) -> Result<Vec<u8>, CameraError>;
    fn start_video(&mut self) -> Result<(), CameraError>;
    fn stop_video(&mut self) -> Result<(), CameraError>;
    /// The `recency`-th most recent frame of a running video stream, if the stream has one
    fn get_video_frame(&mut self, recency: usize) -> Result<Option<Vec<u8>>, CameraError>;
}

/// Grab one frame and drop it into `folder` under `name`, staged so the aggregator never sees
/// a partially written frame.
pub fn save_frame<C: Camera + ?Sized>(
    camera: &mut C,
    relocator: &Relocator,
    folder: &Path,
    name: &FrameName,
) -> Result<PathBuf, CameraError> {
    let bytes = camera.get_frame()?;
    if bytes.is_empty() {
        return Err(CameraError::NoFrame);
    }
    let path = folder.join(name.to_string());
    relocator.stage_bytes(&bytes, &path)?;
    spdlog::debug!("Saved frame {}", path.display());
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filename::Timestamp;
    use std::collections::VecDeque;

    #[derive(Default)]
    struct FakeCamera {
        frames: VecDeque<Vec<u8>>,
        streaming: bool,
    }

    impl Camera for FakeCamera {
        fn get_frame(&mut self) -> Result<Vec<u8>, CameraError> {
            self.frames.pop_front().ok_or(CameraError::NoFrame)
        }

        fn start_video(&mut self) -> Result<(), CameraError> {
            self.streaming = true;
            Ok(())
        }

        fn stop_video(&mut self) -> Result<(), CameraError> {
            self.streaming = false;
            Ok(())
        }

        fn get_video_frame(&mut self, recency: usize) -> Result<Option<Vec<u8>>, CameraError> {
            if !self.streaming {
                return Err(CameraError::Hardware(String::from("not streaming")));
            }
            Ok(self.frames.iter().rev().nth(recency).cloned())
        }
    }

    #[test]
    fn test_save_frame() {
        let dir = tempfile::tempdir().unwrap();
        let mut camera = FakeCamera::default();
        camera.frames.push_back(vec![1, 2, 3]);
        let name = FrameName::new(
            Timestamp::parse("2024-01-01--00-00-00").unwrap(),
            "TopA",
            "PWA",
            "fits",
        )
        .unwrap();

        let path = save_frame(&mut camera, &Relocator::default(), dir.path(), &name).unwrap();
        assert_eq!(path, dir.path().join("2024-01-01--00-00-00_TopA_PWA.fits"));
        assert_eq!(std::fs::read(&path).unwrap(), vec![1, 2, 3]);
        assert!(matches!(
            save_frame(&mut camera, &Relocator::default(), dir.path(), &name),
            Err(CameraError::NoFrame)
        ));
    }

    #[test]
    fn test_video_frames() {
        let mut camera = FakeCamera::default();
        camera.frames.extend([vec![1], vec![2]]);
        assert!(camera.get_video_frame(0).is_err());
        camera.start_video().unwrap();
        assert_eq!(camera.get_video_frame(0).unwrap(), Some(vec![2]));
        assert_eq!(camera.get_video_frame(5).unwrap(), None);
        camera.stop_video().unwrap();
    }
}
