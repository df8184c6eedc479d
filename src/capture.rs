use crate::source::SourceId;
use image::RgbImage;
use nokhwa::{
    pixel_format::RgbFormat,
    utils::{CameraFormat, CameraIndex, FrameFormat, RequestedFormat, RequestedFormatType},
    Camera,
};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("failed to open {source_id}: {reason}")]
    Open { source_id: SourceId, reason: String },
    #[error("failed to read frame: {0}")]
    Read(String),
}

/// Opens capture streams by source.
///
/// `open` runs on the worker thread that will own the stream, so the stream
/// itself does not have to be `Send`.
pub trait CaptureBackend: Send + Sync {
    type Stream: FrameSource;

    fn open(&self, source: SourceId) -> Result<Self::Stream, CaptureError>;
}

/// A single open capture stream.
pub trait FrameSource {
    fn read(&mut self) -> Result<RgbImage, CaptureError>;

    /// Releases the device. Called once when the worker exits.
    fn close(&mut self) {}
}

const PREFERRED_RESOLUTIONS: [(u32, u32); 2] = [(1280, 720), (640, 480)];
const PREFERRED_FORMATS: [FrameFormat; 3] =
    [FrameFormat::RAWRGB, FrameFormat::MJPEG, FrameFormat::YUYV];
const PREFERRED_FPS: u32 = 30;

/// Local cameras through nokhwa's native backend.
#[derive(Clone, Debug, Default)]
pub struct NokhwaBackend;

impl NokhwaBackend {
    fn open_camera(index: u32) -> Option<Camera> {
        for (w, h) in PREFERRED_RESOLUTIONS {
            for fmt in PREFERRED_FORMATS {
                let req = RequestedFormat::new::<RgbFormat>(RequestedFormatType::Closest(
                    CameraFormat::new_from(w, h, fmt, PREFERRED_FPS),
                ));
                if let Ok(cam) = Camera::new(CameraIndex::Index(index), req) {
                    return Some(cam);
                }
            }
        }
        let fallback = RequestedFormat::new::<RgbFormat>(RequestedFormatType::None);
        Camera::new(CameraIndex::Index(index), fallback).ok()
    }
}

impl CaptureBackend for NokhwaBackend {
    type Stream = NokhwaStream;

    fn open(&self, source: SourceId) -> Result<NokhwaStream, CaptureError> {
        let mut cam = Self::open_camera(source.index()).ok_or_else(|| CaptureError::Open {
            source_id: source,
            reason: "no usable camera format".to_string(),
        })?;
        cam.open_stream().map_err(|e| CaptureError::Open {
            source_id: source,
            reason: e.to_string(),
        })?;
        debug!(source = %source, format = ?cam.camera_format(), "camera stream opened");
        Ok(NokhwaStream {
            source,
            cam,
            open: true,
        })
    }
}

pub struct NokhwaStream {
    source: SourceId,
    cam: Camera,
    open: bool,
}

impl FrameSource for NokhwaStream {
    fn read(&mut self) -> Result<RgbImage, CaptureError> {
        let frame = self
            .cam
            .frame()
            .map_err(|e| CaptureError::Read(e.to_string()))?;
        frame
            .decode_image::<RgbFormat>()
            .map_err(|e| CaptureError::Read(format!("decode: {e}")))
    }

    fn close(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;
        if let Err(e) = self.cam.stop_stream() {
            warn!(source = %self.source, "failed to stop camera stream: {e}");
        } else {
            debug!(source = %self.source, "camera stream closed");
        }
    }
}

impl Drop for NokhwaStream {
    fn drop(&mut self) {
        self.close();
    }
}
