use image::RgbImage;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DetectError {
    #[error("model error: {0}")]
    Model(String),
    #[error("model download failed: {0}")]
    Download(String),
    #[error("inference failed: {0}")]
    Inference(String),
}

impl From<candle_core::Error> for DetectError {
    fn from(e: candle_core::Error) -> Self {
        DetectError::Inference(e.to_string())
    }
}

/// Result of running the detector on one frame.
#[derive(Clone, Debug)]
pub struct Detection {
    /// The frame with detections drawn on it.
    pub annotated: RgbImage,
    /// One class name per detected box, duplicates included.
    pub labels: Vec<String>,
}

/// Object detector shared by every camera worker.
pub trait Detector: Send + Sync {
    fn detect(&self, frame: &RgbImage) -> Result<Detection, DetectError>;
}
