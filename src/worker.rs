use crate::allow_list::AllowList;
use crate::capture::{CaptureBackend, CaptureError, FrameSource};
use crate::detect::{DetectError, Detector};
use crate::lifecycle::Lifecycle;
use crate::relay::RelayPublisher;
use crate::source::SourceId;
use crate::store::CountStore;
use crossbeam_channel::Sender;
use image::RgbImage;
use std::collections::BTreeSet;
use std::io;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Outcome of opening a worker's camera, reported once at startup.
pub type OpenReport = (SourceId, Result<(), CaptureError>);

/// Collapses per-box labels to distinct classes and applies the allow list.
pub fn eligible_classes(labels: &[String], allow_list: &AllowList) -> BTreeSet<String> {
    labels
        .iter()
        .filter(|label| allow_list.allows(label))
        .cloned()
        .collect()
}

/// Capture → detect → count → publish loop for one camera.
pub struct CameraWorker {
    source: SourceId,
    detector: Arc<dyn Detector>,
    allow_list: Arc<AllowList>,
    store: Arc<CountStore>,
    relay: RelayPublisher<RgbImage>,
    lifecycle: Lifecycle,
    read_retry: Duration,
}

impl CameraWorker {
    pub fn new(
        source: SourceId,
        detector: Arc<dyn Detector>,
        allow_list: Arc<AllowList>,
        store: Arc<CountStore>,
        relay: RelayPublisher<RgbImage>,
        lifecycle: Lifecycle,
    ) -> Self {
        Self {
            source,
            detector,
            allow_list,
            store,
            relay,
            lifecycle,
            read_retry: Duration::from_millis(10),
        }
    }

    pub fn with_read_retry(mut self, read_retry: Duration) -> Self {
        self.read_retry = read_retry;
        self
    }

    /// Runs one frame through detection, counting and publishing. Returns
    /// the classes counted for the first time.
    pub fn process(&self, frame: &RgbImage) -> Result<Vec<String>, DetectError> {
        let detection = self.detector.detect(frame)?;
        let classes = eligible_classes(&detection.labels, &self.allow_list);
        let counted = self.store.record_first_seen(self.source, &classes);
        self.relay.publish(detection.annotated);
        Ok(counted)
    }

    /// Reads frames until the lifecycle stops. Read failures are retried.
    pub fn run<S: FrameSource>(&self, stream: &mut S) {
        info!(source = %self.source, "camera worker started");
        let mut frames = 0u64;
        while self.lifecycle.is_running() {
            let frame = match stream.read() {
                Ok(frame) => frame,
                Err(e) => {
                    debug!(source = %self.source, "skipping frame: {e}");
                    self.lifecycle.sleep(self.read_retry);
                    continue;
                }
            };
            frames += 1;
            match self.process(&frame) {
                Ok(counted) => {
                    trace!(source = %self.source, frames, new = counted.len(), "frame processed")
                }
                Err(e) => warn!(source = %self.source, "detection failed: {e}"),
            }
        }
        info!(source = %self.source, frames, "camera worker stopped");
    }

    /// Opens the camera on a new thread and runs the worker there. The open
    /// result is sent on `opened` before the loop starts; a worker whose
    /// camera fails to open exits immediately.
    pub fn spawn<B>(self, backend: Arc<B>, opened: Sender<OpenReport>) -> io::Result<JoinHandle<()>>
    where
        B: CaptureBackend + 'static,
    {
        std::thread::Builder::new()
            .name(format!("camera-{}", self.source.index()))
            .spawn(move || match backend.open(self.source) {
                Ok(mut stream) => {
                    let _ = opened.send((self.source, Ok(())));
                    drop(opened);
                    self.run(&mut stream);
                    stream.close();
                }
                Err(e) => {
                    let _ = opened.send((self.source, Err(e)));
                }
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::Detection;
    use crate::relay::relay;

    struct Labels(Vec<&'static str>);

    impl Detector for Labels {
        fn detect(&self, frame: &RgbImage) -> Result<Detection, DetectError> {
            Ok(Detection {
                annotated: frame.clone(),
                labels: self.0.iter().map(|l| l.to_string()).collect(),
            })
        }
    }

    struct Failing;

    impl Detector for Failing {
        fn detect(&self, _frame: &RgbImage) -> Result<Detection, DetectError> {
            Err(DetectError::Inference("boom".to_string()))
        }
    }

    fn labels(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn duplicates_collapse_before_counting() {
        let classes = eligible_classes(&labels(&["dog", "dog", "cat"]), &AllowList::all());
        assert_eq!(classes.len(), 2);
    }

    #[test]
    fn allow_list_drops_other_classes() {
        let classes = eligible_classes(&labels(&["person", "car"]), &AllowList::only(["person"]));
        assert_eq!(classes.into_iter().collect::<Vec<_>>(), ["person"]);
    }

    #[test]
    fn process_counts_and_publishes() {
        let store = Arc::new(CountStore::new());
        let (tx, rx) = relay();
        let worker = CameraWorker::new(
            SourceId(3),
            Arc::new(Labels(vec!["dog", "dog", "cat"])),
            Arc::new(AllowList::all()),
            store.clone(),
            tx,
            Lifecycle::new(),
        );
        let frame = RgbImage::new(4, 4);
        assert_eq!(worker.process(&frame).unwrap(), ["cat", "dog"]);
        assert!(worker.process(&frame).unwrap().is_empty());
        assert_eq!(store.count(SourceId(3), "dog"), 1);
        assert_eq!(rx.try_consume().map(|f| f.dimensions()), Some((4, 4)));
    }

    #[test]
    fn detector_error_leaves_state_untouched() {
        let store = Arc::new(CountStore::new());
        let (tx, rx) = relay();
        let worker = CameraWorker::new(
            SourceId(0),
            Arc::new(Failing),
            Arc::new(AllowList::all()),
            store.clone(),
            tx,
            Lifecycle::new(),
        );
        assert!(worker.process(&RgbImage::new(2, 2)).is_err());
        assert!(store.snapshot().is_empty());
        assert!(rx.try_consume().is_none());
    }
}
