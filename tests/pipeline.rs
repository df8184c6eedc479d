use crossbeam_channel::unbounded;
use image::RgbImage;
use multicam_tally::allow_list::AllowList;
use multicam_tally::capture::{CaptureBackend, CaptureError, FrameSource};
use multicam_tally::detect::{DetectError, Detection, Detector};
use multicam_tally::display::{RenderBackend, RenderError};
use multicam_tally::ipc::ControlMessage;
use multicam_tally::lifecycle::Lifecycle;
use multicam_tally::pipeline::{Pipeline, PipelineError, PipelineSettings};
use multicam_tally::summary::SummarySurface;
use multicam_tally::{exit_code, SourceId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Cameras that exist are listed in `available`; each frame's width encodes
/// its camera index so the detector knows which scene it is looking at.
struct FakeCameras {
    available: Vec<u32>,
    closed: Arc<Mutex<Vec<u32>>>,
}

struct FakeStream {
    index: u32,
    reads: u32,
    closed: Arc<Mutex<Vec<u32>>>,
}

impl CaptureBackend for FakeCameras {
    type Stream = FakeStream;

    fn open(&self, source: SourceId) -> Result<FakeStream, CaptureError> {
        if !self.available.contains(&source.index()) {
            return Err(CaptureError::Open {
                source_id: source,
                reason: "no such device".to_string(),
            });
        }
        Ok(FakeStream {
            index: source.index(),
            reads: 0,
            closed: self.closed.clone(),
        })
    }
}

impl FrameSource for FakeStream {
    fn read(&mut self) -> Result<RgbImage, CaptureError> {
        std::thread::sleep(Duration::from_millis(1));
        self.reads += 1;
        // every third read drops out, like a flaky USB camera
        if self.reads % 3 == 0 {
            return Err(CaptureError::Read("timeout".to_string()));
        }
        Ok(RgbImage::new(self.index + 1, 1))
    }

    fn close(&mut self) {
        self.closed.lock().unwrap().push(self.index);
    }
}

struct SceneDetector {
    scenes: HashMap<u32, Vec<&'static str>>,
}

impl Detector for SceneDetector {
    fn detect(&self, frame: &RgbImage) -> Result<Detection, DetectError> {
        let labels = self
            .scenes
            .get(&(frame.width() - 1))
            .map(|labels| labels.iter().map(|l| l.to_string()).collect())
            .unwrap_or_default();
        Ok(Detection {
            annotated: frame.clone(),
            labels,
        })
    }
}

/// Render backend that remembers what it showed. With `quit_after` set, the
/// quit key is reported as pressed on that poll.
#[derive(Clone, Default)]
struct Screen {
    shown: Arc<Mutex<Vec<SourceId>>>,
    closed: Arc<AtomicBool>,
    quit_after: Option<usize>,
    polls: usize,
}

impl RenderBackend for Screen {
    fn show(&mut self, source: SourceId, _frame: &RgbImage) -> Result<(), RenderError> {
        self.shown.lock().unwrap().push(source);
        Ok(())
    }

    fn poll_quit(&mut self, wait: Duration) -> bool {
        std::thread::sleep(wait);
        self.polls += 1;
        self.quit_after.is_some_and(|n| self.polls >= n)
    }

    fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct Silent;

impl SummarySurface for Silent {
    fn render(&mut self, _text: &str) {}
}

fn settings(cameras: &[u32]) -> PipelineSettings {
    PipelineSettings {
        sources: cameras.iter().copied().map(SourceId).collect(),
        refresh: Duration::from_millis(10),
        display_tick: Duration::from_millis(1),
        read_retry: Duration::from_millis(1),
    }
}

fn detector() -> Arc<dyn Detector> {
    let mut scenes = HashMap::new();
    scenes.insert(0, vec!["dog", "dog", "cat"]);
    scenes.insert(2, vec!["cat", "person", "car", "person"]);
    Arc::new(SceneDetector { scenes })
}

fn counts(report: &[(String, u32)]) -> Vec<(&str, u32)> {
    report.iter().map(|(c, n)| (c.as_str(), *n)).collect()
}

#[test]
fn runs_with_the_cameras_that_open() {
    let closed = Arc::new(Mutex::new(Vec::new()));
    let cameras = FakeCameras {
        available: vec![2],
        closed: closed.clone(),
    };
    let lifecycle = Lifecycle::new();
    let pipeline = Pipeline::new(cameras, detector(), AllowList::all(), lifecycle.clone());
    let screen = Screen::default();
    let (tx, rx) = unbounded();
    let quitter = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(200));
        tx.send(ControlMessage::Quit).unwrap();
    });

    let report = pipeline
        .run(&settings(&[0, 2]), screen.clone(), Silent, &rx)
        .unwrap();
    quitter.join().unwrap();

    assert!(lifecycle.is_stopped());
    assert_eq!(report.active, vec![SourceId(2)]);
    assert_eq!(report.final_counts.keys().copied().collect::<Vec<_>>(), vec![SourceId(2)]);
    assert_eq!(
        counts(&report.final_counts[&SourceId(2)]),
        vec![("car", 1), ("cat", 1), ("person", 1)]
    );
    assert!(report.frames_shown > 0);
    assert!(screen.shown.lock().unwrap().iter().all(|s| *s == SourceId(2)));
    assert!(screen.closed.load(Ordering::SeqCst));
    assert_eq!(*closed.lock().unwrap(), vec![2]);
}

#[test]
fn sources_are_counted_independently_through_the_allow_list() {
    let cameras = FakeCameras {
        available: vec![0, 2],
        closed: Arc::default(),
    };
    let lifecycle = Lifecycle::new();
    let allow = AllowList::only(["cat", "person"]);
    let pipeline = Pipeline::new(cameras, detector(), allow, lifecycle.clone());
    let (tx, rx) = unbounded();
    let stopper = lifecycle.clone();
    let handle = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(100));
        tx.send(ControlMessage::Reset).unwrap();
        std::thread::sleep(Duration::from_millis(100));
        stopper.stop();
    });

    let report = pipeline
        .run(&settings(&[0, 2]), Screen::default(), Silent, &rx)
        .unwrap();
    handle.join().unwrap();

    assert_eq!(counts(&report.final_counts[&SourceId(0)]), vec![("cat", 1)]);
    assert_eq!(
        counts(&report.final_counts[&SourceId(2)]),
        vec![("cat", 1), ("person", 1)]
    );
}

#[test]
fn no_cameras_is_an_error() {
    let cameras = FakeCameras {
        available: vec![],
        closed: Arc::default(),
    };
    let lifecycle = Lifecycle::new();
    let pipeline = Pipeline::new(cameras, detector(), AllowList::all(), lifecycle.clone());
    let (_tx, rx) = unbounded();
    let result = pipeline.run(&settings(&[0, 2]), Screen::default(), Silent, &rx);
    assert!(matches!(result, Err(PipelineError::NoSources)));
    assert!(lifecycle.is_stopped());
    assert_eq!(exit_code(&result.map_err(anyhow::Error::from)), 1);
}

#[test]
fn quit_key_closes_every_stream() {
    let closed = Arc::new(Mutex::new(Vec::new()));
    let cameras = FakeCameras {
        available: vec![0, 2],
        closed: closed.clone(),
    };
    let lifecycle = Lifecycle::new();
    let pipeline = Pipeline::new(cameras, detector(), AllowList::all(), lifecycle.clone());
    let screen = Screen {
        quit_after: Some(50),
        ..Screen::default()
    };
    // no command is ever sent; the quit key alone has to end the run
    let (_tx, rx) = unbounded();

    let result = pipeline.run(&settings(&[0, 2]), screen.clone(), Silent, &rx);

    assert!(lifecycle.is_stopped());
    assert!(screen.closed.load(Ordering::SeqCst));
    let mut closed = closed.lock().unwrap().clone();
    closed.sort_unstable();
    assert_eq!(closed, vec![0, 2]);
    let report = result.unwrap();
    assert_eq!(report.active, vec![SourceId(0), SourceId(2)]);
    assert_eq!(exit_code(&Ok(report)), 0);
}
