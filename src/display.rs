use crate::lifecycle::Lifecycle;
use crate::relay::RelayConsumer;
use crate::source::SourceId;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError};
use image::{ImageFormat, RgbImage};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum RenderError {
    #[error("render I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("failed to encode frame: {0}")]
    Encode(#[from] image::ImageError),
}

/// Where annotated frames are shown.
pub trait RenderBackend: Send {
    fn show(&mut self, source: SourceId, frame: &RgbImage) -> Result<(), RenderError>;

    /// Waits at most `wait` for the quit key. Returns `true` if it was pressed.
    fn poll_quit(&mut self, wait: Duration) -> bool;

    fn close(&mut self) {}
}

/// Drains every source's relay and renders whatever is new.
pub struct DisplayLoop<R> {
    relays: Vec<(SourceId, RelayConsumer<RgbImage>)>,
    backend: R,
    lifecycle: Lifecycle,
    tick_wait: Duration,
}

impl<R: RenderBackend> DisplayLoop<R> {
    pub fn new(backend: R, lifecycle: Lifecycle) -> Self {
        Self {
            relays: Vec::new(),
            backend,
            lifecycle,
            tick_wait: Duration::from_millis(10),
        }
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick_wait = tick;
        self
    }

    pub fn add_source(&mut self, source: SourceId, relay: RelayConsumer<RgbImage>) {
        self.relays.push((source, relay));
        self.relays.sort_by_key(|(source, _)| *source);
    }

    pub fn sources(&self) -> Vec<SourceId> {
        self.relays.iter().map(|(source, _)| *source).collect()
    }

    /// Shows the pending frame of every source that has one. Sources with
    /// nothing new keep their previous render. Returns the frames shown.
    pub fn tick(&mut self) -> usize {
        let mut shown = 0;
        for (source, relay) in &self.relays {
            let Some(frame) = relay.try_consume() else {
                continue;
            };
            match self.backend.show(*source, &frame) {
                Ok(()) => shown += 1,
                Err(e) => warn!(source = %source, "failed to render frame: {e}"),
            }
        }
        shown
    }

    /// Runs until the lifecycle stops or the quit key is pressed, then
    /// releases the backend. Returns the number of frames shown.
    pub fn run(mut self) -> u64 {
        info!(sources = self.relays.len(), "display started");
        let mut total = 0u64;
        while self.lifecycle.is_running() {
            total += self.tick() as u64;
            if self.backend.poll_quit(self.tick_wait) {
                info!("quit key pressed");
                self.lifecycle.stop();
            }
        }
        self.backend.close();
        info!(frames = total, "display stopped");
        total
    }

    pub fn spawn(self) -> io::Result<JoinHandle<u64>>
    where
        R: 'static,
    {
        std::thread::Builder::new()
            .name("display".to_string())
            .spawn(move || self.run())
    }
}

/// Routes Ctrl-C into a channel that a render backend can poll as its quit key.
pub fn install_interrupt_handler() -> Result<Receiver<()>, ctrlc::Error> {
    let (tx, rx) = unbounded();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })?;
    Ok(rx)
}

/// Writes the latest frame of each source to `camera-<N>.jpg` in a directory.
pub struct DirectoryRender {
    dir: PathBuf,
    interrupts: Receiver<()>,
}

impl DirectoryRender {
    pub fn new(dir: &Path, interrupts: Receiver<()>) -> Result<Self, RenderError> {
        fs::create_dir_all(dir)?;
        info!(dir = %dir.display(), "writing live frames");
        Ok(Self {
            dir: dir.to_path_buf(),
            interrupts,
        })
    }

    pub fn frame_path(&self, source: SourceId) -> PathBuf {
        self.dir.join(format!("camera-{}.jpg", source.index()))
    }
}

impl RenderBackend for DirectoryRender {
    fn show(&mut self, source: SourceId, frame: &RgbImage) -> Result<(), RenderError> {
        let path = self.frame_path(source);
        let tmp = self.dir.join(format!(".camera-{}.jpg.tmp", source.index()));
        frame.save_with_format(&tmp, ImageFormat::Jpeg)?;
        // viewers only ever see complete files
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn poll_quit(&mut self, wait: Duration) -> bool {
        match self.interrupts.recv_timeout(wait) {
            Ok(()) => true,
            Err(RecvTimeoutError::Timeout) => false,
            Err(RecvTimeoutError::Disconnected) => {
                std::thread::sleep(wait);
                false
            }
        }
    }

    fn close(&mut self) {
        debug!(dir = %self.dir.display(), "frame directory released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::relay;
    use crossbeam_channel::bounded;
    use std::sync::{Arc, Mutex};
    use tempfile::tempdir;

    #[derive(Clone, Default)]
    struct Recorder {
        shown: Arc<Mutex<Vec<(SourceId, u32)>>>,
        quit_after: Option<usize>,
        polls: usize,
    }

    impl RenderBackend for Recorder {
        fn show(&mut self, source: SourceId, frame: &RgbImage) -> Result<(), RenderError> {
            self.shown.lock().unwrap().push((source, frame.width()));
            Ok(())
        }

        fn poll_quit(&mut self, _wait: Duration) -> bool {
            self.polls += 1;
            self.quit_after.is_some_and(|n| self.polls >= n)
        }
    }

    #[test]
    fn tick_only_renders_sources_with_new_frames() {
        let recorder = Recorder::default();
        let shown = recorder.shown.clone();
        let mut display = DisplayLoop::new(recorder, Lifecycle::new());
        let (tx0, rx0) = relay();
        let (_tx1, rx1) = relay();
        display.add_source(SourceId(1), rx1);
        display.add_source(SourceId(0), rx0);
        tx0.publish(RgbImage::new(8, 8));
        tx0.publish(RgbImage::new(16, 8));
        assert_eq!(display.tick(), 1);
        assert_eq!(display.tick(), 0);
        assert_eq!(*shown.lock().unwrap(), vec![(SourceId(0), 16)]);
    }

    #[test]
    fn quit_key_stops_lifecycle() {
        let lifecycle = Lifecycle::new();
        let recorder = Recorder {
            quit_after: Some(3),
            ..Default::default()
        };
        let display = DisplayLoop::new(recorder, lifecycle.clone()).with_tick(Duration::ZERO);
        display.run();
        assert!(lifecycle.is_stopped());
    }

    #[test]
    fn directory_render_writes_jpeg_per_source() {
        let dir = tempdir().unwrap();
        let (_tx, rx) = bounded(1);
        let mut render = DirectoryRender::new(&dir.path().join("frames"), rx).unwrap();
        render.show(SourceId(2), &RgbImage::new(32, 24)).unwrap();
        let written = image::open(render.frame_path(SourceId(2))).unwrap();
        assert_eq!((written.width(), written.height()), (32, 24));
    }

    #[test]
    fn directory_render_quits_on_interrupt() {
        let dir = tempdir().unwrap();
        let (tx, rx) = bounded(1);
        let mut render = DirectoryRender::new(dir.path(), rx).unwrap();
        assert!(!render.poll_quit(Duration::from_millis(1)));
        tx.send(()).unwrap();
        assert!(render.poll_quit(Duration::from_millis(1)));
    }
}
