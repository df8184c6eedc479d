use crate::allow_list::AllowList;
use crate::capture::CaptureBackend;
use crate::config::Config;
use crate::detect::Detector;
use crate::display::{DisplayLoop, RenderBackend};
use crate::ipc::ControlMessage;
use crate::lifecycle::Lifecycle;
use crate::relay::relay;
use crate::source::SourceId;
use crate::store::{CountStore, Snapshot};
use crate::summary::{SummarySurface, SummaryView};
use crate::worker::CameraWorker;
use crossbeam_channel::{unbounded, Receiver};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("no cameras available")]
    NoSources,
    #[error("failed to start thread: {0}")]
    Spawn(#[from] io::Error),
}

#[derive(Clone, Debug, PartialEq)]
pub struct PipelineSettings {
    pub sources: Vec<SourceId>,
    pub refresh: Duration,
    pub display_tick: Duration,
    pub read_retry: Duration,
}

impl From<&Config> for PipelineSettings {
    fn from(cfg: &Config) -> Self {
        let mut sources: Vec<SourceId> = cfg.cameras.iter().copied().map(SourceId).collect();
        sources.sort();
        sources.dedup();
        Self {
            sources,
            refresh: Duration::from_millis(cfg.refresh_ms.max(1)),
            display_tick: Duration::from_millis(cfg.display_tick_ms),
            read_retry: Duration::from_millis(cfg.read_retry_ms),
        }
    }
}

/// What a finished run looked like.
#[derive(Debug)]
pub struct RunReport {
    pub active: Vec<SourceId>,
    pub frames_shown: u64,
    pub final_counts: Snapshot,
}

/// The shared pieces every stage of a run is built from.
pub struct Pipeline<B> {
    backend: Arc<B>,
    detector: Arc<dyn Detector>,
    allow_list: Arc<AllowList>,
    lifecycle: Lifecycle,
}

impl<B: CaptureBackend + 'static> Pipeline<B> {
    pub fn new(
        backend: B,
        detector: Arc<dyn Detector>,
        allow_list: AllowList,
        lifecycle: Lifecycle,
    ) -> Self {
        Self {
            backend: Arc::new(backend),
            detector,
            allow_list: Arc::new(allow_list),
            lifecycle,
        }
    }

    /// Opens every configured source, runs until the lifecycle stops and
    /// joins all threads. Sources that fail to open are dropped; if none
    /// opens the run fails with [`PipelineError::NoSources`].
    pub fn run<R, S>(
        &self,
        settings: &PipelineSettings,
        render: R,
        surface: S,
        commands: &Receiver<ControlMessage>,
    ) -> Result<RunReport, PipelineError>
    where
        R: RenderBackend + 'static,
        S: SummarySurface,
    {
        let store = Arc::new(CountStore::new());
        let (opened_tx, opened_rx) = unbounded();
        let mut pending = Vec::with_capacity(settings.sources.len());
        for &source in &settings.sources {
            let (publisher, consumer) = relay();
            let worker = CameraWorker::new(
                source,
                self.detector.clone(),
                self.allow_list.clone(),
                store.clone(),
                publisher,
                self.lifecycle.clone(),
            )
            .with_read_retry(settings.read_retry);
            let handle = match worker.spawn(self.backend.clone(), opened_tx.clone()) {
                Ok(handle) => handle,
                Err(e) => {
                    self.lifecycle.stop();
                    return Err(e.into());
                }
            };
            pending.push((source, handle, consumer));
        }
        drop(opened_tx);

        let mut opened = Vec::new();
        for (source, result) in opened_rx.iter() {
            match result {
                Ok(()) => opened.push(source),
                Err(e) => warn!(source = %source, "camera unavailable: {e}"),
            }
        }

        let mut display =
            DisplayLoop::new(render, self.lifecycle.clone()).with_tick(settings.display_tick);
        let mut workers = Vec::new();
        for (source, handle, consumer) in pending {
            if opened.contains(&source) {
                store.register(source);
                display.add_source(source, consumer);
                workers.push((source, handle));
            } else if handle.join().is_err() {
                error!(source = %source, "camera worker panicked");
            }
        }
        if workers.is_empty() {
            self.lifecycle.stop();
            return Err(PipelineError::NoSources);
        }
        let active = display.sources();
        info!(cameras = ?active.iter().map(|s| s.index()).collect::<Vec<_>>(), "pipeline running");

        let display = match display.spawn() {
            Ok(handle) => handle,
            Err(e) => {
                self.lifecycle.stop();
                join_workers(workers);
                return Err(e.into());
            }
        };

        SummaryView::new(store.clone(), self.lifecycle.clone(), surface)
            .with_interval(settings.refresh)
            .run(commands);

        self.lifecycle.stop();
        join_workers(workers);
        let frames_shown = display.join().unwrap_or_else(|_| {
            error!("display thread panicked");
            0
        });
        info!(frames_shown, "pipeline stopped");
        Ok(RunReport {
            active,
            frames_shown,
            final_counts: store.snapshot(),
        })
    }
}

fn join_workers(workers: Vec<(SourceId, std::thread::JoinHandle<()>)>) {
    for (source, handle) in workers {
        if handle.join().is_err() {
            error!(source = %source, "camera worker panicked");
        }
    }
}
