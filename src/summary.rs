use crate::ipc::ControlMessage;
use crate::lifecycle::Lifecycle;
use crate::store::{CountStore, Snapshot};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use std::io::{self, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Renders a snapshot as a per-source listing of `class: count` lines.
pub fn format_summary(snapshot: &Snapshot) -> String {
    let mut lines = Vec::new();
    for (source, counts) in snapshot {
        lines.push(format!("{source}:"));
        if counts.is_empty() {
            lines.push("  No detections yet".to_string());
        }
        for (class, count) in counts {
            lines.push(format!("  {class}: {count}"));
        }
        lines.push(String::new());
    }
    if lines.is_empty() {
        lines.push("No cameras active".to_string());
    }
    lines.join("\n")
}

pub trait SummarySurface {
    fn render(&mut self, text: &str);
}

/// Prints the summary to stdout whenever it changes.
#[derive(Default)]
pub struct ConsoleSurface {
    last: Option<String>,
}

impl SummarySurface for ConsoleSurface {
    fn render(&mut self, text: &str) {
        if self.last.as_deref() == Some(text) {
            return;
        }
        let mut out = io::stdout().lock();
        let _ = writeln!(out, "== Detection Counts ==\n{text}");
        let _ = out.flush();
        self.last = Some(text.to_string());
    }
}

/// Periodic read-only view of the counts, plus the Reset and Quit commands.
pub struct SummaryView<S> {
    store: Arc<CountStore>,
    lifecycle: Lifecycle,
    surface: S,
    interval: Duration,
}

impl<S: SummarySurface> SummaryView<S> {
    pub fn new(store: Arc<CountStore>, lifecycle: Lifecycle, surface: S) -> Self {
        Self {
            store,
            lifecycle,
            surface,
            interval: Duration::from_millis(500),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn surface(&self) -> &S {
        &self.surface
    }

    pub fn refresh(&mut self) {
        let text = format_summary(&self.store.snapshot());
        self.surface.render(&text);
    }

    pub fn reset(&mut self) {
        self.store.reset();
        self.refresh();
    }

    pub fn quit(&mut self) {
        info!("quit requested");
        self.lifecycle.stop();
    }

    /// Refreshes every interval and handles commands until the lifecycle
    /// stops. Returns once no further refresh will be scheduled.
    pub fn run(&mut self, commands: &Receiver<ControlMessage>) {
        let mut next_refresh = Instant::now();
        while self.lifecycle.is_running() {
            if Instant::now() >= next_refresh {
                self.refresh();
                next_refresh = Instant::now() + self.interval;
            }
            let wait = next_refresh.saturating_duration_since(Instant::now());
            match commands.recv_timeout(wait) {
                Ok(ControlMessage::Reset) => {
                    debug!("reset requested");
                    self.reset();
                }
                Ok(ControlMessage::Quit) => self.quit(),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    self.lifecycle.sleep(wait);
                }
            }
        }
        debug!("summary view stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::SourceId;
    use crossbeam_channel::unbounded;
    use std::collections::BTreeSet;

    #[derive(Default)]
    struct Frames(Vec<String>);

    impl SummarySurface for Frames {
        fn render(&mut self, text: &str) {
            self.0.push(text.to_string());
        }
    }

    fn classes(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn formats_counts_and_placeholder() {
        let store = CountStore::with_sources(&[SourceId(0), SourceId(2)]);
        store.record_first_seen(SourceId(0), &classes(&["person", "cat"]));
        let text = format_summary(&store.snapshot());
        assert_eq!(
            text,
            "Camera 0:\n  cat: 1\n  person: 1\n\nCamera 2:\n  No detections yet\n"
        );
    }

    #[test]
    fn reset_command_clears_and_quit_stops() {
        let store = Arc::new(CountStore::with_sources(&[SourceId(1)]));
        store.record_first_seen(SourceId(1), &classes(&["dog"]));
        let lifecycle = Lifecycle::new();
        let mut view = SummaryView::new(store.clone(), lifecycle.clone(), Frames::default())
            .with_interval(Duration::from_secs(60));
        let (tx, rx) = unbounded();
        tx.send(ControlMessage::Reset).unwrap();
        tx.send(ControlMessage::Quit).unwrap();
        view.run(&rx);
        assert!(lifecycle.is_stopped());
        assert_eq!(store.count(SourceId(1), "dog"), 0);
        let rendered = &view.surface().0;
        assert!(rendered[0].contains("dog: 1"));
        assert!(rendered.last().unwrap().contains("No detections yet"));
    }

    #[test]
    fn external_stop_ends_polling() {
        let lifecycle = Lifecycle::new();
        let store = Arc::new(CountStore::new());
        let mut view = SummaryView::new(store, lifecycle.clone(), Frames::default())
            .with_interval(Duration::from_millis(5));
        let (_tx, rx) = unbounded();
        let stopper = lifecycle.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(40));
            stopper.stop();
        });
        view.run(&rx);
        handle.join().unwrap();
        assert!(view.surface().0.len() >= 2);
        assert!(view.surface().0.iter().all(|t| t == "No cameras active"));
    }
}
