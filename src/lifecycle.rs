use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::{Duration, Instant};

const SLEEP_SLICE: Duration = Duration::from_millis(20);

/// One-way stop signal shared by every loop in the pipeline.
///
/// Clones observe the same flag. Once stopped it never runs again; resetting
/// counts does not touch it.
#[derive(Clone, Debug, Default)]
pub struct Lifecycle {
    stopped: Arc<AtomicBool>,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests shutdown. Returns `true` for the call that made the transition.
    pub fn stop(&self) -> bool {
        !self.stopped.swap(true, Ordering::AcqRel)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        !self.is_stopped()
    }

    /// Sleeps for `duration` unless stopped first. Returns `false` if the
    /// sleep was cut short by a stop request.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_stopped() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            std::thread::sleep((deadline - now).min(SLEEP_SLICE));
        }
    }
}
