use std::sync::{Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use tracing::debug;

/// The producer's current capability string, if known.
#[derive(Debug, Default)]
pub struct CapsSlot {
    caps: Mutex<Option<String>>,
}

impl CapsSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// A slot that already holds `caps`.
    pub fn with_caps(caps: impl Into<String>) -> Self {
        Self {
            caps: Mutex::new(Some(caps.into())),
        }
    }

    pub fn set(&self, caps: impl Into<String>) {
        let caps = caps.into();
        debug!(%caps, "capabilities updated");
        *self.caps.lock().unwrap_or_else(PoisonError::into_inner) = Some(caps);
    }

    pub fn clear(&self) {
        *self.caps.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    pub fn get(&self) -> Option<String> {
        self.caps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Poll until a capability string is set or `timeout` elapses.
    pub fn wait(&self, timeout: Duration, poll_interval: Duration) -> Option<String> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(caps) = self.get() {
                return Some(caps);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            thread::sleep(poll_interval.min(deadline - now));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn set_get_clear() {
        let slot = CapsSlot::new();
        assert_eq!(slot.get(), None);
        slot.set("video/x-raw");
        assert_eq!(slot.get().as_deref(), Some("video/x-raw"));
        slot.clear();
        assert_eq!(slot.get(), None);
    }

    #[test]
    fn wait_returns_immediately_when_known() {
        let slot = CapsSlot::with_caps("a");
        let start = Instant::now();
        assert_eq!(
            slot.wait(Duration::from_secs(5), Duration::from_millis(10)).as_deref(),
            Some("a")
        );
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn wait_times_out() {
        let slot = CapsSlot::new();
        let start = Instant::now();
        assert_eq!(
            slot.wait(Duration::from_millis(50), Duration::from_millis(10)),
            None
        );
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn wait_sees_caps_set_by_another_thread() {
        let slot = Arc::new(CapsSlot::new());
        let setter = Arc::clone(&slot);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            setter.set("late");
        });
        assert_eq!(
            slot.wait(Duration::from_secs(5), Duration::from_millis(5)).as_deref(),
            Some("late")
        );
        handle.join().expect("setter thread");
    }
}
