//! Output sinks - append-only text destinations for run output and
//! connection diagnostics.
//!
//! The editor host hands the core an [`OutputSink`] for each run and one
//! for the language service's diagnostics. [`OutputChannel`] is the
//! in-process implementation:
//! - Full text history via `contents()` / `lines()`, nothing is evicted
//! - Real-time broadcast of appended text via `subscribe()`

use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Pending appends kept for slow subscribers before they start lagging.
const BROADCAST_CAPACITY: usize = 2048;

/// Append-only text destination.
///
/// Implementations must preserve call order: text appended by one caller
/// appears after everything that caller appended before.
pub trait OutputSink: Send + Sync {
    /// Append raw text without adding a line break.
    fn append(&self, text: &str);

    /// Append `line` followed by a line break.
    fn append_line(&self, line: &str) {
        let mut text = String::with_capacity(line.len() + 1);
        text.push_str(line);
        text.push('\n');
        self.append(&text);
    }

    /// Discard everything shown so far.
    fn clear(&self) {}

    /// Bring the sink to the user's attention without stealing focus.
    fn show(&self) {}
}

/// Which stream a piece of child output came from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OutputSource {
    Stdout,
    Stderr,
}

#[derive(Default)]
struct ChannelState {
    text: String,
    visible: bool,
}

/// Named [`OutputSink`] that keeps everything appended to it.
pub struct OutputChannel {
    name: String,
    state: Mutex<ChannelState>,
    updates: broadcast::Sender<String>,
}

impl OutputChannel {
    pub fn new(name: &str) -> Self {
        let (updates, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            name: name.to_string(),
            state: Mutex::new(ChannelState::default()),
            updates,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> MutexGuard<'_, ChannelState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Everything appended since creation or the last `clear()`.
    pub fn contents(&self) -> String {
        self.lock().text.clone()
    }

    /// Contents split into lines (without terminators).
    pub fn lines(&self) -> Vec<String> {
        self.contents().lines().map(String::from).collect()
    }

    /// Whether `show()` has been called since creation.
    pub fn is_visible(&self) -> bool {
        self.lock().visible
    }

    /// Receive each appended piece of text as it arrives.
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.updates.subscribe()
    }
}

impl OutputSink for OutputChannel {
    fn append(&self, text: &str) {
        if text.is_empty() {
            return;
        }
        self.lock().text.push_str(text);
        tracing::trace!(channel = %self.name, bytes = text.len(), "output appended");
        let _ = self.updates.send(text.to_string());
    }

    fn clear(&self) {
        self.lock().text.clear();
    }

    fn show(&self) {
        self.lock().visible = true;
    }
}
