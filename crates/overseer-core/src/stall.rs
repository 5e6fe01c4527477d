// Stall tracker
// Fixed-window progress heuristic over a single run's tool results.

use std::collections::VecDeque;

/// Tools whose successful, novel output counts as progress.
pub const PROGRESS_TOOLS: &[&str] = &["Edit", "Write", "Bash", "NotebookEdit", "Patch"];

/// Detects a stalled run: N consecutive non-progress tool results.
///
/// A result is progress iff the tool is in the progress set, the call
/// succeeded, and the output is not byte-identical to any output currently
/// in the window. Pure and synchronous; the engine calls `record` after
/// every tool-result ingestion.
#[derive(Debug, Clone)]
pub struct StallTracker {
    threshold: u32,
    window: VecDeque<String>,
    counter: u32,
    progress_tools: Vec<String>,
}

impl StallTracker {
    pub fn new(threshold: u32) -> Self {
        Self::with_progress_tools(
            threshold,
            PROGRESS_TOOLS.iter().map(|t| t.to_string()).collect(),
        )
    }

    pub fn with_progress_tools(threshold: u32, progress_tools: Vec<String>) -> Self {
        Self {
            threshold: threshold.max(1),
            window: VecDeque::new(),
            counter: 0,
            progress_tools,
        }
    }

    /// Ingest one tool result; returns true when it counted as progress.
    pub fn record(&mut self, tool: &str, success: bool, output: &str) -> bool {
        let is_progress = success
            && self.progress_tools.iter().any(|t| t == tool)
            && !self.window.iter().any(|seen| seen == output);

        if self.window.len() == self.threshold as usize {
            self.window.pop_front();
        }
        self.window.push_back(output.to_string());

        if is_progress {
            self.counter = 0;
        } else {
            self.counter += 1;
        }
        is_progress
    }

    pub fn is_stalled(&self) -> bool {
        self.counter >= self.threshold
    }

    pub fn counter(&self) -> u32 {
        self.counter
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_reads_stall_at_threshold() {
        let mut tracker = StallTracker::new(3);
        for _ in 0..3 {
            tracker.record("Read", true, "same bytes");
        }
        assert!(tracker.is_stalled());
    }

    #[test]
    fn novel_edits_reset_the_counter() {
        let mut tracker = StallTracker::new(3);
        tracker.record("Read", true, "a");
        tracker.record("Read", true, "a");
        assert_eq!(tracker.counter(), 2);

        tracker.record("Edit", true, "fresh output");
        assert_eq!(tracker.counter(), 0);
        assert!(!tracker.is_stalled());
    }

    #[test]
    fn repeated_edit_output_is_not_progress() {
        let mut tracker = StallTracker::new(2);
        assert!(tracker.record("Edit", true, "patch"));
        assert!(!tracker.record("Edit", true, "patch"));
        assert!(!tracker.record("Edit", true, "patch"));
        assert!(tracker.is_stalled());
    }

    #[test]
    fn failed_calls_never_count_as_progress() {
        let mut tracker = StallTracker::new(2);
        assert!(!tracker.record("Edit", false, "error: no such file"));
        assert!(!tracker.record("Write", false, "error: permission"));
        assert!(tracker.is_stalled());
    }

    #[test]
    fn window_is_bounded_by_threshold() {
        let mut tracker = StallTracker::new(2);
        tracker.record("Edit", true, "one");
        tracker.record("Edit", true, "two");
        tracker.record("Edit", true, "three");
        // "one" has been evicted, so it reads as novel again.
        assert!(tracker.record("Edit", true, "one"));
    }
}
