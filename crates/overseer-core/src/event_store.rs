// Event store
// Append-only per-run JSONL logs with dense version sequencing.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use overseer_types::{Event, TrajectoryFilter, TrajectoryPage, TrajectoryStats};

use crate::error::{OverseerError, Result};
use crate::event_bus::EventBus;

// ============================================================================
// Event store
// ============================================================================

/// Append-only event log, one JSONL file per run.
///
/// Appends are serialised per run and assign dense, strictly increasing
/// versions starting at 1. Every successful append is also published on the
/// embedded broadcast bus.
pub struct EventStore {
    base_dir: PathBuf,
    /// Latest assigned version per run; appends hold this lock
    versions: Mutex<HashMap<String, u64>>,
    bus: EventBus,
}

impl EventStore {
    pub fn new(base_dir: impl AsRef<Path>) -> Result<Self> {
        let base_dir = base_dir.as_ref().join("events");
        fs::create_dir_all(&base_dir).map_err(|e| {
            OverseerError::Storage(format!("Failed to create event directory: {}", e))
        })?;
        Ok(Self {
            base_dir,
            versions: Mutex::new(HashMap::new()),
            bus: EventBus::new(),
        })
    }

    /// Observers of the write path.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<Event> {
        self.bus.subscribe()
    }

    fn log_path(&self, run_id: &str) -> PathBuf {
        self.base_dir.join(run_id).join("events.jsonl")
    }

    /// Append one event, assigning its version.
    ///
    /// An event arriving with `version == 0` gets `latest + 1`. A preset
    /// version is treated as the caller's expectation: duplicates are
    /// rejected as precondition failures, gaps as fatal invariant
    /// violations.
    pub fn append(&self, mut event: Event) -> Result<Event> {
        // The lock is held across the file append so versions stay dense
        // under concurrent writers.
        let mut versions = self
            .versions
            .lock()
            .map_err(|_| OverseerError::Fatal("event store lock poisoned".to_string()))?;

        let latest = match versions.get(&event.run_id) {
            Some(v) => *v,
            None => self.scan_latest_version(&event.run_id)?,
        };
        let expected = latest + 1;

        if event.version == 0 {
            event.version = expected;
        } else if event.version <= latest {
            return Err(OverseerError::PreconditionDenied(format!(
                "Duplicate event version {} for run {} (latest {})",
                event.version, event.run_id, latest
            )));
        } else if event.version > expected {
            return Err(OverseerError::Fatal(format!(
                "Event version gap for run {}: expected {}, got {}",
                event.run_id, expected, event.version
            )));
        }

        let path = self.log_path(&event.run_id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                OverseerError::Storage(format!("Failed to create run event dir: {}", e))
            })?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| OverseerError::Storage(format!("Failed to open event log: {}", e)))?;
        let line = serde_json::to_string(&event)
            .map_err(|e| OverseerError::Serialization(format!("Failed to serialize event: {}", e)))?;
        writeln!(file, "{}", line)
            .map_err(|e| OverseerError::Storage(format!("Failed to write event: {}", e)))?;

        versions.insert(event.run_id.clone(), event.version);
        drop(versions);

        self.bus.publish(event.clone());
        Ok(event)
    }

    fn scan_latest_version(&self, run_id: &str) -> Result<u64> {
        let path = self.log_path(run_id);
        if !path.exists() {
            return Ok(0);
        }
        let mut latest = 0u64;
        for event in self.read_log(&path)? {
            latest = latest.max(event.version);
        }
        Ok(latest)
    }

    fn read_log(&self, path: &Path) -> Result<Vec<Event>> {
        let file = File::open(path)
            .map_err(|e| OverseerError::Storage(format!("Failed to open event log: {}", e)))?;
        let reader = BufReader::new(file);
        let mut events = Vec::new();
        for line in reader.lines() {
            let line = line
                .map_err(|e| OverseerError::Storage(format!("Failed reading event log: {}", e)))?;
            if line.trim().is_empty() {
                continue;
            }
            if let Ok(event) = serde_json::from_str::<Event>(&line) {
                events.push(event);
            }
        }
        Ok(events)
    }

    /// All events for a run, version ascending.
    pub fn load_by_run(&self, run_id: &str) -> Result<Vec<Event>> {
        let path = self.log_path(run_id);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let mut events = self.read_log(&path)?;
        events.sort_by_key(|e| e.version);
        Ok(events)
    }

    /// Filtered, cursor-paginated trajectory query.
    pub fn load_trajectory(
        &self,
        run_id: &str,
        filter: &TrajectoryFilter,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<TrajectoryPage> {
        let after_version = match cursor {
            Some(cursor) => Cursor::decode(cursor)?.version,
            None => 0,
        };

        let filtered: Vec<Event> = self
            .load_by_run(run_id)?
            .into_iter()
            .filter(|event| filter_matches(filter, event))
            .collect();
        let total = filtered.len() as u64;

        let mut events: Vec<Event> = filtered
            .into_iter()
            .filter(|event| event.version > after_version)
            .collect();
        let has_more = events.len() > limit;
        events.truncate(limit);

        let cursor = if has_more {
            events.last().map(Cursor::of)
        } else {
            None
        };

        Ok(TrajectoryPage {
            events,
            cursor,
            has_more,
            total,
        })
    }

    /// Aggregate statistics over a run's full trajectory.
    pub fn trajectory_stats(&self, run_id: &str) -> Result<TrajectoryStats> {
        let events = self.load_by_run(run_id)?;
        let mut stats = TrajectoryStats {
            total_events: events.len() as u64,
            ..Default::default()
        };

        for event in &events {
            *stats
                .counts_by_type
                .entry(event.event_type.clone())
                .or_insert(0) += 1;
            if event.event_type == overseer_types::event::kind::RUN_TOOLCALL
                && event.payload.get("phase").and_then(|p| p.as_str()) == Some("requested")
            {
                stats.tool_call_count += 1;
            }
            let failed_result = event.payload.get("success").and_then(|s| s.as_bool()) == Some(false);
            if event.event_type == overseer_types::event::kind::RUN_FAILED || failed_result {
                stats.error_count += 1;
            }
        }

        if let (Some(first), Some(last)) = (events.first(), events.last()) {
            stats.duration_ms = (last.created_at - first.created_at).num_milliseconds().max(0) as u64;
        }
        Ok(stats)
    }

    /// Drop a run's log entirely. Only the session/checkpoint GC path calls
    /// this, on run deletion.
    pub fn delete_run(&self, run_id: &str) -> Result<()> {
        if let Ok(mut versions) = self.versions.lock() {
            versions.remove(run_id);
        }
        let dir = self.base_dir.join(run_id);
        if dir.exists() {
            fs::remove_dir_all(&dir).map_err(|e| {
                OverseerError::Storage(format!("Failed to delete run events: {}", e))
            })?;
        }
        Ok(())
    }
}

fn filter_matches(filter: &TrajectoryFilter, event: &Event) -> bool {
    if !filter.types.is_empty() && !filter.types.iter().any(|t| t == &event.event_type) {
        return false;
    }
    if let Some(after) = filter.after {
        if event.created_at <= after {
            return false;
        }
    }
    if let Some(before) = filter.before {
        if event.created_at >= before {
            return false;
        }
    }
    true
}

// ============================================================================
// Cursors
// ============================================================================

/// Opaque, deterministic pagination cursor: encodes the last returned
/// `(created_at, version)`.
struct Cursor {
    version: u64,
}

impl Cursor {
    fn of(event: &Event) -> String {
        format!(
            "v1:{}:{}",
            event.created_at.timestamp_millis(),
            event.version
        )
    }

    fn decode(raw: &str) -> Result<Cursor> {
        let mut parts = raw.split(':');
        let (Some("v1"), Some(_ts), Some(version)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(OverseerError::Validation(format!("Bad cursor '{}'", raw)));
        };
        let version = version
            .parse::<u64>()
            .map_err(|_| OverseerError::Validation(format!("Bad cursor '{}'", raw)))?;
        Ok(Cursor { version })
    }
}

// ============================================================================
// Tests
// ============================================================================
