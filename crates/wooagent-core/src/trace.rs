use crate::{trace_name, LogEntry, LogLevel, StepType, TraceGroup, TraceStatus};
use chrono::Duration;
use std::collections::HashMap;

/// Rebuilds trace groups from a flat stream of log entries.
///
/// Entries are applied in arrival order. The aggregator never reorders steps and
/// never requires a step's parent to be known when it arrives.
#[derive(Debug, Default, Clone)]
pub struct TraceAggregator {
    groups: HashMap<String, TraceGroup>,
    order: Vec<String>,
}

impl TraceAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies one entry. Returns the updated group, or `None` for log-only entries.
    pub fn ingest(&mut self, entry: &LogEntry) -> Option<&TraceGroup> {
        let trace_id = entry.trace_id.as_deref()?;
        if !self.groups.contains_key(trace_id) {
            self.order.push(trace_id.to_string());
            self.groups.insert(
                trace_id.to_string(),
                TraceGroup {
                    id: trace_id.to_string(),
                    name: trace_name(trace_id),
                    start_time: entry.timestamp,
                    end_time: None,
                    status: TraceStatus::Running,
                    steps: Vec::new(),
                },
            );
        }
        let group = self.groups.get_mut(trace_id)?;
        group.steps.push(entry.clone());
        apply_status(group, entry);
        Some(group)
    }

    /// Drops all reconstruction state and replays `entries` in order.
    pub fn bulk_ingest<'a, I>(&mut self, entries: I)
    where
        I: IntoIterator<Item = &'a LogEntry>,
    {
        self.clear();
        for entry in entries {
            self.ingest(entry);
        }
    }

    pub fn clear(&mut self) {
        self.groups.clear();
        self.order.clear();
    }

    pub fn get_group(&self, trace_id: &str) -> Option<&TraceGroup> {
        self.groups.get(trace_id)
    }

    pub fn list_active_groups(&self) -> Vec<TraceGroup> {
        self.ordered()
            .filter(|group| group.is_active())
            .cloned()
            .collect()
    }

    pub fn list_all(&self) -> Vec<TraceGroup> {
        self.ordered().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    fn ordered(&self) -> impl Iterator<Item = &TraceGroup> {
        self.order.iter().filter_map(|id| self.groups.get(id))
    }
}

fn apply_status(group: &mut TraceGroup, entry: &LogEntry) {
    match entry.step_type {
        Some(StepType::Completion) => {
            if group.status != TraceStatus::Error {
                group.status = TraceStatus::Completed;
            }
            group.end_time = Some(entry.timestamp);
        }
        Some(StepType::Error) if entry.level == LogLevel::Error => {
            group.status = TraceStatus::Error;
            group.end_time = Some(entry.timestamp);
        }
        _ => {}
    }

    if let Some(duration_ms) = entry.duration {
        let finished =
            entry.timestamp + Duration::milliseconds(duration_ms.min(u32::MAX as u64) as i64);
        let extend = group.end_time.map(|end| finished > end).unwrap_or(true);
        if extend {
            group.end_time = Some(finished);
        }
    }
}
