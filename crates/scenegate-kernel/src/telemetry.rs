use std::collections::VecDeque;

use serde::Serialize;

use crate::util::now_iso8601;

pub const DEFAULT_TELEMETRY_CAPACITY: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorRecord {
    pub timestamp: String,
    pub action: String,
    pub code: String,
    pub message: String,
}

/// Bounded ring of recent pipeline errors, oldest dropped first. `total`
/// keeps counting past the capacity.
#[derive(Debug)]
pub struct ErrorTelemetry {
    capacity: usize,
    recent: VecDeque<ErrorRecord>,
    total: u64,
}

impl Default for ErrorTelemetry {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_TELEMETRY_CAPACITY)
    }
}

impl ErrorTelemetry {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            recent: VecDeque::with_capacity(capacity),
            total: 0,
        }
    }

    pub fn record(&mut self, action: &str, code: &str, message: &str) {
        if self.recent.len() == self.capacity {
            self.recent.pop_front();
        }
        self.recent.push_back(ErrorRecord {
            timestamp: now_iso8601(),
            action: action.to_string(),
            code: code.to_string(),
            message: message.to_string(),
        });
        self.total += 1;
    }

    pub fn recent(&self) -> impl Iterator<Item = &ErrorRecord> {
        self.recent.iter()
    }

    pub fn total(&self) -> u64 {
        self.total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_drops_oldest() {
        let mut telemetry = ErrorTelemetry::with_capacity(2);
        for action in ["a", "b", "c"] {
            telemetry.record(action, "TOOL_NOT_FOUND", "missing");
        }
        let actions: Vec<_> = telemetry.recent().map(|r| r.action.as_str()).collect();
        assert_eq!(actions, ["b", "c"]);
        assert_eq!(telemetry.total(), 3);
    }
}
