//! Admission policy and flow-control accounting.

use serde::{Deserialize, Serialize};

use crate::core::error::LimitKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyMode {
    Reject,
    FlowToDisk,
}

impl PolicyMode {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "reject" => Some(PolicyMode::Reject),
            "flow_to_disk" | "flow-to-disk" => Some(PolicyMode::FlowToDisk),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyMode::Reject => "reject",
            PolicyMode::FlowToDisk => "flow_to_disk",
        }
    }
}

/// Per-queue resident thresholds and what happens when they are exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionPolicy {
    pub max_count: Option<u64>,
    pub max_size: Option<u64>,
    pub mode: PolicyMode,
}

impl AdmissionPolicy {
    pub fn reject(max_count: Option<u64>, max_size: Option<u64>) -> Self {
        Self {
            max_count,
            max_size,
            mode: PolicyMode::Reject,
        }
    }

    pub fn flow_to_disk(max_count: Option<u64>, max_size: Option<u64>) -> Self {
        Self {
            max_count,
            max_size,
            mode: PolicyMode::FlowToDisk,
        }
    }

    /// Would one more resident record of `size` bytes exceed a threshold?
    pub fn check(&self, flow: FlowState, size: u64) -> Option<Overflow> {
        if let Some(max) = self.max_count {
            if flow.count + 1 > max {
                return Some(Overflow {
                    kind: LimitKind::Count,
                    max,
                    current: flow.count,
                });
            }
        }
        if let Some(max) = self.max_size {
            if flow.size + size > max {
                return Some(Overflow {
                    kind: LimitKind::Size,
                    max,
                    current: flow.size,
                });
            }
        }
        None
    }
}

/// A threshold an accept would cross.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Overflow {
    pub kind: LimitKind,
    pub max: u64,
    pub current: u64,
}

/// Resident count and size of a queue's committed records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlowState {
    pub count: u64,
    pub size: u64,
}

impl FlowState {
    pub fn add(&mut self, size: u64) {
        self.count += 1;
        self.size += size;
    }

    pub fn remove(&mut self, size: u64) {
        self.count = self.count.saturating_sub(1);
        self.size = self.size.saturating_sub(size);
    }

    pub fn plus(self, other: FlowState) -> FlowState {
        FlowState {
            count: self.count + other.count,
            size: self.size + other.size,
        }
    }
}
