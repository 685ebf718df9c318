//! Static register map and the coalesced read plan compiled from it.
//!
//! The map lists byte offsets carrying 8 boolean signals each, byte offsets
//! carrying raw bytes, and offsets of 4-byte floats. Before polling, the map
//! is compiled into a [`ReadPlan`]: byte ranges that touch (or sit within
//! `max_gap` bytes of each other) are merged into spans of at most `max_span`
//! bytes, so one transport read serves many signals.
//!
//! # Example
//!
//! ```
//! use plcwatch::RegisterMap;
//!
//! let map = RegisterMap {
//!     bit_groups: vec![100, 101, 102, 103],
//!     bytes: vec![1001, 1003],
//!     floats: vec![1200, 1204],
//!     ..RegisterMap::default()
//! };
//! let plan = map.read_plan();
//! // 100..104, 1001..1004 (gap of 1 bridged), 1200..1208
//! assert_eq!(plan.spans().len(), 3);
//! assert_eq!(plan.signal_count(), 32 + 2 + 2);
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::address::SignalId;

/// Default upper bound on a single read span.
pub const DEFAULT_MAX_SPAN: u32 = 200;

/// Default number of unused bytes bridged between two ranges.
pub const DEFAULT_MAX_GAP: u32 = 1;

/// Which signals exist in PLC memory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegisterMap {
    /// Byte offsets whose 8 bits are boolean signals `V{offset}.0..7`.
    pub bit_groups: Vec<u32>,
    /// Byte offsets read as raw bytes `VB{offset}`.
    pub bytes: Vec<u32>,
    /// Start offsets of 4-byte floats `VD{offset}`.
    pub floats: Vec<u32>,
    /// Largest number of bytes fetched by one read.
    pub max_span: u32,
    /// Largest gap of unused bytes merged into a span.
    pub max_gap: u32,
    /// Human-readable names for individual signals.
    pub labels: BTreeMap<SignalId, String>,
}

impl Default for RegisterMap {
    fn default() -> Self {
        let labels = [
            (1001, "enable state"),
            (1003, "robot mode"),
            (1005, "run state"),
            (1007, "tool number"),
            (1009, "workpiece number"),
            (1011, "emergency stop"),
            (1013, "soft limit fault"),
            (1015, "main fault code"),
            (1017, "sub fault code"),
            (1019, "collision detected"),
            (1021, "motion in position"),
            (1023, "safety stop SIO"),
            (1025, "safety stop SII"),
        ]
        .into_iter()
        .map(|(offset, name)| (SignalId::byte(offset), name.to_string()))
        .chain((0..6u32).flat_map(|joint| {
            [
                (1200 + joint * 4, format!("joint {} position", joint + 1)),
                (1224 + joint * 4, format!("joint {} speed", joint + 1)),
                (1248 + joint * 4, format!("joint {} current", joint + 1)),
                (1272 + joint * 4, format!("joint {} torque", joint + 1)),
            ]
            .into_iter()
            .map(|(offset, name)| (SignalId::float(offset), name))
        }))
        .chain(
            ["X", "Y", "Z", "RX", "RY", "RZ"]
                .iter()
                .enumerate()
                .flat_map(|(i, axis)| {
                    let i = i as u32;
                    [
                        (SignalId::float(1296 + i * 4), format!("TCP position {}", axis)),
                        (SignalId::float(1320 + i * 4), format!("TCP speed {}", axis)),
                    ]
                }),
        )
        .collect();

        Self {
            bit_groups: vec![
                100, 101, 102, 103, 200, 201, 202, 203, 300, 301, 400, 600, 601, 700, 701, 750,
                800, 801, 900, 901,
            ],
            bytes: (1001..=1025).step_by(2).collect(),
            floats: (1200..=1340).step_by(4).collect(),
            max_span: DEFAULT_MAX_SPAN,
            max_gap: DEFAULT_MAX_GAP,
            labels,
        }
    }
}

impl RegisterMap {
    /// Returns every signal in the map, sorted by memory layout, without duplicates.
    pub fn signals(&self) -> Vec<SignalId> {
        let mut ids: Vec<SignalId> = self
            .bit_groups
            .iter()
            .flat_map(|&offset| (0..8u8).map(move |bit| SignalId::Bit { offset, bit }))
            .chain(self.bytes.iter().map(|&offset| SignalId::byte(offset)))
            .chain(self.floats.iter().map(|&offset| SignalId::float(offset)))
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }

    /// Returns whether `id` is produced by a poll of this map.
    pub fn contains(&self, id: &SignalId) -> bool {
        match *id {
            SignalId::Bit { offset, .. } => self.bit_groups.contains(&offset),
            SignalId::Byte { offset } => self.bytes.contains(&offset),
            SignalId::Float { offset } => self.floats.contains(&offset),
        }
    }

    /// Returns the label of `id`, or its address text.
    pub fn label(&self, id: &SignalId) -> String {
        self.labels
            .get(id)
            .cloned()
            .unwrap_or_else(|| id.to_string())
    }

    /// Compiles the map into a read plan.
    pub fn read_plan(&self) -> ReadPlan {
        let max_span = self.max_span.max(4);
        let mut spans: Vec<ReadSpan> = Vec::new();

        for id in self.signals() {
            let start = id.offset();
            let end = start.saturating_add(id.width());
            if let Some(span) = spans.last_mut() {
                let span_end = span.offset.saturating_add(span.len);
                let merged_end = span_end.max(end);
                if start <= span_end.saturating_add(self.max_gap)
                    && merged_end - span.offset <= max_span
                {
                    span.len = merged_end - span.offset;
                    span.signals.push(id);
                    continue;
                }
            }
            spans.push(ReadSpan {
                offset: start,
                len: id.width(),
                signals: vec![id],
            });
        }

        ReadPlan { spans }
    }
}

/// One contiguous transport read and the signals decoded from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadSpan {
    /// First byte read.
    pub offset: u32,
    /// Number of bytes read.
    pub len: u32,
    /// Signals fully contained in the span.
    pub signals: Vec<SignalId>,
}

/// The ordered list of reads performed every poll cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadPlan {
    spans: Vec<ReadSpan>,
}

impl ReadPlan {
    /// Returns the spans in memory order.
    pub fn spans(&self) -> &[ReadSpan] {
        &self.spans
    }

    /// Returns the total number of signals decoded per cycle.
    pub fn signal_count(&self) -> usize {
        self.spans.iter().map(|s| s.signals.len()).sum()
    }

    /// Returns the total number of bytes read per cycle.
    pub fn byte_count(&self) -> u32 {
        self.spans.iter().map(|s| s.len).sum()
    }
}
