//! Consolidated per-cycle view of every decoded signal.
//!
//! A [`Snapshot`] is built completely by the polling engine before any
//! consumer sees it and is immutable afterwards. Cloning a snapshot shares the
//! underlying map.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::NaiveDateTime;
use parking_lot::Mutex;
use serde::ser::{SerializeMap, SerializeStruct};
use serde::{Serialize, Serializer};

use crate::address::SignalId;
use crate::clock::format_timestamp;

/// Decoded value of one signal.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SignalValue {
    /// Boolean signal.
    Bool(bool),
    /// Raw byte 0..255.
    Byte(u8),
    /// 32-bit float.
    Float(f32),
}

impl SignalValue {
    /// Returns the value as a boolean. Bytes and floats are true when non-zero.
    pub fn as_bool(&self) -> bool {
        match *self {
            Self::Bool(v) => v,
            Self::Byte(v) => v != 0,
            Self::Float(v) => v != 0.0,
        }
    }

    /// Returns the value as an integer. Floats are truncated.
    pub fn as_i64(&self) -> i64 {
        match *self {
            Self::Bool(v) => i64::from(v),
            Self::Byte(v) => i64::from(v),
            Self::Float(v) => v as i64,
        }
    }

    /// Returns the raw byte, if this is a byte signal.
    pub fn as_byte(&self) -> Option<u8> {
        match *self {
            Self::Byte(v) => Some(v),
            _ => None,
        }
    }

    /// Returns the float, if this is a float signal.
    pub fn as_f32(&self) -> Option<f32> {
        match *self {
            Self::Float(v) => Some(v),
            _ => None,
        }
    }
}

impl fmt::Display for SignalValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(v) => write!(f, "{}", v),
            Self::Byte(v) => write!(f, "{}", v),
            Self::Float(v) => write!(f, "{:.3}", v),
        }
    }
}

impl Serialize for SignalValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match *self {
            Self::Bool(v) => serializer.serialize_bool(v),
            Self::Byte(v) => serializer.serialize_u8(v),
            Self::Float(v) => serializer.serialize_f32(v),
        }
    }
}

/// Every signal value decoded in one poll cycle.
///
/// # Example
///
/// ```
/// use std::collections::BTreeMap;
/// use plcwatch::{SignalId, SignalValue, Snapshot};
///
/// let mut values = BTreeMap::new();
/// values.insert(SignalId::bit(600, 0).unwrap(), SignalValue::Bool(true));
/// values.insert(SignalId::byte(1003), SignalValue::Byte(1));
///
/// let snapshot = Snapshot::new(1, chrono::NaiveDateTime::default(), values);
/// assert_eq!(snapshot.bit(&SignalId::bit(600, 0).unwrap()), Some(true));
/// assert_eq!(snapshot.byte(&SignalId::byte(1003)), Some(1));
/// assert_eq!(snapshot.float(&SignalId::float(1200)), None);
/// ```
#[derive(Debug, Clone)]
pub struct Snapshot {
    cycle: u64,
    taken_at: NaiveDateTime,
    values: Arc<BTreeMap<SignalId, SignalValue>>,
}

impl Snapshot {
    /// Creates a snapshot from a fully decoded value map.
    pub fn new(cycle: u64, taken_at: NaiveDateTime, values: BTreeMap<SignalId, SignalValue>) -> Self {
        Self {
            cycle,
            taken_at,
            values: Arc::new(values),
        }
    }

    /// Returns the poll cycle number (1-based).
    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    /// Returns when the cycle's reads completed.
    pub fn taken_at(&self) -> NaiveDateTime {
        self.taken_at
    }

    /// Returns the value of `id`, if it was polled.
    pub fn get(&self, id: &SignalId) -> Option<SignalValue> {
        self.values.get(id).copied()
    }

    /// Returns `id` as a boolean.
    pub fn bit(&self, id: &SignalId) -> Option<bool> {
        self.get(id).map(|v| v.as_bool())
    }

    /// Returns `id` as a raw byte.
    pub fn byte(&self, id: &SignalId) -> Option<u8> {
        self.get(id).and_then(|v| v.as_byte())
    }

    /// Returns `id` as a float.
    pub fn float(&self, id: &SignalId) -> Option<f32> {
        self.get(id).and_then(|v| v.as_f32())
    }

    /// Iterates values in memory order.
    pub fn iter(&self) -> impl Iterator<Item = (&SignalId, &SignalValue)> {
        self.values.iter()
    }

    /// Returns the number of signals.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns whether the snapshot holds no signals.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

struct ValueMap<'a>(&'a BTreeMap<SignalId, SignalValue>);

impl Serialize for ValueMap<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (id, value) in self.0 {
            map.serialize_entry(&id.to_string(), value)?;
        }
        map.end()
    }
}

impl Serialize for Snapshot {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("Snapshot", 3)?;
        state.serialize_field("cycle", &self.cycle)?;
        state.serialize_field("taken_at", &format_timestamp(self.taken_at))?;
        state.serialize_field("values", &ValueMap(&self.values))?;
        state.end()
    }
}

/// Receives every snapshot, once per poll cycle, in cycle order.
///
/// Called on the polling thread. Implementations must not block for longer
/// than a bounded storage write.
pub trait SnapshotConsumer: Send {
    /// Processes one snapshot.
    fn on_snapshot(&mut self, snapshot: &Snapshot);

    /// Name used in log output.
    fn name(&self) -> &str {
        "consumer"
    }
}

/// Shared consumers stay reachable from operator commands while the engine
/// drives them.
impl<T: SnapshotConsumer> SnapshotConsumer for Arc<Mutex<T>> {
    fn on_snapshot(&mut self, snapshot: &Snapshot) {
        self.lock().on_snapshot(snapshot);
    }

    fn name(&self) -> &str {
        "shared consumer"
    }
}

/// Adapts a closure into a consumer.
///
/// # Example
///
/// ```
/// use plcwatch::{FnConsumer, Snapshot, SnapshotConsumer};
///
/// let mut seen = 0;
/// {
///     let mut consumer = FnConsumer::new("counter", |_: &Snapshot| seen += 1);
///     consumer.on_snapshot(&Snapshot::new(1, Default::default(), Default::default()));
/// }
/// assert_eq!(seen, 1);
/// ```
pub struct FnConsumer<F> {
    name: String,
    f: F,
}

impl<F: FnMut(&Snapshot) + Send> FnConsumer<F> {
    /// Wraps `f` under `name`.
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

impl<F: FnMut(&Snapshot) + Send> SnapshotConsumer for FnConsumer<F> {
    fn on_snapshot(&mut self, snapshot: &Snapshot) {
        (self.f)(snapshot)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl<F> fmt::Debug for FnConsumer<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnConsumer").field("name", &self.name).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Snapshot {
        let mut values = BTreeMap::new();
        values.insert(SignalId::bit(750, 0).unwrap(), SignalValue::Bool(false));
        values.insert(SignalId::byte(1015), SignalValue::Byte(12));
        values.insert(SignalId::float(1200), SignalValue::Float(1.5));
        Snapshot::new(7, NaiveDateTime::default(), values)
    }

    #[test]
    fn test_value_conversions() {
        assert!(SignalValue::Byte(3).as_bool());
        assert!(!SignalValue::Float(0.0).as_bool());
        assert_eq!(SignalValue::Bool(true).as_i64(), 1);
        assert_eq!(SignalValue::Float(-2.7).as_i64(), -2);
        assert_eq!(SignalValue::Bool(true).as_byte(), None);
        assert_eq!(SignalValue::Float(1.25).to_string(), "1.250");
    }

    #[test]
    fn test_accessors() {
        let snap = sample();
        assert_eq!(snap.cycle(), 7);
        assert_eq!(snap.len(), 3);
        assert_eq!(snap.byte(&SignalId::byte(1015)), Some(12));
        assert_eq!(snap.bit(&SignalId::byte(1015)), Some(true));
        assert_eq!(snap.float(&SignalId::float(1200)), Some(1.5));
        assert_eq!(snap.get(&SignalId::byte(1)), None);
    }

    #[test]
    fn test_clone_shares_values() {
        let snap = sample();
        let other = snap.clone();
        assert!(Arc::ptr_eq(&snap.values, &other.values));
    }

    #[test]
    fn test_serialize() {
        let json = serde_json::to_value(sample()).unwrap();
        assert_eq!(json["cycle"], 7);
        assert_eq!(json["taken_at"], "1970-01-01T00:00:00");
        assert_eq!(json["values"]["V750.0"], false);
        assert_eq!(json["values"]["VB1015"], 12);
        assert_eq!(json["values"]["VD1200"], 1.5);
    }

    #[test]
    fn test_shared_consumer() {
        struct Count(u32);
        impl SnapshotConsumer for Count {
            fn on_snapshot(&mut self, _: &Snapshot) {
                self.0 += 1;
            }
        }
        let shared = Arc::new(Mutex::new(Count(0)));
        let mut driven = Arc::clone(&shared);
        driven.on_snapshot(&sample());
        driven.on_snapshot(&sample());
        assert_eq!(shared.lock().0, 2);
    }
}
