//! Rising/falling edge detection over one boolean signal.

/// Transition observed between two consecutive values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Edge {
    /// No change.
    None,
    /// false → true.
    Rising,
    /// true → false.
    Falling,
}

impl Edge {
    /// Returns whether this is a rising edge.
    pub fn is_rising(self) -> bool {
        self == Self::Rising
    }
}

/// Remembers the last observed value of one signal.
///
/// Each consumer owns its own tracker, even when several watch the same
/// physical signal.
///
/// # Example
///
/// ```
/// use plcwatch::{Edge, EdgeTracker};
///
/// let mut tracker = EdgeTracker::new();
/// assert_eq!(tracker.observe(false), Edge::None);
/// assert_eq!(tracker.observe(true), Edge::Rising);
/// assert_eq!(tracker.observe(true), Edge::None);
/// assert_eq!(tracker.observe(false), Edge::Falling);
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EdgeTracker {
    last: bool,
}

impl EdgeTracker {
    /// Creates a tracker whose last value is `false`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Compares `current` with the stored value, stores it, and reports the edge.
    pub fn observe(&mut self, current: bool) -> Edge {
        let edge = match (self.last, current) {
            (false, true) => Edge::Rising,
            (true, false) => Edge::Falling,
            _ => Edge::None,
        };
        self.last = current;
        edge
    }

    /// Returns the last observed value.
    pub fn last(&self) -> bool {
        self.last
    }
}
