//! The event value type stored in leaf boxes.

/// A single `ND`-dimensional data point with its signal and squared error.
///
/// Events are immutable once created; a stored event lives in exactly one leaf.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Event<const ND: usize> {
    coords: [f64; ND],
    signal: f64,
    error_squared: f64,
}

impl<const ND: usize> Event<ND> {
    /// Number of `f64` values an event occupies when flattened for paging.
    pub const RECORD_LEN: usize = ND + 2;

    pub fn new(coords: [f64; ND], signal: f64, error_squared: f64) -> Self {
        Self {
            coords,
            signal,
            error_squared,
        }
    }

    #[inline]
    pub fn coords(&self) -> &[f64; ND] {
        &self.coords
    }

    #[inline]
    pub fn coord(&self, dim: usize) -> f64 {
        self.coords[dim]
    }

    #[inline]
    pub fn signal(&self) -> f64 {
        self.signal
    }

    #[inline]
    pub fn error_squared(&self) -> f64 {
        self.error_squared
    }

    /// Appends the flattened record (`coords..., signal, error_squared`).
    pub(crate) fn write_record(&self, out: &mut Vec<f64>) {
        out.extend_from_slice(&self.coords);
        out.push(self.signal);
        out.push(self.error_squared);
    }

    /// Rebuilds an event from a record written by `write_record`.
    /// Returns `None` when the slice has the wrong length.
    pub(crate) fn from_record(record: &[f64]) -> Option<Self> {
        if record.len() != Self::RECORD_LEN {
            return None;
        }
        let mut coords = [0.0; ND];
        coords.copy_from_slice(&record[..ND]);
        Some(Self::new(coords, record[ND], record[ND + 1]))
    }

    /// Approximate in-memory footprint, used for cache accounting.
    #[inline]
    pub const fn size_in_bytes() -> usize {
        std::mem::size_of::<Self>()
    }
}

/// Flattens a slice of events into paging records.
pub(crate) fn flatten_events<const ND: usize>(events: &[Event<ND>]) -> Vec<f64> {
    let mut values = Vec::with_capacity(events.len() * Event::<ND>::RECORD_LEN);
    for event in events {
        event.write_record(&mut values);
    }
    values
}

/// Inverse of [`flatten_events`]. Returns `None` if the value count is not a
/// whole number of records.
pub(crate) fn unflatten_events<const ND: usize>(values: &[f64]) -> Option<Vec<Event<ND>>> {
    let len = Event::<ND>::RECORD_LEN;
    if values.len() % len != 0 {
        return None;
    }
    values.chunks_exact(len).map(Event::from_record).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_accessors() {
        let event = Event::new([1.0, 2.0, 3.0], 4.0, 0.25);
        assert_eq!(event.coords(), &[1.0, 2.0, 3.0]);
        assert_eq!(event.coord(1), 2.0);
        assert_eq!(event.signal(), 4.0);
        assert_eq!(event.error_squared(), 0.25);
    }

    #[test]
    fn test_flatten_and_unflatten() {
        let events = vec![Event::new([0.5, 1.5], 1.0, 1.0), Event::new([2.5, 3.5], 2.0, 4.0)];
        let values = flatten_events(&events);
        assert_eq!(values, vec![0.5, 1.5, 1.0, 1.0, 2.5, 3.5, 2.0, 4.0]);
        assert_eq!(unflatten_events::<2>(&values).unwrap(), events);
    }

    #[test]
    fn test_unflatten_rejects_partial_record() {
        assert!(unflatten_events::<2>(&[1.0, 2.0, 3.0]).is_none());
    }
}
