//! Per-dimension half-open intervals used as box extents.

use std::fmt;

/// A half-open interval `[min, max)` along one dimension.
///
/// The undefined state (`min = +inf`, `max = -inf`) is distinct from a
/// zero-width interval and is the starting point for accumulating the tight
/// extent of a set of coordinates with [`BoxExtents::expand_to_contain`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoxExtents {
    min: f64,
    max: f64,
}

impl Default for BoxExtents {
    fn default() -> Self {
        Self::undefined()
    }
}

impl fmt::Display for BoxExtents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_undefined() {
            write!(f, "[undefined)")
        } else {
            write!(f, "[{}, {})", self.min, self.max)
        }
    }
}

impl BoxExtents {
    /// Creates the interval `[min, max)`. Use [`BoxExtents::is_valid`] to check
    /// caller-supplied bounds.
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    /// The undefined extent, containing nothing.
    pub fn undefined() -> Self {
        Self {
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }

    #[inline]
    pub fn min(&self) -> f64 {
        self.min
    }

    #[inline]
    pub fn max(&self) -> f64 {
        self.max
    }

    pub fn is_undefined(&self) -> bool {
        self.min > self.max
    }

    /// Finite bounds with `min <= max`.
    pub fn is_valid(&self) -> bool {
        self.min.is_finite() && self.max.is_finite() && self.min <= self.max
    }

    /// Width of the interval; zero for the undefined extent.
    pub fn width(&self) -> f64 {
        if self.is_undefined() {
            0.0
        } else {
            self.max - self.min
        }
    }

    pub fn center(&self) -> f64 {
        (self.min + self.max) / 2.0
    }

    /// Half-open membership test.
    #[inline]
    pub fn contains(&self, x: f64) -> bool {
        self.min <= x && x < self.max
    }

    /// Grows the interval so that `x` lies within `[min, max]`.
    pub fn expand_to_contain(&mut self, x: f64) {
        if x < self.min {
            self.min = x;
        }
        if x > self.max {
            self.max = x;
        }
    }

    /// True if `[self.min, self.max)` and `[lo, hi)` share any point.
    #[inline]
    pub fn overlaps(&self, lo: f64, hi: f64) -> bool {
        self.min < hi && lo < self.max
    }

    /// True if the interval lies entirely inside `[lo, hi)`.
    #[inline]
    pub fn is_within(&self, lo: f64, hi: f64) -> bool {
        lo <= self.min && self.max <= hi
    }

    /// True if `x` is strictly below `min` or at/above `max`.
    #[inline]
    pub fn is_outside(&self, x: f64) -> bool {
        !self.contains(x)
    }

    /// The `i`-th of `n` cell boundaries. Boundaries `0` and `n` are exactly
    /// `min` and `max`, so adjacent cells share their boundary bit-for-bit.
    fn boundary(&self, i: usize, n: usize) -> f64 {
        if i == 0 {
            self.min
        } else if i >= n {
            self.max
        } else {
            self.min + (self.max - self.min) * (i as f64) / (n as f64)
        }
    }

    /// The `i`-th of `n` equal cells.
    pub fn cell(&self, i: usize, n: usize) -> BoxExtents {
        BoxExtents::new(self.boundary(i, n), self.boundary(i + 1, n))
    }

    /// Cell index of `x` among `n` equal cells, clamped to `[0, n - 1]`.
    ///
    /// The floor formula is corrected against the actual cell boundaries so
    /// that a coordinate always lands in the cell whose `[min, max)` holds it.
    pub fn cell_index(&self, x: f64, n: usize) -> usize {
        debug_assert!(n > 0, "cell count must be positive");
        let width = (self.max - self.min) / n as f64;
        let raw = if width > 0.0 {
            ((x - self.min) / width).floor()
        } else {
            0.0
        };
        let mut index = if raw.is_nan() || raw < 0.0 {
            0
        } else {
            (raw as usize).min(n - 1)
        };
        if index > 0 && x < self.boundary(index, n) {
            index -= 1;
        } else if index + 1 < n && x >= self.boundary(index + 1, n) {
            index += 1;
        }
        index
    }
}

/// True if every coordinate lies inside its dimension's extent.
pub(crate) fn contains_point<const ND: usize>(extents: &[BoxExtents; ND], coords: &[f64; ND]) -> bool {
    extents.iter().zip(coords.iter()).all(|(e, &x)| e.contains(x))
}

/// Product of the widths of all dimensions.
pub(crate) fn volume<const ND: usize>(extents: &[BoxExtents; ND]) -> f64 {
    extents.iter().map(BoxExtents::width).product()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_half_open_contains() {
        let e = BoxExtents::new(0.0, 10.0);
        assert!(e.contains(0.0));
        assert!(e.contains(9.999));
        assert!(!e.contains(10.0));
        assert!(!e.contains(-0.0001));
    }

    #[test]
    fn test_undefined_is_distinct_from_zero_width() {
        let undefined = BoxExtents::undefined();
        let zero = BoxExtents::new(3.0, 3.0);
        assert!(undefined.is_undefined());
        assert!(!zero.is_undefined());
        assert_eq!(undefined.width(), 0.0);
        assert_eq!(zero.width(), 0.0);
        assert!(!zero.contains(3.0));
    }

    #[test]
    fn test_expand_from_undefined() {
        let mut e = BoxExtents::undefined();
        e.expand_to_contain(4.0);
        assert_eq!((e.min(), e.max()), (4.0, 4.0));
        e.expand_to_contain(-1.0);
        e.expand_to_contain(2.0);
        assert_eq!((e.min(), e.max()), (-1.0, 4.0));
    }

    #[test]
    fn test_overlap_and_within() {
        let e = BoxExtents::new(2.0, 4.0);
        assert!(e.overlaps(3.0, 5.0));
        assert!(!e.overlaps(4.0, 5.0));
        assert!(!e.overlaps(0.0, 2.0));
        assert!(e.is_within(2.0, 4.0));
        assert!(!e.is_within(2.5, 4.0));
    }

    #[test]
    fn test_cells_tile_exactly() {
        let e = BoxExtents::new(-1.3, 7.9);
        for n in 1..12 {
            assert_eq!(e.cell(0, n).min(), e.min());
            assert_eq!(e.cell(n - 1, n).max(), e.max());
            for i in 1..n {
                assert_eq!(e.cell(i - 1, n).max(), e.cell(i, n).min());
            }
        }
    }

    #[test]
    fn test_cell_index_matches_cell_extents() {
        let e = BoxExtents::new(0.0, 1.0);
        let n = 10;
        for k in 0..1000 {
            let x = k as f64 / 1000.0;
            let i = e.cell_index(x, n);
            assert!(e.cell(i, n).contains(x), "x={} routed to cell {}", x, i);
        }
    }

    #[test]
    fn test_cell_index_on_boundary_is_upper_cell() {
        let e = BoxExtents::new(0.0, 10.0);
        assert_eq!(e.cell_index(5.0, 10), 5);
        assert_eq!(e.cell_index(0.0, 10), 0);
    }

    #[test]
    fn test_cell_index_clamps() {
        let e = BoxExtents::new(0.0, 10.0);
        assert_eq!(e.cell_index(-3.0, 4), 0);
        assert_eq!(e.cell_index(10.0, 4), 3);
        assert_eq!(e.cell_index(1e9, 4), 3);
    }

    #[test]
    fn test_volume() {
        let extents = [BoxExtents::new(0.0, 2.0), BoxExtents::new(1.0, 4.0)];
        assert_eq!(volume(&extents), 6.0);
        assert!(contains_point(&extents, &[1.0, 1.0]));
        assert!(!contains_point(&extents, &[2.0, 1.0]));
    }
}
