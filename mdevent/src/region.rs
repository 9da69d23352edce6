//! Region predicates used for masking and pruned leaf collection.

use crate::extents::BoxExtents;

/// How a box relates to a [`RegionPredicate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoxContact {
    /// The box shares no point with the region.
    Outside,
    /// The box is partially inside the region.
    Touching,
    /// The box lies entirely inside the region.
    Contained,
}

/// A half-space `normal · x >= offset`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Plane<const ND: usize> {
    pub normal: [f64; ND],
    pub offset: f64,
}

impl<const ND: usize> Plane<ND> {
    pub fn new(normal: [f64; ND], offset: f64) -> Self {
        Self { normal, offset }
    }

    fn dot(&self, coords: &[f64; ND]) -> f64 {
        self.normal.iter().zip(coords.iter()).map(|(n, x)| n * x).sum()
    }

    pub fn is_inside(&self, coords: &[f64; ND]) -> bool {
        self.dot(coords) >= self.offset
    }

    /// Smallest and largest value of `normal · x` over the corners of a box.
    fn dot_range(&self, extents: &[BoxExtents; ND]) -> (f64, f64) {
        let mut lo = 0.0;
        let mut hi = 0.0;
        for (n, e) in self.normal.iter().zip(extents.iter()) {
            if *n >= 0.0 {
                lo += n * e.min();
                hi += n * e.max();
            } else {
                lo += n * e.max();
                hi += n * e.min();
            }
        }
        (lo, hi)
    }
}

/// An axis-aligned bounding region, optionally narrowed by half-space planes.
///
/// The bounds are used to prune whole subtrees; the planes refine the
/// classification of boxes that intersect the bounds.
#[derive(Debug, Clone, PartialEq)]
pub struct RegionPredicate<const ND: usize> {
    bounds: [BoxExtents; ND],
    planes: Vec<Plane<ND>>,
}

impl<const ND: usize> RegionPredicate<ND> {
    pub fn from_bounds(bounds: [BoxExtents; ND]) -> Self {
        Self {
            bounds,
            planes: Vec::new(),
        }
    }

    /// Builds the region `[min[d], max[d])` in every dimension.
    pub fn from_min_max(min: [f64; ND], max: [f64; ND]) -> Self {
        Self::from_bounds(std::array::from_fn(|d| BoxExtents::new(min[d], max[d])))
    }

    /// A region covering all of space.
    pub fn everything() -> Self {
        Self::from_bounds([BoxExtents::new(f64::NEG_INFINITY, f64::INFINITY); ND])
    }

    pub fn with_plane(mut self, plane: Plane<ND>) -> Self {
        self.planes.push(plane);
        self
    }

    pub fn bounds(&self) -> &[BoxExtents; ND] {
        &self.bounds
    }

    pub fn planes(&self) -> &[Plane<ND>] {
        &self.planes
    }

    /// True if the box shares any point with the bounding region.
    pub fn bounds_overlap(&self, extents: &[BoxExtents; ND]) -> bool {
        extents
            .iter()
            .zip(self.bounds.iter())
            .all(|(e, b)| e.overlaps(b.min(), b.max()))
    }

    pub fn contains_point(&self, coords: &[f64; ND]) -> bool {
        self.bounds
            .iter()
            .zip(coords.iter())
            .all(|(b, &x)| b.contains(x))
            && self.planes.iter().all(|p| p.is_inside(coords))
    }

    /// Classifies a box against the region.
    pub fn classify(&self, extents: &[BoxExtents; ND]) -> BoxContact {
        if !self.bounds_overlap(extents) {
            return BoxContact::Outside;
        }
        let mut contained = extents
            .iter()
            .zip(self.bounds.iter())
            .all(|(e, b)| e.is_within(b.min(), b.max()));

        for plane in &self.planes {
            let (lo, hi) = plane.dot_range(extents);
            if hi < plane.offset {
                return BoxContact::Outside;
            }
            if lo < plane.offset {
                contained = false;
            }
        }

        if contained {
            BoxContact::Contained
        } else {
            BoxContact::Touching
        }
    }
}
