//! Axis-aligned boxes and spheres used for proximity tests

use serde::{Deserialize, Serialize};

use crate::util::vec3::Vec3;

/// Axis-aligned bounding box
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Aabb {
    #[inline]
    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self {
            min: min.min(max),
            max: min.max(max),
        }
    }

    /// Degenerate box containing a single point
    #[inline]
    pub fn from_point(p: Vec3) -> Self {
        Self { min: p, max: p }
    }

    /// Cube of half-extent `half` around `center`
    #[inline]
    pub fn from_center(center: Vec3, half: f64) -> Self {
        let h = Vec3::splat(half.abs());
        Self {
            min: center - h,
            max: center + h,
        }
    }

    #[inline]
    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    #[inline]
    pub fn extents(&self) -> Vec3 {
        self.max - self.min
    }

    /// Smallest box containing both
    #[inline]
    pub fn union(&self, other: &Aabb) -> Aabb {
        Aabb {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }

    /// Grow every face outward by `amount`
    #[inline]
    pub fn inflate(&self, amount: f64) -> Aabb {
        let d = Vec3::splat(amount);
        Aabb {
            min: self.min - d,
            max: self.max + d,
        }
    }

    /// Half the surface area. Cost metric for tree insertion.
    #[inline]
    pub fn perimeter(&self) -> f64 {
        let e = self.extents();
        e.x * e.y + e.y * e.z + e.z * e.x
    }

    #[inline]
    pub fn overlaps(&self, other: &Aabb) -> bool {
        self.min.x <= other.max.x
            && self.max.x >= other.min.x
            && self.min.y <= other.max.y
            && self.max.y >= other.min.y
            && self.min.z <= other.max.z
            && self.max.z >= other.min.z
    }

    #[inline]
    pub fn contains(&self, other: &Aabb) -> bool {
        self.min.x <= other.min.x
            && self.min.y <= other.min.y
            && self.min.z <= other.min.z
            && self.max.x >= other.max.x
            && self.max.y >= other.max.y
            && self.max.z >= other.max.z
    }

    /// Squared distance from `p` to the closest point of the box (0 inside)
    #[inline]
    pub fn distance_sq_to_point(&self, p: Vec3) -> f64 {
        p.distance_sq_to(p.clamp(self.min, self.max))
    }

    /// Bounding box of a set of boxes, `None` when empty
    pub fn enclosing<'a>(boxes: impl IntoIterator<Item = &'a Aabb>) -> Option<Aabb> {
        let mut iter = boxes.into_iter();
        let first = *iter.next()?;
        Some(iter.fold(first, |acc, b| acc.union(b)))
    }
}

/// Sphere used for observer proximity queries
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sphere {
    pub center: Vec3,
    pub radius: f64,
}

impl Sphere {
    #[inline]
    pub fn new(center: Vec3, radius: f64) -> Self {
        Self { center, radius }
    }

    /// True unless the box lies entirely outside the sphere
    #[inline]
    pub fn intersects(&self, aabb: &Aabb) -> bool {
        aabb.distance_sq_to_point(self.center) <= self.radius * self.radius
    }
}
