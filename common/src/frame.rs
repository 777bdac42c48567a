use nalgebra::{Point3, Vector3, Vector4};

use crate::geometry::Pose;

/// Per-point color, alpha 255 means opaque.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Rgba {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl Rgba {
    pub fn new(r: u8, g: u8, b: u8, a: u8) -> Self {
        Self { r, g, b, a }
    }
}

#[derive(Copy, Clone, Debug)]
pub struct PointXyzRgba {
    pub position: Point3<f32>,
    pub color: Rgba,
}

impl PointXyzRgba {
    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self {
            position: Point3::new(x, y, z),
            color: Rgba::default(),
        }
    }
}

/// A set of colored 3D points with value semantics. Landmarks own their
/// cloud, observations lend theirs read-only during a mapping call.
#[derive(Clone, Debug, Default)]
pub struct PointCloud {
    pub points: Vec<PointXyzRgba>,
}

impl PointCloud {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            points: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn push(&mut self, point: PointXyzRgba) {
        self.points.push(point);
    }

    /// Appends a copy of all points of `other`.
    pub fn append(&mut self, other: &PointCloud) {
        self.points.extend_from_slice(&other.points);
    }
}

impl FromIterator<PointXyzRgba> for PointCloud {
    fn from_iter<T: IntoIterator<Item = PointXyzRgba>>(iter: T) -> Self {
        Self {
            points: iter.into_iter().collect(),
        }
    }
}

/// A segmented planar patch reported by the front-end, in the sensor frame.
pub struct PlaneObservation {
    /// Plane coefficients `(a, b, c, d)` in the sensor frame.
    pub coefficients: Vector4<f64>,

    /// Noise sigmas for the minimal 3-DoF plane parameterization.
    pub sigmas: Vector3<f64>,

    /// Inlier points supporting the plane, in the sensor frame.
    pub cloud: PointCloud,

    /// Centroid of the inlier points.
    pub centroid: Point3<f64>,
}

/// One frame of input to the mapping engine: the front-end's pose estimate
/// in the map frame plus the planes segmented from the sensor data.
pub struct Frame {
    pub pose: Pose,
    pub observations: Vec<PlaneObservation>,
}
