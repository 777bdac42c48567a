use std::ops::{Index, IndexMut};

use nalgebra::{Point3, Vector4};

use common::frame::{PointCloud, Rgba};

/// A plane registered in the global map. The color is fixed at creation and
/// applied to every inlier point; `valid` is cleared when the landmark is
/// merged away, the entry itself is never removed so indices stay aligned
/// with the smoother's plane variables.
pub struct PlaneLandmark {
    /// Current coefficients `(a, b, c, d)` in the map frame.
    pub coefficients: Vector4<f64>,
    pub color: Rgba,
    pub cloud: PointCloud,
    pub centroid: Point3<f64>,
    pub valid: bool,
}

/// Dense ordered landmark storage. The index of an entry equals the index
/// of its plane variable in the factor graph.
#[derive(Default)]
pub struct LandmarkStore {
    landmarks: Vec<PlaneLandmark>,
}

impl LandmarkStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, landmark: PlaneLandmark) {
        self.landmarks.push(landmark);
    }

    pub fn get(&self, index: usize) -> Option<&PlaneLandmark> {
        self.landmarks.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut PlaneLandmark> {
        self.landmarks.get_mut(index)
    }

    pub fn invalidate(&mut self, index: usize) {
        if let Some(lm) = self.landmarks.get_mut(index) {
            lm.valid = false;
        }
    }

    pub fn len(&self) -> usize {
        self.landmarks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.landmarks.is_empty()
    }

    pub fn clear(&mut self) {
        self.landmarks.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &PlaneLandmark> {
        self.landmarks.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut PlaneLandmark> {
        self.landmarks.iter_mut()
    }

    pub fn iter_valid(&self) -> impl Iterator<Item = (usize, &PlaneLandmark)> {
        self.landmarks
            .iter()
            .enumerate()
            .filter(|(_, lm)| lm.valid)
    }

    pub fn as_slice(&self) -> &[PlaneLandmark] {
        &self.landmarks
    }
}

/// Direct indexing is reserved for indices the engine allocated itself:
/// entries are never removed, so an out-of-range index is a programmer
/// error and panics like slice indexing does.
impl Index<usize> for LandmarkStore {
    type Output = PlaneLandmark;

    fn index(&self, index: usize) -> &PlaneLandmark {
        &self.landmarks[index]
    }
}

impl IndexMut<usize> for LandmarkStore {
    fn index_mut(&mut self, index: usize) -> &mut PlaneLandmark {
        &mut self.landmarks[index]
    }
}
