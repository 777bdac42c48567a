use std::collections::BTreeMap;
use std::fmt;

use nalgebra::{DMatrix, DVector, Vector2, Vector3, Vector6};

use common::geometry::{log_normal, OrientedPlane, Pose};

/// Variable key in the factor graph: `x_k` for 6-DoF sensor poses, `l_j`
/// for 3-DoF plane landmarks.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub enum Symbol {
    Pose(usize),
    Plane(usize),
}

impl Symbol {
    pub fn dim(&self) -> usize {
        match self {
            Symbol::Pose(_) => 6,
            Symbol::Plane(_) => 3,
        }
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Symbol::Pose(i) => write!(f, "x{i}"),
            Symbol::Plane(i) => write!(f, "l{i}"),
        }
    }
}

/// Typed variable assignment for the graph. Inserting a key twice is a
/// programmer error and panics.
#[derive(Clone, Default)]
pub struct Values {
    poses: BTreeMap<usize, Pose>,
    planes: BTreeMap<usize, OrientedPlane>,
}

impl Values {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.poses.is_empty() && self.planes.is_empty()
    }

    pub fn insert_pose(&mut self, index: usize, pose: Pose) {
        let previous = self.poses.insert(index, pose);
        assert!(previous.is_none(), "pose x{index} inserted twice");
    }

    pub fn insert_plane(&mut self, index: usize, plane: OrientedPlane) {
        let previous = self.planes.insert(index, plane);
        assert!(previous.is_none(), "plane l{index} inserted twice");
    }

    pub fn pose(&self, index: usize) -> Option<&Pose> {
        self.poses.get(&index)
    }

    pub fn plane(&self, index: usize) -> Option<&OrientedPlane> {
        self.planes.get(&index)
    }

    /// Moves all entries of `other` into `self`, panicking on key clashes.
    pub fn merge(&mut self, other: Values) {
        for (index, pose) in other.poses {
            self.insert_pose(index, pose);
        }
        for (index, plane) in other.planes {
            self.insert_plane(index, plane);
        }
    }

    /// All variables in the canonical linearization order: poses first,
    /// then planes, each ascending by index.
    pub fn ordering(&self) -> Vec<Symbol> {
        self.poses
            .keys()
            .map(|&i| Symbol::Pose(i))
            .chain(self.planes.keys().map(|&i| Symbol::Plane(i)))
            .collect()
    }

    pub fn dimension(&self) -> usize {
        self.poses.len() * 6 + self.planes.len() * 3
    }

    /// Retracts every variable by its block of `delta`, laid out according
    /// to `ordering`.
    pub fn retract_all(&self, ordering: &[Symbol], delta: &DVector<f64>) -> Values {
        let mut retracted = Values::new();
        let mut offset = 0;
        for symbol in ordering {
            match symbol {
                Symbol::Pose(i) => {
                    let xi = Vector6::from_iterator(delta.rows(offset, 6).iter().copied());
                    retracted.insert_pose(*i, self.expect_pose(*i).retract(&xi));
                }
                Symbol::Plane(i) => {
                    let xi = Vector3::from_iterator(delta.rows(offset, 3).iter().copied());
                    retracted.insert_plane(*i, self.expect_plane(*i).retract(&xi));
                }
            }
            offset += symbol.dim();
        }
        retracted
    }

    /// Lookup under the graph invariant that every variable a factor
    /// references is admitted to the values before the smoother touches
    /// the factor. A miss is a programmer error.
    fn expect_pose(&self, index: usize) -> &Pose {
        match self.poses.get(&index) {
            Some(pose) => pose,
            None => panic!("pose x{index} was never inserted"),
        }
    }

    /// See [`Values::expect_pose`].
    fn expect_plane(&self, index: usize) -> &OrientedPlane {
        match self.planes.get(&index) {
            Some(plane) => plane,
            None => panic!("plane l{index} was never inserted"),
        }
    }
}

/// The factor kinds the mapping engine emits. Errors are tangent-space
/// residuals, whitened by the per-dimension sigmas during linearization.
pub enum Factor {
    /// Anchors `x_key` at `pose`, sigmas `(tx, ty, tz, rx, ry, rz)`.
    PosePrior {
        key: usize,
        pose: Pose,
        sigmas: Vector6<f64>,
    },
    /// Odometry constraint `x_from -> x_to`.
    PoseBetween {
        from: usize,
        to: usize,
        relative: Pose,
        sigmas: Vector6<f64>,
    },
    /// A plane observed from a pose, measured in the sensor frame.
    PlaneObservation {
        pose: usize,
        plane: usize,
        measured: OrientedPlane,
        sigmas: Vector3<f64>,
    },
    /// Prior on a landmark's normal direction only.
    PlaneDirectionPrior {
        plane: usize,
        measured: OrientedPlane,
        sigmas: Vector2<f64>,
    },
}

impl Factor {
    pub fn keys(&self) -> Vec<Symbol> {
        match self {
            Factor::PosePrior { key, .. } => vec![Symbol::Pose(*key)],
            Factor::PoseBetween { from, to, .. } => vec![Symbol::Pose(*from), Symbol::Pose(*to)],
            Factor::PlaneObservation { pose, plane, .. } => {
                vec![Symbol::Pose(*pose), Symbol::Plane(*plane)]
            }
            Factor::PlaneDirectionPrior { plane, .. } => vec![Symbol::Plane(*plane)],
        }
    }

    pub fn dim(&self) -> usize {
        match self {
            Factor::PosePrior { .. } | Factor::PoseBetween { .. } => 6,
            Factor::PlaneObservation { .. } => 3,
            Factor::PlaneDirectionPrior { .. } => 2,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Factor::PosePrior { .. } => "PosePrior",
            Factor::PoseBetween { .. } => "PoseBetween",
            Factor::PlaneObservation { .. } => "PlaneObservation",
            Factor::PlaneDirectionPrior { .. } => "PlaneDirectionPrior",
        }
    }

    fn sigmas(&self) -> DVector<f64> {
        match self {
            Factor::PosePrior { sigmas, .. } | Factor::PoseBetween { sigmas, .. } => {
                DVector::from_iterator(6, sigmas.iter().copied())
            }
            Factor::PlaneObservation { sigmas, .. } => {
                DVector::from_iterator(3, sigmas.iter().copied())
            }
            Factor::PlaneDirectionPrior { sigmas, .. } => {
                DVector::from_iterator(2, sigmas.iter().copied())
            }
        }
    }

    /// Unwhitened tangent-space residual at `values`. The smoother
    /// guarantees every referenced variable is present.
    pub fn error(&self, values: &Values) -> DVector<f64> {
        match self {
            Factor::PosePrior { key, pose, .. } => {
                dvector(&pose.local_coordinates(values.expect_pose(*key)))
            }
            Factor::PoseBetween {
                from, to, relative, ..
            } => {
                let a = values.expect_pose(*from);
                let b = values.expect_pose(*to);
                dvector(&relative.local_coordinates(&(a.inverse() * *b)))
            }
            Factor::PlaneObservation {
                pose,
                plane,
                measured,
                ..
            } => {
                let x = values.expect_pose(*pose);
                let p = values.expect_plane(*plane);
                dvector(&measured.local_coordinates(&p.transform(x)))
            }
            Factor::PlaneDirectionPrior {
                plane, measured, ..
            } => {
                let p = values.expect_plane(*plane);
                dvector(&log_normal(measured.normal(), p.normal()))
            }
        }
    }

    /// Whitened Jacobian blocks (one per involved variable, in `keys()`
    /// order) and the whitened residual, both at `values`.
    pub fn linearize(&self, values: &Values) -> (Vec<DMatrix<f64>>, DVector<f64>) {
        let error = self.error(values);
        let jacobians = self
            .keys()
            .iter()
            .map(|&symbol| self.jacobian_for(values, symbol))
            .collect::<Vec<_>>();

        // whiten rows by 1/sigma
        let sigmas = self.sigmas();
        let mut error = error;
        let mut jacobians = jacobians;
        for r in 0..self.dim() {
            let w = 1.0 / sigmas[r];
            error[r] *= w;
            for j in &mut jacobians {
                for c in 0..j.ncols() {
                    j[(r, c)] *= w;
                }
            }
        }
        (jacobians, error)
    }

    /// Central-difference Jacobian with respect to one variable, taken
    /// through the variable's retraction.
    fn jacobian_for(&self, values: &Values, symbol: Symbol) -> DMatrix<f64> {
        const STEP: f64 = 1e-6;
        let dim = symbol.dim();
        let mut jacobian = DMatrix::zeros(self.dim(), dim);
        for k in 0..dim {
            let plus = self.error(&perturbed(values, symbol, k, STEP));
            let minus = self.error(&perturbed(values, symbol, k, -STEP));
            jacobian.set_column(k, &((plus - minus) / (2.0 * STEP)));
        }
        jacobian
    }
}

fn perturbed(values: &Values, symbol: Symbol, component: usize, step: f64) -> Values {
    let mut perturbed = values.clone();
    match symbol {
        Symbol::Pose(i) => {
            let mut xi = Vector6::zeros();
            xi[component] = step;
            let pose = values.expect_pose(i).retract(&xi);
            perturbed.poses.insert(i, pose);
        }
        Symbol::Plane(i) => {
            let mut xi = Vector3::zeros();
            xi[component] = step;
            let plane = values.expect_plane(i).retract(&xi);
            perturbed.planes.insert(i, plane);
        }
    }
    perturbed
}

fn dvector<const N: usize>(v: &nalgebra::SVector<f64, N>) -> DVector<f64> {
    DVector::from_iterator(N, v.iter().copied())
}
