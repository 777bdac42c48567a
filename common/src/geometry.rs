use std::ops::Mul;

use nalgebra::{
    Matrix4, Point3, Rotation3, UnitQuaternion, UnitVector3, Vector2, Vector3, Vector4, Vector6,
};

/// A rigid transform in SE(3), used both for sensor poses in the map frame
/// and for the local plane frames built during matching.
#[derive(Copy, Clone, Debug)]
pub struct Pose {
    pub translation: Vector3<f64>,
    pub rotation: UnitQuaternion<f64>,
}

impl Default for Pose {
    fn default() -> Self {
        Self::identity()
    }
}

impl Pose {
    pub fn identity() -> Self {
        Self {
            translation: Vector3::zeros(),
            rotation: UnitQuaternion::identity(),
        }
    }

    pub fn new(translation: Vector3<f64>, rotation: UnitQuaternion<f64>) -> Self {
        Self {
            translation,
            rotation,
        }
    }

    pub fn from_translation(x: f64, y: f64, z: f64) -> Self {
        Self {
            translation: Vector3::new(x, y, z),
            rotation: UnitQuaternion::identity(),
        }
    }

    /// Builds a pose from a 4x4 homogeneous matrix. The rotation block is
    /// assumed to be orthonormal.
    pub fn from_matrix(m: &Matrix4<f64>) -> Self {
        let r = Rotation3::from_matrix_unchecked(m.fixed_view::<3, 3>(0, 0).into_owned());
        Self {
            translation: Vector3::new(m[(0, 3)], m[(1, 3)], m[(2, 3)]),
            rotation: UnitQuaternion::from_rotation_matrix(&r),
        }
    }

    pub fn matrix(&self) -> Matrix4<f64> {
        let mut m = Matrix4::identity();
        m.fixed_view_mut::<3, 3>(0, 0)
            .copy_from(self.rotation.to_rotation_matrix().matrix());
        m.fixed_view_mut::<3, 1>(0, 3).copy_from(&self.translation);
        m
    }

    pub fn inverse(&self) -> Self {
        let inv_rot = self.rotation.inverse();
        Self {
            translation: -(inv_rot * self.translation),
            rotation: inv_rot,
        }
    }

    pub fn transform_point(&self, p: &Point3<f64>) -> Point3<f64> {
        self.rotation * p + self.translation
    }

    /// Tangent-space exponential, layout `(tx, ty, tz, rx, ry, rz)`.
    pub fn exp(xi: &Vector6<f64>) -> Self {
        Self {
            translation: xi.fixed_rows::<3>(0).into_owned(),
            rotation: UnitQuaternion::from_scaled_axis(xi.fixed_rows::<3>(3).into_owned()),
        }
    }

    pub fn log(&self) -> Vector6<f64> {
        let mut xi = Vector6::zeros();
        xi.fixed_rows_mut::<3>(0).copy_from(&self.translation);
        xi.fixed_rows_mut::<3>(3)
            .copy_from(&self.rotation.scaled_axis());
        xi
    }

    pub fn retract(&self, delta: &Vector6<f64>) -> Self {
        *self * Self::exp(delta)
    }

    /// The tangent vector that retracts `self` onto `other`.
    pub fn local_coordinates(&self, other: &Self) -> Vector6<f64> {
        (self.inverse() * *other).log()
    }
}

impl Mul for Pose {
    type Output = Pose;

    fn mul(self, rhs: Pose) -> Pose {
        Pose {
            translation: self.translation + self.rotation * rhs.translation,
            rotation: self.rotation * rhs.rotation,
        }
    }
}

/// Minimal 3-DoF parameterization of an infinite plane: a unit normal
/// direction and the signed distance from the origin. The derivable
/// coefficient vector `(a, b, c, d)` satisfies `a*x + b*y + c*z + d = 0`
/// with `a^2 + b^2 + c^2 = 1`.
#[derive(Copy, Clone, Debug)]
pub struct OrientedPlane {
    normal: UnitVector3<f64>,
    distance: f64,
}

impl Default for OrientedPlane {
    fn default() -> Self {
        Self {
            normal: UnitVector3::new_unchecked(Vector3::x()),
            distance: 0.0,
        }
    }
}

impl OrientedPlane {
    pub fn new(normal: UnitVector3<f64>, distance: f64) -> Self {
        Self { normal, distance }
    }

    /// Normalizes the first three coefficients and scales the distance
    /// accordingly.
    pub fn from_coefficients(coefficients: &Vector4<f64>) -> Self {
        let n = coefficients.fixed_rows::<3>(0).into_owned();
        let norm = n.norm();
        Self {
            normal: UnitVector3::new_unchecked(n / norm),
            distance: coefficients[3] / norm,
        }
    }

    pub fn coefficients(&self) -> Vector4<f64> {
        Vector4::new(
            self.normal.x,
            self.normal.y,
            self.normal.z,
            self.distance,
        )
    }

    pub fn normal(&self) -> &UnitVector3<f64> {
        &self.normal
    }

    pub fn distance(&self) -> f64 {
        self.distance
    }

    /// Expresses this plane in the frame of `pose`. For a point `p` in the
    /// new frame, `pose` maps it back into the frame the plane currently
    /// lives in, so `n' = R^T n` and `d' = n . t + d`.
    pub fn transform(&self, pose: &Pose) -> Self {
        let rotated = pose.rotation.inverse_transform_vector(&self.normal);
        Self {
            normal: UnitVector3::new_unchecked(rotated),
            distance: self.normal.dot(&pose.translation) + self.distance,
        }
    }

    /// Retraction on S^2 x R: the first two components move the normal along
    /// its tangent basis, the third is additive on the distance.
    pub fn retract(&self, delta: &Vector3<f64>) -> Self {
        let (b1, b2) = tangent_basis(&self.normal);
        let step = b1 * delta[0] + b2 * delta[1];
        let theta = step.norm();
        let normal = if theta < 1e-12 {
            self.normal
        } else {
            UnitVector3::new_normalize(
                self.normal.into_inner() * theta.cos() + step * (theta.sin() / theta),
            )
        };
        Self {
            normal,
            distance: self.distance + delta[2],
        }
    }

    pub fn local_coordinates(&self, other: &Self) -> Vector3<f64> {
        let n = log_normal(&self.normal, &other.normal);
        Vector3::new(n[0], n[1], other.distance - self.distance)
    }
}

/// An orthonormal basis of the tangent plane of the unit sphere at `n`.
pub fn tangent_basis(n: &UnitVector3<f64>) -> (Vector3<f64>, Vector3<f64>) {
    // pick the axis furthest from the normal to stay well conditioned
    let axis = if n.x.abs() > n.z.abs() {
        Vector3::z()
    } else {
        Vector3::x()
    };
    let b1 = n.cross(&axis).normalize();
    let b2 = n.cross(&b1);
    (b1, b2)
}

/// Logarithm on S^2 expressed in the tangent basis of `base`.
pub fn log_normal(base: &UnitVector3<f64>, other: &UnitVector3<f64>) -> Vector2<f64> {
    let (b1, b2) = tangent_basis(base);
    let cos = base.dot(other).clamp(-1.0, 1.0);
    let theta = cos.acos();
    let projected = Vector2::new(b1.dot(other), b2.dot(other));
    let norm = projected.norm();
    if norm < 1e-12 {
        if cos > 0.0 {
            Vector2::zeros()
        } else {
            // antipodal, direction is arbitrary
            Vector2::new(theta, 0.0)
        }
    } else {
        projected * (theta / norm)
    }
}

/// The local SE(3) frame of a plane observation: z-axis along `normal`,
/// origin at `point`. Transforming a plane into this frame reduces
/// plane-to-plane comparison to a scalar angle and offset check.
pub fn local_frame(normal: &UnitVector3<f64>, point: &Point3<f64>) -> Pose {
    let (b1, b2) = tangent_basis(normal);
    let rot = Rotation3::from_basis_unchecked(&[b1, b2, normal.into_inner()]);
    Pose {
        translation: point.coords,
        rotation: UnitQuaternion::from_rotation_matrix(&rot),
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use std::f64::consts::FRAC_PI_4;

    use super::*;

    fn example_pose() -> Pose {
        Pose::new(
            Vector3::new(0.3, -1.2, 0.8),
            UnitQuaternion::from_euler_angles(0.1, -0.4, FRAC_PI_4),
        )
    }

    #[test]
    fn pose_matrix_round_trip() {
        let pose = example_pose();
        let back = Pose::from_matrix(&pose.matrix());
        assert_relative_eq!(back.translation, pose.translation, epsilon = 1e-12);
        assert_relative_eq!(back.rotation.angle_to(&pose.rotation), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn pose_inverse_composes_to_identity() {
        let pose = example_pose();
        let id = pose * pose.inverse();
        assert_relative_eq!(id.translation.norm(), 0.0, epsilon = 1e-12);
        assert_relative_eq!(id.rotation.angle(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn point_transform_agrees_with_the_matrix_form() {
        let pose = example_pose();
        let p = Point3::new(0.4, -0.7, 1.9);
        let direct = pose.transform_point(&p);
        let homogeneous = pose.matrix() * p.coords.push(1.0);
        assert_relative_eq!(direct.coords, homogeneous.fixed_rows::<3>(0).into_owned(),
            epsilon = 1e-12);
    }

    #[test]
    fn pose_exp_log_round_trip() {
        let xi = Vector6::new(0.1, -0.2, 0.3, 0.05, -0.02, 0.2);
        assert_relative_eq!(Pose::exp(&xi).log(), xi, epsilon = 1e-12);
    }

    #[test]
    fn plane_transform_round_trip() {
        let plane = OrientedPlane::from_coefficients(&Vector4::new(0.2, -0.5, 0.84, -1.3));
        let pose = example_pose();
        let back = plane.transform(&pose).transform(&pose.inverse());
        let angle = plane.normal().dot(back.normal()).clamp(-1.0, 1.0).acos();
        assert_relative_eq!(angle, 0.0, epsilon = 1e-6);
        assert_relative_eq!(back.distance(), plane.distance(), epsilon = 1e-6);
    }

    #[test]
    fn plane_retract_local_round_trip() {
        let plane = OrientedPlane::from_coefficients(&Vector4::new(0.0, 0.0, 1.0, -1.0));
        let delta = Vector3::new(0.05, -0.1, 0.2);
        let moved = plane.retract(&delta);
        assert_relative_eq!(plane.local_coordinates(&moved), delta, epsilon = 1e-9);
    }

    #[test]
    fn local_frame_reduces_own_plane() {
        // a plane expressed in its own local frame is z = 0
        let plane = OrientedPlane::from_coefficients(&Vector4::new(0.0, 1.0, 0.0, -2.0));
        let centroid = Point3::new(0.7, 2.0, -0.3);
        let local = local_frame(plane.normal(), &centroid);
        let reduced = plane.transform(&local);
        assert_relative_eq!(reduced.normal().z, 1.0, epsilon = 1e-12);
        assert_relative_eq!(reduced.distance(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn known_plane_into_sensor_frame() {
        // sensor translated along +x sees the z = 1 plane unchanged
        let plane = OrientedPlane::from_coefficients(&Vector4::new(0.0, 0.0, 1.0, -1.0));
        let pose = Pose::from_translation(0.1, 0.0, 0.0);
        let seen = plane.transform(&pose);
        assert_relative_eq!(seen.coefficients(), plane.coefficients(), epsilon = 1e-12);

        // translating the sensor up by 0.5 halves the offset
        let pose = Pose::from_translation(0.0, 0.0, 0.5);
        let seen = plane.transform(&pose);
        assert_relative_eq!(seen.distance(), -0.5, epsilon = 1e-12);
    }
}
