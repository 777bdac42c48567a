use kd_tree::KdMap;
use nalgebra::{Matrix4, Vector4};

use common::frame::{PointCloud, PointXyzRgba, Rgba};

/// Orthogonal projection of every point onto the plane `(a, b, c, d)`,
/// `a*x + b*y + c*z + d = 0`. Colors are preserved.
pub fn project_to_plane(cloud: &PointCloud, coefficients: &Vector4<f64>) -> PointCloud {
    let normal = coefficients.fixed_rows::<3>(0).into_owned();
    let norm_sq = normal.norm_squared();
    if norm_sq < 1e-12 {
        return cloud.clone();
    }

    cloud
        .points
        .iter()
        .map(|p| {
            let pos = p.position.coords.cast::<f64>();
            let signed = (normal.dot(&pos) + coefficients[3]) / norm_sq;
            PointXyzRgba {
                position: (pos - normal * signed).cast::<f32>().into(),
                color: p.color,
            }
        })
        .collect()
}

/// Applies a rigid transform, keeping per-point colors.
pub fn transform_cloud(cloud: &PointCloud, transform: &Matrix4<f64>) -> PointCloud {
    cloud
        .points
        .iter()
        .map(|p| PointXyzRgba {
            position: apply(transform, p),
            color: p.color,
        })
        .collect()
}

/// Applies a rigid transform and assigns the same color to every point.
pub fn transform_colored(cloud: &PointCloud, transform: &Matrix4<f64>, color: Rgba) -> PointCloud {
    cloud
        .points
        .iter()
        .map(|p| PointXyzRgba {
            position: apply(transform, p),
            color,
        })
        .collect()
}

fn apply(transform: &Matrix4<f64>, p: &PointXyzRgba) -> nalgebra::Point3<f32> {
    let pos = p.position.coords.cast::<f64>();
    let transformed = transform.fixed_view::<3, 3>(0, 0) * pos + transform.fixed_view::<3, 1>(0, 3);
    transformed.cast::<f32>().into()
}

/// Keeps only points with at least `min_neighbors` other points within
/// `radius`.
pub fn radius_outlier_removal(cloud: &PointCloud, radius: f32, min_neighbors: usize) -> PointCloud {
    if cloud.is_empty() || min_neighbors == 0 {
        return cloud.clone();
    }

    let items: Vec<([f32; 3], usize)> = cloud
        .points
        .iter()
        .enumerate()
        .map(|(i, p)| ([p.position.x, p.position.y, p.position.z], i))
        .collect();
    let tree: KdMap<[f32; 3], usize> = KdMap::build_by_ordered_float(items);

    cloud
        .points
        .iter()
        .enumerate()
        .filter(|(i, p)| {
            let query = [p.position.x, p.position.y, p.position.z];
            let neighbors = tree
                .within_radius(&query, radius)
                .iter()
                .filter(|item| item.1 != *i)
                .count();
            neighbors >= min_neighbors
        })
        .map(|(_, p)| *p)
        .collect()
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use nalgebra::Vector3;

    use common::geometry::Pose;

    use super::*;

    #[test]
    fn projected_points_satisfy_plane_equation() {
        let cloud: PointCloud = [
            PointXyzRgba::new(0.1, 0.2, 3.0),
            PointXyzRgba::new(-1.0, 0.5, -2.0),
        ]
        .into_iter()
        .collect();

        let coefficients = Vector4::new(0.0, 0.0, 1.0, -1.0);
        let projected = project_to_plane(&cloud, &coefficients);
        for p in &projected.points {
            assert_relative_eq!(p.position.z, 1.0, epsilon = 1e-6);
        }
        // x and y are untouched by the projection onto z = 1
        assert_relative_eq!(projected.points[0].position.x, 0.1, epsilon = 1e-6);
    }

    #[test]
    fn transform_translates_and_recolors() {
        let cloud: PointCloud = [PointXyzRgba::new(1.0, 0.0, 0.0)].into_iter().collect();
        let pose = Pose::new(
            Vector3::new(0.0, 0.0, 2.0),
            nalgebra::UnitQuaternion::identity(),
        );
        let color = Rgba::new(10, 20, 30, 255);

        let transformed = transform_colored(&cloud, &pose.matrix(), color);
        assert_relative_eq!(transformed.points[0].position.z, 2.0, epsilon = 1e-6);
        assert_eq!(transformed.points[0].color, color);
    }

    #[test]
    fn removes_isolated_points() {
        let mut cloud = PointCloud::new();
        for i in 0..20 {
            cloud.push(PointXyzRgba::new(i as f32 * 0.01, 0.0, 0.0));
        }
        cloud.push(PointXyzRgba::new(10.0, 10.0, 10.0));

        let filtered = radius_outlier_removal(&cloud, 0.1, 3);
        assert_eq!(filtered.len(), 20);
        assert!(filtered
            .points
            .iter()
            .all(|p| p.position.x < 1.0 && p.position.y < 1.0));
    }
}
