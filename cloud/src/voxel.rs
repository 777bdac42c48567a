use std::collections::BTreeMap;

use nalgebra::Vector3;

use common::frame::{PointCloud, PointXyzRgba, Rgba};

#[derive(Default)]
struct VoxelAccumulator {
    position_sum: Vector3<f64>,
    color_sum: [u32; 4],
    count: u32,
}

/// Uniform-grid decimation with cubic cells of edge `leaf_size`: every
/// occupied voxel contributes one point at the centroid of its members,
/// positions and colors averaged. Output order follows the voxel grid, so
/// repeated calls on the same cloud are deterministic.
pub fn voxel_downsample(cloud: &PointCloud, leaf_size: f32) -> PointCloud {
    if cloud.is_empty() || leaf_size <= 0.0 {
        return cloud.clone();
    }

    let inv_leaf = 1.0 / leaf_size as f64;
    let mut voxels: BTreeMap<(i64, i64, i64), VoxelAccumulator> = BTreeMap::new();

    for p in &cloud.points {
        let pos = p.position.coords.cast::<f64>();
        let key = (
            (pos.x * inv_leaf).floor() as i64,
            (pos.y * inv_leaf).floor() as i64,
            (pos.z * inv_leaf).floor() as i64,
        );
        let acc = voxels.entry(key).or_default();
        acc.position_sum += pos;
        acc.color_sum[0] += p.color.r as u32;
        acc.color_sum[1] += p.color.g as u32;
        acc.color_sum[2] += p.color.b as u32;
        acc.color_sum[3] += p.color.a as u32;
        acc.count += 1;
    }

    voxels
        .values()
        .map(|acc| {
            let n = acc.count as f64;
            let mean = acc.position_sum / n;
            PointXyzRgba {
                position: mean.cast::<f32>().into(),
                color: Rgba::new(
                    (acc.color_sum[0] / acc.count) as u8,
                    (acc.color_sum[1] / acc.count) as u8,
                    (acc.color_sum[2] / acc.count) as u8,
                    (acc.color_sum[3] / acc.count) as u8,
                ),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;

    #[test]
    fn collapses_points_in_the_same_voxel() {
        let cloud: PointCloud = [
            PointXyzRgba::new(0.01, 0.01, 0.01),
            PointXyzRgba::new(0.03, 0.03, 0.03),
            PointXyzRgba::new(0.2, 0.2, 0.2),
        ]
        .into_iter()
        .collect();

        let filtered = voxel_downsample(&cloud, 0.05);
        assert_eq!(filtered.len(), 2);
        assert_relative_eq!(filtered.points[0].position.x, 0.02, epsilon = 1e-6);
    }

    #[test]
    fn keeps_separated_points() {
        let cloud: PointCloud = (0..10)
            .map(|i| PointXyzRgba::new(i as f32, 0.0, 0.0))
            .collect();
        assert_eq!(voxel_downsample(&cloud, 0.05).len(), 10);
    }

    #[test]
    fn averages_colors() {
        let mut cloud = PointCloud::new();
        for value in [0u8, 200u8] {
            cloud.push(PointXyzRgba {
                position: nalgebra::Point3::new(0.0, 0.0, 0.0),
                color: Rgba::new(value, value, value, 255),
            });
        }
        let filtered = voxel_downsample(&cloud, 0.1);
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered.points[0].color, Rgba::new(100, 100, 100, 255));
    }
}
