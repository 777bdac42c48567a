//! Point cloud operations backing the landmark map: voxel-grid decimation,
//! plane projection, occupancy queries, rigid transforms and PCD export.
//! All functions are pure, clouds are passed in and new clouds returned.

mod filter;
mod octree;
mod pcd;
mod voxel;

pub use filter::{project_to_plane, radius_outlier_removal, transform_cloud, transform_colored};
pub use octree::OccupancyOctree;
pub use pcd::save_pcd_ascii;
pub use voxel::voxel_downsample;

use nalgebra::Point3;

use common::frame::PointCloud;

/// Centroid of all points, `None` for an empty cloud.
pub fn centroid(cloud: &PointCloud) -> Option<Point3<f64>> {
    if cloud.is_empty() {
        return None;
    }
    let mut sum = nalgebra::Vector3::zeros();
    for p in &cloud.points {
        sum += p.position.coords.cast::<f64>();
    }
    Some(Point3::from(sum / cloud.len() as f64))
}
