use std::f64::consts::PI;

use common::frame::PointCloud;
use common::geometry::{local_frame, OrientedPlane};
use cloud::{project_to_plane, radius_outlier_removal, voxel_downsample, OccupancyOctree};

use crate::landmark::{LandmarkStore, PlaneLandmark};

/// Overlap is declared once this many projected points hit occupied voxels.
const MERGE_COLLISION_COUNT: usize = 10;

/// Radius of the bad-inlier neighborhood test, in meters.
const BAD_INLIER_RADIUS: f32 = 0.1;

pub struct RefineParameters {
    /// Maximum normal misalignment in radians for two landmarks to be
    /// considered co-planar.
    pub direction_threshold: f64,
    /// Maximum parallel offset in meters.
    pub distance_threshold: f64,
    pub leaf_size: f32,
}

/// Detects co-planar landmark pairs and merges the smaller into the larger.
/// Comparison runs in the local frame of the first landmark of each ordered
/// pair, built from its smoothed plane estimate and stored centroid.
/// Returns whether any merge happened.
pub fn refine_planar_map(
    landmarks: &mut LandmarkStore,
    estimated_planes: &[OrientedPlane],
    parameters: &RefineParameters,
) -> bool {
    let mut found_coplanar = false;
    let count = landmarks.len();

    for i in 0..count.saturating_sub(1) {
        if !landmarks[i].valid {
            continue;
        }

        let plane_i = estimated_planes[i];
        let local = local_frame(plane_i.normal(), &landmarks[i].centroid);
        let local_i = plane_i.transform(&local);

        for j in (i + 1)..count {
            if !landmarks[j].valid {
                continue;
            }

            let local_j = estimated_planes[j].transform(&local);
            let dr = local_i
                .normal()
                .dot(local_j.normal())
                .clamp(-1.0, 1.0)
                .acos();
            let dd = (local_i.distance() - local_j.distance()).abs();
            if dr.abs() >= parameters.direction_threshold || dd >= parameters.distance_threshold {
                continue;
            }

            // merge the smaller cloud into the larger one
            let (larger, smaller) = if landmarks[i].cloud.len() < landmarks[j].cloud.len() {
                (j, i)
            } else {
                (i, j)
            };

            let overlap = check_landmarks_overlap(
                &landmarks[larger],
                &landmarks[smaller],
                parameters.leaf_size,
            );
            if !overlap {
                continue;
            }

            let merged = merged_cloud(&landmarks[larger], &landmarks[smaller], parameters.leaf_size);
            landmarks[larger].cloud = merged;
            landmarks.invalidate(smaller);
            found_coplanar = true;
            tracing::debug!(from = smaller, to = larger, "merged co-planar landmarks");

            if smaller == i {
                // the local frame's owner is gone, move on to the next one
                break;
            }
        }
    }

    found_coplanar
}

/// Occupancy overlap between two landmarks: the smaller's inliers are
/// projected onto the larger's plane and checked against an octree over the
/// larger's cloud. Short-circuits once enough collisions are seen.
fn check_landmarks_overlap(larger: &PlaneLandmark, smaller: &PlaneLandmark, leaf_size: f32) -> bool {
    let projected = project_to_plane(&smaller.cloud, &larger.coefficients);
    let octree = OccupancyOctree::build(&larger.cloud, leaf_size);

    let mut collision = 0;
    for p in &projected.points {
        if octree.is_occupied(&p.position) {
            collision += 1;
            if collision >= MERGE_COLLISION_COUNT {
                return true;
            }
        }
    }
    false
}

fn merged_cloud(larger: &PlaneLandmark, smaller: &PlaneLandmark, leaf_size: f32) -> PointCloud {
    let mut cloud = project_to_plane(&smaller.cloud, &larger.coefficients);
    cloud.append(&larger.cloud);
    voxel_downsample(&cloud, leaf_size)
}

/// Radius outlier removal over every valid landmark cloud. The neighbor
/// count threshold scales with the expected planar point density at the
/// voxel leaf size.
pub fn remove_bad_inliers(landmarks: &mut LandmarkStore, leaf_size: f32, bad_inlier_alpha: f64) {
    let radius = BAD_INLIER_RADIUS;
    let min_neighbors = (PI * radius as f64 * radius as f64 / (leaf_size as f64 * leaf_size as f64)
        * bad_inlier_alpha) as usize;
    tracing::debug!(radius, min_neighbors, "removing bad inliers");

    for lm in landmarks.iter_mut() {
        if !lm.valid {
            continue;
        }
        lm.cloud = radius_outlier_removal(&lm.cloud, radius, min_neighbors);
    }
}
