use nalgebra::Vector4;

use common::frame::{PlaneObservation, PointCloud};
use common::geometry::{local_frame, OrientedPlane, Pose};
use cloud::{project_to_plane, transform_cloud, OccupancyOctree};

use crate::landmark::LandmarkStore;

/// A match between an observation index and a landmark index. A landmark
/// may appear in several pairs within one frame; co-planar duplicates are
/// collapsed later by map refinement.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PlanePair {
    pub observation: usize,
    pub landmark: usize,
}

pub struct MatchParameters {
    /// Maximum normal misalignment in radians.
    pub direction_threshold: f64,
    /// Maximum parallel offset in meters.
    pub distance_threshold: f64,
    pub check_overlap: bool,
    pub overlap_alpha: f64,
    pub leaf_size: f32,
}

/// Associates each observation with at most one existing landmark.
///
/// Both planes are compared in the local frame of the observation (z-axis
/// along its normal, origin at its centroid), which turns the comparison
/// into a scalar angle and offset check. Among gated candidates the one
/// with the largest inlier cloud wins; equal counts keep the lowest
/// landmark index. When enabled, a candidate must also pass the cloud
/// overlap test before it can displace the current best.
pub fn match_planes(
    predicted_observations: &[OrientedPlane],
    landmarks: &LandmarkStore,
    observations: &[PlaneObservation],
    pose: &Pose,
    parameters: &MatchParameters,
) -> Vec<PlanePair> {
    let mut pairs = Vec::new();

    for (i, observed) in observations.iter().enumerate() {
        let obs_plane = OrientedPlane::from_coefficients(&observed.coefficients);
        let local = local_frame(obs_plane.normal(), &observed.centroid);
        let local_obs = obs_plane.transform(&local);

        let mut best = None;
        let mut max_size = 0usize;
        for (l, predicted) in predicted_observations.iter().enumerate() {
            let Some(lm) = landmarks.get(l) else {
                continue;
            };
            if !lm.valid {
                continue;
            }

            let local_lm = predicted.transform(&local);
            let dr = local_obs
                .normal()
                .dot(local_lm.normal())
                .clamp(-1.0, 1.0)
                .acos();
            let dd = (local_obs.distance() - local_lm.distance()).abs();

            if dr.abs() < parameters.direction_threshold && dd < parameters.distance_threshold {
                if lm.cloud.len() > max_size {
                    if parameters.check_overlap
                        && !check_overlap(&lm.cloud, &lm.coefficients, &observed.cloud, pose, parameters)
                    {
                        continue;
                    }
                    best = Some(l);
                    max_size = lm.cloud.len();
                }
            }
        }

        if let Some(landmark) = best {
            pairs.push(PlanePair {
                observation: i,
                landmark,
            });
        }
    }

    pairs
}

/// Voxel-occupancy overlap between an observation and a landmark: the
/// observation cloud is moved into the map frame, projected onto the
/// landmark plane, and the fraction of its points that land in occupied
/// landmark voxels must reach `overlap_alpha`.
fn check_overlap(
    landmark_cloud: &PointCloud,
    landmark_coefficients: &Vector4<f64>,
    observation_cloud: &PointCloud,
    pose: &Pose,
    parameters: &MatchParameters,
) -> bool {
    if landmark_cloud.is_empty() || observation_cloud.is_empty() {
        return false;
    }

    let transformed = transform_cloud(observation_cloud, &pose.matrix());
    let projected = project_to_plane(&transformed, landmark_coefficients);

    let octree = OccupancyOctree::build(landmark_cloud, parameters.leaf_size);
    let collision = projected
        .points
        .iter()
        .filter(|p| octree.is_occupied(&p.position))
        .count();

    tracing::debug!(collision, total = projected.len(), "overlap check");
    collision as f64 / projected.len() as f64 >= parameters.overlap_alpha
}
