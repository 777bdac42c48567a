use std::path::Path;

use nalgebra::{Point3, Vector2, Vector6};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use thiserror::Error;

use common::frame::{Frame, PlaneObservation, PointCloud, Rgba};
use common::geometry::{OrientedPlane, Pose};
use cloud::{project_to_plane, save_pcd_ascii, transform_colored, voxel_downsample};

use crate::config::MappingConfig;
use crate::factor::{Factor, Values};
use crate::landmark::{LandmarkStore, PlaneLandmark};
use crate::matching::{match_planes, MatchParameters, PlanePair};
use crate::refine::{refine_planar_map, remove_bad_inliers, RefineParameters};
use crate::smoother::{
    Factorization, IncrementalSmoother, SmootherError, SmootherParameters,
};

/// Fixed seed for landmark colors, maps stay reproducible across runs.
const COLOR_SEED: u64 = 12345;

/// Prior sigmas anchoring the first pose, `(tx, ty, tz, rx, ry, rz)`.
const POSE_PRIOR_SIGMAS: [f64; 6] = [0.001, 0.001, 0.001, 0.0001, 0.001, 0.001];

/// Odometry noise, constant on all six dimensions.
const ODOMETRY_SIGMA: f64 = 0.05;

#[derive(Debug, Error)]
pub enum MapperError {
    #[error("graph is empty")]
    EmptyGraph,
    #[error("map is empty")]
    EmptyMap,
    #[error("optimizer diverged: {0}")]
    Diverged(#[from] SmootherError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Receives read-only snapshots of the optimized trajectory and the
/// landmark map after every successful update. Observers never feed back
/// into the engine.
pub trait MapObserver {
    fn on_map_updated(&mut self, poses: &[Pose], landmarks: &[PlaneLandmark]);
}

/// The mapping engine. Feeds frames into the factor graph, associates
/// plane observations with landmarks, and keeps the landmark clouds and
/// the optimized trajectory up to date.
///
/// `mapping` is the only mutator of graph state; commands are expected to
/// run between mapping calls, never concurrently with one.
pub struct Mapper {
    config: MappingConfig,
    // angular thresholds converted to radians when the config is applied
    keyframe_angular_threshold: f64,
    plane_match_direction_threshold: f64,
    planar_merge_direction_threshold: f64,

    smoother: IncrementalSmoother,
    pending_factors: Vec<Factor>,
    pending_values: Values,

    pose_count: usize,
    landmark_max_count: usize,
    landmarks: LandmarkStore,
    estimated_poses: Vec<Pose>,
    estimated_planes: Vec<OrientedPlane>,
    last_estimated_pose: Pose,

    rng: StdRng,
    observer: Option<Box<dyn MapObserver>>,
}

impl Mapper {
    pub fn new(config: MappingConfig) -> Self {
        let smoother = IncrementalSmoother::new(SmootherParameters {
            relinearize_threshold: config.smoother_relinearize_threshold,
            relinearize_skip: config.smoother_relinearize_skip,
            factorization: Factorization::Qr,
        });

        let mut mapper = Self {
            config: MappingConfig::default(),
            keyframe_angular_threshold: 0.0,
            plane_match_direction_threshold: 0.0,
            planar_merge_direction_threshold: 0.0,
            smoother,
            pending_factors: Vec::new(),
            pending_values: Values::new(),
            pose_count: 0,
            landmark_max_count: 0,
            landmarks: LandmarkStore::new(),
            estimated_poses: Vec::new(),
            estimated_planes: Vec::new(),
            last_estimated_pose: Pose::identity(),
            rng: StdRng::seed_from_u64(COLOR_SEED),
            observer: None,
        };
        mapper.apply_config(&config);
        mapper
    }

    /// Overwrites all thresholds. Meant to be called between `mapping`
    /// invocations, never during one.
    pub fn apply_config(&mut self, config: &MappingConfig) {
        self.config = config.clone();
        self.keyframe_angular_threshold = config.keyframe_angular_threshold.to_radians();
        self.plane_match_direction_threshold =
            config.plane_match_direction_threshold.to_radians();
        self.planar_merge_direction_threshold =
            config.planar_merge_direction_threshold.to_radians();
    }

    pub fn set_observer(&mut self, observer: Box<dyn MapObserver>) {
        self.observer = Some(observer);
    }

    /// Feeds one frame. Returns `false` when the frame was ignored: not a
    /// keyframe, a first frame without planes, or a diverged optimization.
    pub fn mapping(&mut self, frame: &Frame) -> bool {
        let success = if self.landmarks.is_empty() {
            self.add_first_frame(frame)
        } else if self.config.use_keyframe && !self.is_keyframe(frame) {
            tracing::debug!("frame below keyframe thresholds, ignored");
            false
        } else {
            self.do_mapping(frame)
        };

        if success {
            self.notify_observer();
        }
        tracing::debug!(success, "mapping");
        success
    }

    fn is_keyframe(&self, frame: &Frame) -> bool {
        let rel = self.last_estimated_pose.inverse() * frame.pose;
        rel.translation.norm() > self.config.keyframe_linear_threshold
            || rel.rotation.angle() > self.keyframe_angular_threshold
    }

    /// Seeds the graph from the first frame: pose prior, direction prior on
    /// the first landmark, one observation factor and one landmark record
    /// per plane. The smoother itself first sees the data together with the
    /// next frame.
    fn add_first_frame(&mut self, frame: &Frame) -> bool {
        if frame.observations.is_empty() {
            tracing::debug!("first frame carried no planes, ignored");
            return false;
        }

        let init_pose = frame.pose;

        // reset all state
        self.pose_count = 0;
        self.landmark_max_count = 0;
        self.pending_factors.clear();
        self.pending_values = Values::new();
        self.estimated_poses.clear();
        self.estimated_planes.clear();
        self.landmarks.clear();

        self.pending_factors.push(Factor::PosePrior {
            key: 0,
            pose: init_pose,
            sigmas: Vector6::from_row_slice(&POSE_PRIOR_SIGMAS),
        });
        self.pending_values.insert_pose(0, init_pose);
        self.estimated_poses.push(init_pose);
        self.pose_count = 1;

        // direction prior on l0, from the first observed plane
        let first = &frame.observations[0];
        let first_map_plane = OrientedPlane::from_coefficients(&first.coefficients)
            .transform(&init_pose.inverse());
        self.pending_factors.push(Factor::PlaneDirectionPrior {
            plane: 0,
            measured: first_map_plane,
            sigmas: Vector2::new(first.sigmas[0], first.sigmas[1]),
        });

        let transform = init_pose.matrix();
        for (i, obs) in frame.observations.iter().enumerate() {
            let measured = OrientedPlane::from_coefficients(&obs.coefficients);
            self.pending_factors.push(Factor::PlaneObservation {
                pose: 0,
                plane: i,
                measured,
                sigmas: obs.sigmas,
            });

            let map_plane = measured.transform(&init_pose.inverse());
            self.pending_values.insert_plane(i, map_plane);
            self.estimated_planes.push(map_plane);

            let landmark = self.create_landmark(obs, &transform, map_plane.coefficients());
            self.landmarks.push(landmark);
            self.landmark_max_count += 1;
        }

        self.last_estimated_pose = init_pose;
        tracing::info!(
            planes = frame.observations.len(),
            "registered first frame in the map"
        );
        true
    }

    fn do_mapping(&mut self, frame: &Frame) -> bool {
        assert!(
            !self.landmarks.is_empty(),
            "the first frame must be registered through mapping()"
        );

        let new_pose = frame.pose;
        let rel_pose = self.last_estimated_pose.inverse() * new_pose;

        // predict landmarks into the sensor frame and associate
        let predicted: Vec<OrientedPlane> = self
            .estimated_planes
            .iter()
            .map(|plane| plane.transform(&new_pose))
            .collect();
        let pairs = match_planes(
            &predicted,
            &self.landmarks,
            &frame.observations,
            &new_pose,
            &self.match_parameters(),
        );
        tracing::debug!(
            pairs = pairs.len(),
            observations = frame.observations.len(),
            "data association"
        );

        // odometry factor and pose guess
        let pose_key = self.pose_count;
        self.pending_factors.push(Factor::PoseBetween {
            from: pose_key - 1,
            to: pose_key,
            relative: rel_pose,
            sigmas: Vector6::repeat(ODOMETRY_SIGMA),
        });
        self.pending_values.insert_pose(pose_key, new_pose);
        self.pose_count += 1;

        // observation factors to matched landmarks
        let mut paired = vec![false; frame.observations.len()];
        for pair in &pairs {
            paired[pair.observation] = true;
            let obs = &frame.observations[pair.observation];
            self.pending_factors.push(Factor::PlaneObservation {
                pose: pose_key,
                plane: pair.landmark,
                measured: OrientedPlane::from_coefficients(&obs.coefficients),
                sigmas: obs.sigmas,
            });
        }

        // fresh landmark variables for unpaired observations
        for (i, obs) in frame.observations.iter().enumerate() {
            if paired[i] {
                continue;
            }
            let id = self.landmark_max_count;
            self.landmark_max_count += 1;

            let measured = OrientedPlane::from_coefficients(&obs.coefficients);
            self.pending_factors.push(Factor::PlaneObservation {
                pose: pose_key,
                plane: id,
                measured,
                sigmas: obs.sigmas,
            });
            self.pending_values
                .insert_plane(id, measured.transform(&new_pose.inverse()));
        }

        // run the smoother; the second round drives relinearization over
        // the freshly added variables
        let factors = std::mem::take(&mut self.pending_factors);
        let values = std::mem::take(&mut self.pending_values);
        let result = self
            .smoother
            .update(factors, values)
            .and_then(|_| self.smoother.refine());
        if let Err(error) = result {
            tracing::warn!(%error, "smoother diverged, frame factors kept but pose not advanced");
            // keep the store aligned with the freshly assigned variable ids
            let transform = new_pose.matrix();
            for (i, obs) in frame.observations.iter().enumerate() {
                if paired[i] {
                    continue;
                }
                let coefficients = OrientedPlane::from_coefficients(&obs.coefficients)
                    .transform(&new_pose.inverse())
                    .coefficients();
                let landmark = self.create_landmark(obs, &transform, coefficients);
                self.landmarks.push(landmark);
            }
            return false;
        }

        let current_estimate = self.update_slam_result();
        self.update_landmarks(frame, &pairs, &current_estimate);

        let refine_parameters = self.refine_parameters();
        if self.config.refine_planar_map
            && refine_planar_map(
                &mut self.landmarks,
                &self.estimated_planes,
                &refine_parameters,
            )
        {
            // let the smoother see the reduced landmark set
            if let Err(error) = self.smoother.refine() {
                tracing::warn!(%error, "smoother round after merge failed");
            }
        }

        self.last_estimated_pose = current_estimate;
        true
    }

    /// Rebuilds the estimate vectors from the smoother and returns the
    /// newest pose estimate. A landmark added in the current cycle but not
    /// realized yet falls back to a placeholder.
    fn update_slam_result(&mut self) -> Pose {
        let values = self.smoother.best_estimate();

        let mut newest = self.last_estimated_pose;
        self.estimated_poses.clear();
        for i in 0..self.pose_count {
            let pose = values.pose(i).copied().unwrap_or(self.last_estimated_pose);
            newest = pose;
            self.estimated_poses.push(pose);
        }

        self.estimated_planes.clear();
        for i in 0..self.landmark_max_count {
            let plane = values.plane(i).copied().unwrap_or_default();
            self.estimated_planes.push(plane);
        }

        newest
    }

    /// Lets the landmark records track the smoother's plane estimates.
    fn sync_landmark_coefficients(&mut self) {
        for (lm, plane) in self.landmarks.iter_mut().zip(&self.estimated_planes) {
            lm.coefficients = plane.coefficients();
        }
    }

    /// Pulls landmark coefficients from the latest estimates, merges the
    /// matched observation clouds in, and creates records for new
    /// landmarks.
    fn update_landmarks(&mut self, frame: &Frame, pairs: &[PlanePair], estimate: &Pose) {
        let transform = estimate.matrix();
        let leaf_size = self.config.plane_inlier_leaf_size;

        self.sync_landmark_coefficients();

        let mut paired = vec![false; frame.observations.len()];
        for pair in pairs {
            paired[pair.observation] = true;
            let obs = &frame.observations[pair.observation];
            let lm = &mut self.landmarks[pair.landmark];

            let filtered = voxel_downsample(&obs.cloud, leaf_size);
            let mut merged = transform_colored(&filtered, &transform, lm.color);
            merged.append(&lm.cloud);
            let projected = project_to_plane(&merged, &lm.coefficients);
            lm.cloud = voxel_downsample(&projected, leaf_size);
            lm.centroid = cloud::centroid(&lm.cloud).unwrap_or(lm.centroid);
        }

        for (i, obs) in frame.observations.iter().enumerate() {
            if paired[i] {
                continue;
            }
            let id = self.landmarks.len();
            let coefficients = self.estimated_planes[id].coefficients();
            let landmark = self.create_landmark(obs, &transform, coefficients);
            self.landmarks.push(landmark);
        }
    }

    fn create_landmark(
        &mut self,
        obs: &PlaneObservation,
        transform: &nalgebra::Matrix4<f64>,
        coefficients: nalgebra::Vector4<f64>,
    ) -> PlaneLandmark {
        let color = Rgba::new(
            self.rng.gen_range(0..=255),
            self.rng.gen_range(0..=255),
            self.rng.gen_range(0..=255),
            255,
        );
        let filtered = voxel_downsample(&obs.cloud, self.config.plane_inlier_leaf_size);
        let cloud = transform_colored(&filtered, transform, color);
        let centroid = cloud::centroid(&cloud).unwrap_or_else(Point3::origin);
        PlaneLandmark {
            coefficients,
            color,
            cloud,
            centroid,
            valid: true,
        }
    }

    fn match_parameters(&self) -> MatchParameters {
        MatchParameters {
            direction_threshold: self.plane_match_direction_threshold,
            distance_threshold: self.config.plane_match_distance_threshold,
            check_overlap: self.config.plane_match_check_overlap,
            overlap_alpha: self.config.plane_match_overlap_alpha,
            leaf_size: self.config.plane_inlier_leaf_size,
        }
    }

    fn refine_parameters(&self) -> RefineParameters {
        RefineParameters {
            direction_threshold: self.planar_merge_direction_threshold,
            distance_threshold: self.config.planar_merge_distance_threshold,
            leaf_size: self.config.plane_inlier_leaf_size,
        }
    }

    fn notify_observer(&mut self) {
        if !self.config.publish_optimized_path {
            return;
        }
        if let Some(observer) = self.observer.as_mut() {
            observer.on_map_updated(&self.estimated_poses, self.landmarks.as_slice());
        }
    }

    /// Runs `rounds` additional smoother rounds over the submitted data.
    pub fn optimize_graph(&mut self, rounds: u32) -> Result<(), MapperError> {
        if self.smoother.is_empty() {
            return Err(MapperError::EmptyGraph);
        }
        for _ in 0..rounds {
            self.smoother.refine()?;
        }
        self.update_slam_result();
        self.sync_landmark_coefficients();
        tracing::info!(rounds, "optimized factor graph");
        self.notify_observer();
        Ok(())
    }

    /// Writes a DOT snapshot of the factor graph.
    pub fn save_graph(&self, path: &Path) -> Result<(), MapperError> {
        if self.smoother.is_empty() {
            return Err(MapperError::EmptyGraph);
        }
        std::fs::write(path, self.smoother.dot_graph())?;
        tracing::info!(path = %path.display(), "saved factor graph");
        Ok(())
    }

    /// Writes the concatenated clouds of all valid landmarks as ASCII PCD,
    /// in the map frame.
    pub fn save_map(&self, path: &Path) -> Result<(), MapperError> {
        if self.landmarks.is_empty() {
            return Err(MapperError::EmptyMap);
        }
        let mut map_cloud = PointCloud::new();
        for (_, lm) in self.landmarks.iter_valid() {
            map_cloud.append(&lm.cloud);
        }
        save_pcd_ascii(path, &map_cloud)?;
        tracing::info!(points = map_cloud.len(), path = %path.display(), "saved map");
        Ok(())
    }

    /// Prunes sparsely supported inlier points from every valid landmark.
    pub fn remove_bad_inlier(&mut self) -> Result<(), MapperError> {
        if self.landmarks.is_empty() {
            return Err(MapperError::EmptyMap);
        }
        remove_bad_inliers(
            &mut self.landmarks,
            self.config.plane_inlier_leaf_size,
            self.config.planar_bad_inlier_alpha,
        );
        self.notify_observer();
        Ok(())
    }

    /// The optimized trajectory, one pose per accepted keyframe.
    pub fn optimized_path(&self) -> Vec<Pose> {
        self.estimated_poses.clone()
    }

    pub fn last_estimated_pose(&self) -> &Pose {
        &self.last_estimated_pose
    }

    pub fn landmarks(&self) -> &[PlaneLandmark] {
        self.landmarks.as_slice()
    }

    pub fn pose_count(&self) -> usize {
        self.pose_count
    }

    /// Total number of landmark variables ever created. Monotonic,
    /// invalidation does not renumber.
    pub fn landmark_count(&self) -> usize {
        self.landmark_max_count
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use approx::assert_relative_eq;
    use nalgebra::{Vector3, Vector4};

    use common::frame::PointXyzRgba;
    use common::geometry::tangent_basis;
    use cloud::transform_cloud;

    use super::*;

    /// Square patch of points on the given plane, spaced so that no point
    /// sits on a voxel boundary after the usual translations.
    fn world_patch(
        coefficients: &Vector4<f64>,
        centroid: &Point3<f64>,
        count_per_side: usize,
    ) -> PointCloud {
        let plane = OrientedPlane::from_coefficients(coefficients);
        let (b1, b2) = tangent_basis(plane.normal());
        let half = (count_per_side - 1) as f64 * 0.093 / 2.0;
        let mut cloud = PointCloud::new();
        for i in 0..count_per_side {
            for j in 0..count_per_side {
                let offset =
                    b1 * (i as f64 * 0.093 - half) + b2 * (j as f64 * 0.093 - half);
                let p = centroid + offset;
                cloud.push(PointXyzRgba::new(p.x as f32, p.y as f32, p.z as f32));
            }
        }
        cloud
    }

    fn observation(
        coefficients: Vector4<f64>,
        cloud: PointCloud,
        centroid: Point3<f64>,
    ) -> PlaneObservation {
        PlaneObservation {
            coefficients,
            sigmas: Vector3::new(0.01, 0.01, 0.02),
            cloud,
            centroid,
        }
    }

    /// The same world plane and patch, re-expressed in the sensor frame.
    fn observation_from_world(
        world_coefficients: &Vector4<f64>,
        world_cloud: &PointCloud,
        sensor: &Pose,
    ) -> PlaneObservation {
        let plane = OrientedPlane::from_coefficients(world_coefficients).transform(sensor);
        let sensor_cloud = transform_cloud(world_cloud, &sensor.inverse().matrix());
        let centroid = cloud::centroid(&sensor_cloud).unwrap();
        observation(plane.coefficients(), sensor_cloud, centroid)
    }

    fn floor_frame() -> Frame {
        let coefficients = Vector4::new(0.0, 0.0, 1.0, -1.0);
        let centroid = Point3::new(0.0, 0.0, 1.0);
        Frame {
            pose: Pose::identity(),
            observations: vec![observation(
                coefficients,
                world_patch(&coefficients, &centroid, 10),
                centroid,
            )],
        }
    }

    #[test]
    fn first_frame_initializes_the_map() {
        let mut mapper = Mapper::new(MappingConfig::default());
        assert!(mapper.mapping(&floor_frame()));

        assert_eq!(mapper.pose_count(), 1);
        assert_eq!(mapper.landmark_count(), 1);
        assert_eq!(mapper.landmarks().len(), 1);
        assert!(mapper.landmarks()[0].valid);
        assert_relative_eq!(
            mapper.landmarks()[0].coefficients,
            Vector4::new(0.0, 0.0, 1.0, -1.0),
            epsilon = 1e-9
        );
        assert_eq!(mapper.optimized_path().len(), 1);
    }

    #[test]
    fn first_frame_without_planes_is_ignored() {
        let mut mapper = Mapper::new(MappingConfig::default());
        let empty = Frame {
            pose: Pose::identity(),
            observations: Vec::new(),
        };
        assert!(!mapper.mapping(&empty));
        assert_eq!(mapper.landmark_count(), 0);
        assert!(mapper.landmarks().is_empty());
    }

    #[test]
    fn matched_second_frame_extends_the_trajectory() {
        let mut mapper = Mapper::new(MappingConfig::default());
        let world = Vector4::new(0.0, 0.0, 1.0, -1.0);
        let world_centroid = Point3::new(0.0, 0.0, 1.0);
        let world_cloud = world_patch(&world, &world_centroid, 10);

        let frame0 = Frame {
            pose: Pose::identity(),
            observations: vec![observation(world, world_cloud.clone(), world_centroid)],
        };
        assert!(mapper.mapping(&frame0));

        let pose1 = Pose::from_translation(0.1, 0.0, 0.0);
        let mut obs = observation_from_world(&world, &world_cloud, &pose1);
        // slight measurement noise on the plane offset
        obs.coefficients = Vector4::new(0.0, 0.0, 1.0, -0.999);
        let frame1 = Frame {
            pose: pose1,
            observations: vec![obs],
        };
        assert!(mapper.mapping(&frame1));

        assert_eq!(mapper.pose_count(), 2);
        assert_eq!(mapper.landmark_count(), 1, "the observation should match");
        assert_eq!(mapper.optimized_path().len(), 2);

        let lm = &mapper.landmarks()[0];
        assert!(lm.cloud.len() <= 200, "merged cloud must stay downsampled");
        assert_relative_eq!(
            lm.coefficients,
            Vector4::new(0.0, 0.0, 1.0, -1.0),
            epsilon = 1e-2
        );
        assert_relative_eq!(
            mapper.optimized_path()[1].translation,
            Vector3::new(0.1, 0.0, 0.0),
            epsilon = 1e-2
        );
    }

    #[test]
    fn sub_keyframe_motion_is_rejected() {
        let mut mapper = Mapper::new(MappingConfig::default());
        assert!(mapper.mapping(&floor_frame()));

        let world = Vector4::new(0.0, 0.0, 1.0, -1.0);
        let world_cloud = world_patch(&world, &Point3::new(0.0, 0.0, 1.0), 10);
        let pose = Pose::from_translation(0.001, 0.0, 0.0);
        let frame = Frame {
            pose,
            observations: vec![observation_from_world(&world, &world_cloud, &pose)],
        };

        assert!(!mapper.mapping(&frame));
        assert_eq!(mapper.pose_count(), 1);
        assert_eq!(mapper.landmark_count(), 1);
    }

    #[test]
    fn repeated_frame_leaves_the_state_unchanged() {
        let mut mapper = Mapper::new(MappingConfig::default());
        let world = Vector4::new(0.0, 0.0, 1.0, -1.0);
        let world_cloud = world_patch(&world, &Point3::new(0.0, 0.0, 1.0), 10);

        assert!(mapper.mapping(&floor_frame()));
        let pose1 = Pose::from_translation(0.1, 0.0, 0.0);
        let frame1 = Frame {
            pose: pose1,
            observations: vec![observation_from_world(&world, &world_cloud, &pose1)],
        };
        assert!(mapper.mapping(&frame1));

        let poses = mapper.pose_count();
        let landmarks = mapper.landmark_count();
        assert!(!mapper.mapping(&frame1), "same pose is not a keyframe");
        assert_eq!(mapper.pose_count(), poses);
        assert_eq!(mapper.landmark_count(), landmarks);
    }

    #[test]
    fn unmatched_plane_becomes_a_new_landmark() {
        let mut mapper = Mapper::new(MappingConfig::default());
        let floor = Vector4::new(0.0, 0.0, 1.0, -1.0);
        let floor_centroid = Point3::new(0.0, 0.0, 1.0);
        let floor_cloud = world_patch(&floor, &floor_centroid, 10);

        let frame0 = Frame {
            pose: Pose::identity(),
            observations: vec![observation(floor, floor_cloud.clone(), floor_centroid)],
        };
        assert!(mapper.mapping(&frame0));

        // second frame sees the floor again plus an orthogonal wall
        let pose1 = Pose::from_translation(0.1, 0.0, 0.0);
        let wall = Vector4::new(1.0, 0.0, 0.0, -2.0);
        let wall_centroid = Point3::new(2.0, 0.0, 0.0);
        let frame1 = Frame {
            pose: pose1,
            observations: vec![
                observation_from_world(&floor, &floor_cloud, &pose1),
                observation(wall, world_patch(&wall, &wall_centroid, 10), wall_centroid),
            ],
        };
        assert!(mapper.mapping(&frame1));

        assert_eq!(mapper.landmark_count(), 2);
        assert_eq!(mapper.landmarks().len(), 2);
        // the wall was observed from x = 0.1, so its map-frame offset is 2.1
        assert_relative_eq!(
            mapper.landmarks()[1].coefficients,
            Vector4::new(1.0, 0.0, 0.0, -2.1),
            epsilon = 1e-2
        );
    }

    #[test]
    fn coplanar_duplicates_merge_during_refinement() {
        // zero direction threshold keeps every observation unmatched, so
        // the second frame duplicates the landmark and refinement merges it
        let config = MappingConfig {
            plane_match_direction_threshold: 0.0,
            ..MappingConfig::default()
        };
        let mut mapper = Mapper::new(config);

        let world = Vector4::new(0.0, 0.0, 1.0, -1.0);
        let world_centroid = Point3::new(0.0, 0.0, 1.0);
        let world_cloud = world_patch(&world, &world_centroid, 10);

        let frame0 = Frame {
            pose: Pose::identity(),
            observations: vec![observation(world, world_cloud.clone(), world_centroid)],
        };
        assert!(mapper.mapping(&frame0));

        let pose1 = Pose::from_translation(0.1, 0.0, 0.0);
        let frame1 = Frame {
            pose: pose1,
            observations: vec![observation_from_world(&world, &world_cloud, &pose1)],
        };
        assert!(mapper.mapping(&frame1));

        assert_eq!(mapper.landmark_count(), 2);
        let valid: Vec<bool> = mapper.landmarks().iter().map(|lm| lm.valid).collect();
        assert_eq!(valid.iter().filter(|v| **v).count(), 1);
        // indices stay stable, the merged-away entry remains in place
        assert_eq!(mapper.landmarks().len(), 2);
    }

    #[test]
    fn saved_map_counts_valid_landmark_points() {
        let mut mapper = Mapper::new(MappingConfig::default());
        let world = Vector4::new(0.0, 0.0, 1.0, -1.0);
        let world_cloud = world_patch(&world, &Point3::new(0.0, 0.0, 1.0), 10);

        assert!(mapper.mapping(&floor_frame()));
        let pose1 = Pose::from_translation(0.1, 0.0, 0.0);
        let frame1 = Frame {
            pose: pose1,
            observations: vec![observation_from_world(&world, &world_cloud, &pose1)],
        };
        assert!(mapper.mapping(&frame1));

        let path = std::env::temp_dir().join("mapper_saved_map_test.pcd");
        mapper.save_map(&path).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let expected: usize = mapper
            .landmarks()
            .iter()
            .filter(|lm| lm.valid)
            .map(|lm| lm.cloud.len())
            .sum();
        assert!(contents.contains(&format!("POINTS {expected}")));

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn commands_fail_on_an_empty_engine() {
        let mut mapper = Mapper::new(MappingConfig::default());
        let path = std::env::temp_dir().join("mapper_empty_engine_test");

        assert!(matches!(
            mapper.optimize_graph(10),
            Err(MapperError::EmptyGraph)
        ));
        assert!(matches!(
            mapper.save_graph(&path),
            Err(MapperError::EmptyGraph)
        ));
        assert!(matches!(mapper.save_map(&path), Err(MapperError::EmptyMap)));
        assert!(matches!(
            mapper.remove_bad_inlier(),
            Err(MapperError::EmptyMap)
        ));
    }

    #[test]
    fn optimize_and_save_graph_after_two_frames() {
        let mut mapper = Mapper::new(MappingConfig::default());
        let world = Vector4::new(0.0, 0.0, 1.0, -1.0);
        let world_cloud = world_patch(&world, &Point3::new(0.0, 0.0, 1.0), 10);

        assert!(mapper.mapping(&floor_frame()));
        let pose1 = Pose::from_translation(0.1, 0.0, 0.0);
        let frame1 = Frame {
            pose: pose1,
            observations: vec![observation_from_world(&world, &world_cloud, &pose1)],
        };
        assert!(mapper.mapping(&frame1));

        mapper.optimize_graph(10).unwrap();
        assert_relative_eq!(
            mapper.landmarks()[0].coefficients,
            Vector4::new(0.0, 0.0, 1.0, -1.0),
            epsilon = 1e-2
        );

        let path = std::env::temp_dir().join("mapper_saved_graph_test.dot");
        mapper.save_graph(&path).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.starts_with("graph factor_graph"));
        assert!(contents.contains("x0"));
        assert!(contents.contains("l0"));
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn identical_observations_may_share_one_landmark() {
        let mut mapper = Mapper::new(MappingConfig::default());
        let world = Vector4::new(0.0, 0.0, 1.0, -1.0);
        let world_cloud = world_patch(&world, &Point3::new(0.0, 0.0, 1.0), 10);

        assert!(mapper.mapping(&floor_frame()));
        let pose1 = Pose::from_translation(0.1, 0.0, 0.0);
        let frame1 = Frame {
            pose: pose1,
            observations: vec![
                observation_from_world(&world, &world_cloud, &pose1),
                observation_from_world(&world, &world_cloud, &pose1),
            ],
        };
        assert!(mapper.mapping(&frame1));

        // no mutual exclusion on the landmark side
        assert_eq!(mapper.landmark_count(), 1);
    }

    struct CountingObserver(Arc<AtomicUsize>);

    impl MapObserver for CountingObserver {
        fn on_map_updated(&mut self, poses: &[Pose], landmarks: &[PlaneLandmark]) {
            assert_eq!(poses.len(), 1);
            assert!(!landmarks.is_empty());
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn observer_is_notified_on_success() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut mapper = Mapper::new(MappingConfig::default());
        mapper.set_observer(Box::new(CountingObserver(counter.clone())));

        let empty = Frame {
            pose: Pose::identity(),
            observations: Vec::new(),
        };
        assert!(!mapper.mapping(&empty));
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        assert!(mapper.mapping(&floor_frame()));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
