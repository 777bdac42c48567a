use std::fs;
use std::path::Path;

use anyhow::Context;
use serde::Deserialize;

/// All tunables of the mapping engine. Angular thresholds are configured in
/// degrees and converted to radians when the engine applies the config.
#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct MappingConfig {
    /// Gate incoming frames by the keyframe test.
    pub use_keyframe: bool,
    /// Minimum translation (m) for a frame to become a keyframe.
    pub keyframe_linear_threshold: f64,
    /// Minimum rotation (deg) for a frame to become a keyframe.
    pub keyframe_angular_threshold: f64,

    pub smoother_relinearize_threshold: f64,
    pub smoother_relinearize_skip: u32,

    /// Maximum normal misalignment (deg) for observation-landmark matching.
    pub plane_match_direction_threshold: f64,
    /// Maximum parallel offset (m) for observation-landmark matching.
    pub plane_match_distance_threshold: f64,
    /// Veto geometric matches whose clouds do not overlap.
    pub plane_match_check_overlap: bool,
    /// Minimum fraction of projected observation points falling into
    /// occupied landmark voxels.
    pub plane_match_overlap_alpha: f64,

    /// Voxel leaf edge (m), also the octree occupancy resolution.
    pub plane_inlier_leaf_size: f32,
    /// Reserved for hull refinement.
    pub plane_hull_alpha: f64,

    /// Merge co-planar landmarks after every accepted frame.
    pub refine_planar_map: bool,
    /// Maximum normal misalignment (deg) for the co-planar merge.
    pub planar_merge_direction_threshold: f64,
    /// Maximum parallel offset (m) for the co-planar merge.
    pub planar_merge_distance_threshold: f64,
    /// Density factor for the bad-inlier radius filter.
    pub planar_bad_inlier_alpha: f64,

    /// Notify the observer with poses and landmarks after map updates.
    pub publish_optimized_path: bool,
}

impl Default for MappingConfig {
    fn default() -> Self {
        Self {
            use_keyframe: true,
            keyframe_linear_threshold: 0.05,
            keyframe_angular_threshold: 5.0,
            smoother_relinearize_threshold: 0.05,
            smoother_relinearize_skip: 1,
            plane_match_direction_threshold: 10.0,
            plane_match_distance_threshold: 0.1,
            plane_match_check_overlap: true,
            plane_match_overlap_alpha: 0.5,
            plane_inlier_leaf_size: 0.05,
            plane_hull_alpha: 0.5,
            refine_planar_map: true,
            planar_merge_direction_threshold: 10.0,
            planar_merge_distance_threshold: 0.1,
            planar_bad_inlier_alpha: 0.3,
            publish_optimized_path: true,
        }
    }
}

impl MappingConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("could not read config file {}", path.display()))?;
        serde_yaml::from_str(&contents).context("could not parse mapping config")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = MappingConfig::default();
        assert!(config.use_keyframe);
        assert_eq!(config.keyframe_linear_threshold, 0.05);
        assert_eq!(config.keyframe_angular_threshold, 5.0);
        assert_eq!(config.plane_match_overlap_alpha, 0.5);
        assert_eq!(config.plane_inlier_leaf_size, 0.05);
    }

    #[test]
    fn partial_yaml_falls_back_to_defaults() {
        let config: MappingConfig =
            serde_yaml::from_str("use_keyframe: false\nplane_match_distance_threshold: 0.2\n")
                .unwrap();
        assert!(!config.use_keyframe);
        assert_eq!(config.plane_match_distance_threshold, 0.2);
        assert_eq!(config.smoother_relinearize_skip, 1);
    }
}
