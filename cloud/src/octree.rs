use nalgebra::Point3;

use common::frame::PointCloud;

#[derive(Default)]
struct Node {
    children: [Option<Box<Node>>; 8],
}

/// Occupancy octree over a point cloud: the root cube covers the cloud's
/// bounding box with an edge that is a power-of-two multiple of
/// `resolution`, leaves have edge `resolution`. Answers whether a query
/// point falls into a voxel that contains at least one cloud point.
pub struct OccupancyOctree {
    root: Node,
    min: Point3<f32>,
    root_edge: f32,
    depth: u32,
}

impl OccupancyOctree {
    pub fn build(cloud: &PointCloud, resolution: f32) -> Self {
        assert!(resolution > 0.0, "octree resolution must be positive");

        let mut min = Point3::new(f32::INFINITY, f32::INFINITY, f32::INFINITY);
        let mut max = Point3::new(f32::NEG_INFINITY, f32::NEG_INFINITY, f32::NEG_INFINITY);
        for p in &cloud.points {
            min = min.inf(&p.position);
            max = max.sup(&p.position);
        }
        if cloud.is_empty() {
            min = Point3::origin();
            max = Point3::origin();
        }

        let extent = (max - min).amax().max(resolution);
        let mut depth = 0u32;
        let mut root_edge = resolution;
        while root_edge < extent {
            root_edge *= 2.0;
            depth += 1;
        }

        let mut octree = Self {
            root: Node::default(),
            min,
            root_edge,
            depth,
        };
        for p in &cloud.points {
            octree.insert(&p.position);
        }
        octree
    }

    fn insert(&mut self, point: &Point3<f32>) {
        let mut node = &mut self.root;
        let mut center = self.min + nalgebra::Vector3::repeat(self.root_edge / 2.0);
        let mut edge = self.root_edge;
        for _ in 0..self.depth {
            let (octant, new_center) = descend(&center, edge, point);
            node = node.children[octant].get_or_insert_with(Default::default);
            center = new_center;
            edge /= 2.0;
        }
    }

    /// True when `point` lies in an occupied leaf voxel.
    pub fn is_occupied(&self, point: &Point3<f32>) -> bool {
        for i in 0..3 {
            if point[i] < self.min[i] || point[i] >= self.min[i] + self.root_edge {
                return false;
            }
        }

        let mut node = &self.root;
        let mut center = self.min + nalgebra::Vector3::repeat(self.root_edge / 2.0);
        let mut edge = self.root_edge;
        for _ in 0..self.depth {
            let (octant, new_center) = descend(&center, edge, point);
            match &node.children[octant] {
                Some(child) => node = child,
                None => return false,
            }
            center = new_center;
            edge /= 2.0;
        }
        true
    }
}

/// Octant of `point` relative to `center` and the center of that octant.
fn descend(center: &Point3<f32>, edge: f32, point: &Point3<f32>) -> (usize, Point3<f32>) {
    let quarter = edge / 4.0;
    let mut octant = 0;
    let mut new_center = *center;
    for i in 0..3 {
        if point[i] >= center[i] {
            octant |= 1 << i;
            new_center[i] += quarter;
        } else {
            new_center[i] -= quarter;
        }
    }
    (octant, new_center)
}

#[cfg(test)]
mod tests {
    use common::frame::PointXyzRgba;

    use super::*;

    fn plane_patch() -> PointCloud {
        let mut cloud = PointCloud::new();
        for i in 0..10 {
            for j in 0..10 {
                cloud.push(PointXyzRgba::new(i as f32 * 0.1, j as f32 * 0.1, 1.0));
            }
        }
        cloud
    }

    #[test]
    fn hits_occupied_voxels() {
        let octree = OccupancyOctree::build(&plane_patch(), 0.05);
        assert!(octree.is_occupied(&Point3::new(0.5, 0.5, 1.0)));
        assert!(octree.is_occupied(&Point3::new(0.21, 0.41, 1.01)));
    }

    #[test]
    fn misses_free_space_and_outside() {
        let octree = OccupancyOctree::build(&plane_patch(), 0.05);
        assert!(!octree.is_occupied(&Point3::new(0.5, 0.5, 1.5)));
        assert!(!octree.is_occupied(&Point3::new(-3.0, 0.0, 1.0)));
    }

    #[test]
    fn single_point_cloud() {
        let cloud: PointCloud = [PointXyzRgba::new(1.0, 2.0, 3.0)].into_iter().collect();
        let octree = OccupancyOctree::build(&cloud, 0.1);
        assert!(octree.is_occupied(&Point3::new(1.0, 2.0, 3.0)));
    }
}
