use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use common::frame::{PointCloud, Rgba};

/// Writes the cloud as an ASCII PCD v0.7 file with fields `x y z rgba`,
/// `rgba` packed into a single unsigned 32-bit value.
pub fn save_pcd_ascii(path: &Path, cloud: &PointCloud) -> io::Result<()> {
    let file = File::create(path)?;
    let mut out = BufWriter::new(file);

    writeln!(out, "# .PCD v0.7 - Point Cloud Data file format")?;
    writeln!(out, "VERSION 0.7")?;
    writeln!(out, "FIELDS x y z rgba")?;
    writeln!(out, "SIZE 4 4 4 4")?;
    writeln!(out, "TYPE F F F U")?;
    writeln!(out, "COUNT 1 1 1 1")?;
    writeln!(out, "WIDTH {}", cloud.len())?;
    writeln!(out, "HEIGHT 1")?;
    writeln!(out, "VIEWPOINT 0 0 0 1 0 0 0")?;
    writeln!(out, "POINTS {}", cloud.len())?;
    writeln!(out, "DATA ascii")?;

    for p in &cloud.points {
        writeln!(
            out,
            "{} {} {} {}",
            p.position.x,
            p.position.y,
            p.position.z,
            pack_rgba(p.color)
        )?;
    }

    out.flush()
}

fn pack_rgba(color: Rgba) -> u32 {
    ((color.a as u32) << 24) | ((color.r as u32) << 16) | ((color.g as u32) << 8) | color.b as u32
}

#[cfg(test)]
mod tests {
    use common::frame::{PointXyzRgba, Rgba};

    use super::*;

    #[test]
    fn writes_header_and_points() {
        let mut cloud = PointCloud::new();
        cloud.push(PointXyzRgba {
            position: nalgebra::Point3::new(1.0, 2.0, 3.0),
            color: Rgba::new(255, 0, 0, 255),
        });
        cloud.push(PointXyzRgba::new(0.0, 0.0, 0.0));

        let path = std::env::temp_dir().join("cloud_pcd_writer_test.pcd");
        save_pcd_ascii(&path, &cloud).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.starts_with("# .PCD v0.7"));
        assert!(contents.contains("FIELDS x y z rgba"));
        assert!(contents.contains("POINTS 2"));
        let data_lines = contents.lines().skip(11).count();
        assert_eq!(data_lines, 2);

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn packs_rgba_like_pcl() {
        assert_eq!(pack_rgba(Rgba::new(0x12, 0x34, 0x56, 0xff)), 0xff123456);
    }
}
