//! Minimal colored point cloud with voxel down-sampling and ASCII PLY I/O.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result, bail};
use nalgebra::Vector3;

use super::SE3;

/// Point cloud in a single coordinate frame.
///
/// `colors` is either empty or has exactly one entry per point.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PointCloud {
    pub points: Vec<Vector3<f64>>,
    pub colors: Vec<[u8; 3]>,
}

impl PointCloud {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_points(points: Vec<Vector3<f64>>) -> Self {
        Self {
            points,
            colors: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn has_colors(&self) -> bool {
        !self.colors.is_empty() && self.colors.len() == self.points.len()
    }

    /// Append another cloud. Colors are kept only if both sides carry them.
    pub fn extend(&mut self, other: &PointCloud) {
        let keep_colors = (self.is_empty() || self.has_colors()) && other.has_colors();
        if !keep_colors {
            self.colors.clear();
        }
        self.points.extend_from_slice(&other.points);
        if keep_colors {
            self.colors.extend_from_slice(&other.colors);
        }
    }

    pub fn centroid(&self) -> Option<Vector3<f64>> {
        if self.points.is_empty() {
            return None;
        }
        let sum: Vector3<f64> = self.points.iter().sum();
        Some(sum / self.points.len() as f64)
    }

    /// Copy of this cloud with every point transformed.
    pub fn transformed(&self, pose: &SE3) -> Self {
        Self {
            points: pose.transform_points(&self.points),
            colors: self.colors.clone(),
        }
    }

    pub fn paint_uniform(&mut self, color: [u8; 3]) {
        self.colors = vec![color; self.points.len()];
    }

    /// Down-sample by averaging all points falling into the same voxel.
    ///
    /// Output order follows the first occurrence of each voxel so results are
    /// deterministic for a given input.
    pub fn voxel_downsample(&self, voxel_size: f64) -> Self {
        if voxel_size <= 0.0 || self.points.is_empty() {
            return self.clone();
        }

        let with_colors = self.has_colors();
        let mut index: HashMap<(i64, i64, i64), usize> = HashMap::new();
        let mut sums: Vec<(Vector3<f64>, [u32; 3], u32)> = Vec::new();

        for (i, p) in self.points.iter().enumerate() {
            let key = (
                (p.x / voxel_size).floor() as i64,
                (p.y / voxel_size).floor() as i64,
                (p.z / voxel_size).floor() as i64,
            );
            let slot = *index.entry(key).or_insert_with(|| {
                sums.push((Vector3::zeros(), [0; 3], 0));
                sums.len() - 1
            });
            let acc = &mut sums[slot];
            acc.0 += p;
            if with_colors {
                for c in 0..3 {
                    acc.1[c] += self.colors[i][c] as u32;
                }
            }
            acc.2 += 1;
        }

        let points = sums.iter().map(|(sum, _, n)| sum / *n as f64).collect();
        let colors = if with_colors {
            sums.iter()
                .map(|(_, c, n)| [(c[0] / n) as u8, (c[1] / n) as u8, (c[2] / n) as u8])
                .collect()
        } else {
            Vec::new()
        };

        Self { points, colors }
    }

    /// Write the cloud as ASCII PLY.
    pub fn write_ply(&self, path: impl AsRef<Path>) -> io::Result<()> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        let has_colors = self.has_colors();

        writeln!(writer, "ply")?;
        writeln!(writer, "format ascii 1.0")?;
        writeln!(writer, "element vertex {}", self.points.len())?;
        writeln!(writer, "property float x")?;
        writeln!(writer, "property float y")?;
        writeln!(writer, "property float z")?;
        if has_colors {
            writeln!(writer, "property uchar red")?;
            writeln!(writer, "property uchar green")?;
            writeln!(writer, "property uchar blue")?;
        }
        writeln!(writer, "end_header")?;

        for (i, p) in self.points.iter().enumerate() {
            write!(writer, "{} {} {}", p.x, p.y, p.z)?;
            if has_colors {
                let c = self.colors[i];
                write!(writer, " {} {} {}", c[0], c[1], c[2])?;
            }
            writeln!(writer)?;
        }

        writer.flush()
    }

    /// Read an ASCII PLY written by [`PointCloud::write_ply`].
    pub fn read_ply(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).with_context(|| format!("Failed to open {:?}", path))?;
        let mut lines = BufReader::new(file).lines();

        let mut n_vertices = 0usize;
        let mut n_properties = 0usize;
        loop {
            let line = match lines.next() {
                Some(line) => line?,
                None => bail!("Unexpected end of PLY header in {:?}", path),
            };
            let line = line.trim();
            if line.starts_with("format") && !line.contains("ascii") {
                bail!("Only ASCII PLY is supported ({:?})", path);
            }
            if let Some(count) = line.strip_prefix("element vertex ") {
                n_vertices = count.trim().parse()?;
            } else if line.starts_with("property") {
                n_properties += 1;
            } else if line == "end_header" {
                break;
            }
        }

        let has_colors = n_properties >= 6;
        let mut cloud = PointCloud::new();
        for _ in 0..n_vertices {
            let line = lines
                .next()
                .with_context(|| format!("Truncated PLY body in {:?}", path))??;
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 3 {
                bail!("Malformed PLY vertex line: {}", line);
            }
            cloud.points.push(Vector3::new(
                fields[0].parse()?,
                fields[1].parse()?,
                fields[2].parse()?,
            ));
            if has_colors && fields.len() >= 6 {
                cloud
                    .colors
                    .push([fields[3].parse()?, fields[4].parse()?, fields[5].parse()?]);
            }
        }

        Ok(cloud)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_voxel_downsample_merges_close_points() {
        let cloud = PointCloud::from_points(vec![
            Vector3::new(0.01, 0.01, 0.01),
            Vector3::new(0.03, 0.03, 0.03),
            Vector3::new(1.01, 0.01, 0.01),
        ]);
        let down = cloud.voxel_downsample(0.05);

        assert_eq!(down.len(), 2);
        assert_relative_eq!(down.points[0], Vector3::new(0.02, 0.02, 0.02), epsilon = 1e-12);
    }

    #[test]
    fn test_extend_drops_colors_when_mixed() {
        let mut a = PointCloud::from_points(vec![Vector3::zeros()]);
        a.paint_uniform([255, 0, 0]);
        let b = PointCloud::from_points(vec![Vector3::new(1.0, 0.0, 0.0)]);
        a.extend(&b);

        assert_eq!(a.len(), 2);
        assert!(!a.has_colors());
    }

    #[test]
    fn test_ply_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cloud.ply");

        let mut cloud = PointCloud::from_points(vec![
            Vector3::new(0.5, -1.25, 3.0),
            Vector3::new(2.0, 0.0, -0.75),
        ]);
        cloud.paint_uniform([0, 180, 180]);
        cloud.write_ply(&path).unwrap();

        let restored = PointCloud::read_ply(&path).unwrap();
        assert_eq!(restored.len(), 2);
        assert_eq!(restored.colors, cloud.colors);
        assert_relative_eq!(restored.points[0], cloud.points[0], epsilon = 1e-6);
    }
}
