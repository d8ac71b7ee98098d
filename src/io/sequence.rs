//! RGB-D sequence reader.
//!
//! Layout of a sequence directory:
//! ```text
//! <root>/data_association.txt     one "<depth> <color>" pair of relative paths per line
//! <root>/trajectory.log           Open3D trajectory: "<i> <j> <n>" then 4 matrix rows per frame
//! <root>/<prediction_folder>/<frame_name>.csv   detections per frame
//! ```
//! Frame names follow the color file stem (`frame-000123`); the sequence id is
//! the number after the last '-'.

use std::fs::{self, File};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use csv::ReaderBuilder;
use nalgebra::Matrix4;

use crate::geometry::SE3;
use crate::mapping::{Detection, RgbdImage};

#[derive(Debug, Clone)]
pub struct FrameEntry {
    pub sequence_id: u32,
    /// Color file stem, e.g. `frame-000123`.
    pub name: String,
    pub color_path: PathBuf,
    pub depth_path: PathBuf,
    pub pose: SE3,
}

/// One loaded frame.
pub struct Frame {
    pub sequence_id: u32,
    pub name: String,
    pub rgbd: RgbdImage,
    pub detections: Vec<Detection>,
    pub pose: SE3,
}

#[derive(Debug)]
pub struct SequenceTable {
    root: PathBuf,
    prediction_dir: PathBuf,
    pub entries: Vec<FrameEntry>,
}

/// Sequence id encoded in a frame name: `frame-000123` -> 123.
pub fn parse_sequence_id(frame_name: &str) -> Result<u32> {
    let digits = frame_name
        .rsplit('-')
        .next()
        .with_context(|| format!("Malformed frame name {}", frame_name))?;
    digits
        .parse()
        .with_context(|| format!("Frame name {} has no numeric suffix", frame_name))
}

impl SequenceTable {
    pub fn load<P: AsRef<Path>>(root: P, prediction_folder: &str) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let pairs = load_association(&root.join("data_association.txt"))?;
        let poses = load_trajectory_log(&root.join("trajectory.log"))?;

        if pairs.len() != poses.len() {
            bail!(
                "data_association.txt lists {} frames but trajectory.log has {} poses",
                pairs.len(),
                poses.len()
            );
        }

        let mut entries = Vec::with_capacity(pairs.len());
        for ((depth, color), pose) in pairs.into_iter().zip(poses) {
            let name = Path::new(&color)
                .file_stem()
                .and_then(|s| s.to_str())
                .with_context(|| format!("Invalid color path {}", color))?
                .to_string();
            entries.push(FrameEntry {
                sequence_id: parse_sequence_id(&name)?,
                name,
                color_path: root.join(&color),
                depth_path: root.join(&depth),
                pose,
            });
        }

        Ok(Self {
            prediction_dir: root.join(prediction_folder),
            root,
            entries,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn detection_path(&self, entry: &FrameEntry) -> PathBuf {
        self.prediction_dir.join(format!("{}.csv", entry.name))
    }

    /// Read images and detections of one frame.
    pub fn load_frame(&self, entry: &FrameEntry) -> Result<Frame> {
        let color = image::open(&entry.color_path)
            .with_context(|| format!("Failed to read color image {:?}", entry.color_path))?
            .to_rgb8();
        let depth = image::open(&entry.depth_path)
            .with_context(|| format!("Failed to read depth image {:?}", entry.depth_path))?
            .to_luma16();
        let detections = load_detections(&self.detection_path(entry))?;

        Ok(Frame {
            sequence_id: entry.sequence_id,
            name: entry.name.clone(),
            rgbd: RgbdImage { color, depth },
            detections,
            pose: entry.pose,
        })
    }
}

fn load_association(path: &Path) -> Result<Vec<(String, String)>> {
    let text =
        fs::read_to_string(path).with_context(|| format!("Failed to open {}", path.display()))?;

    let mut pairs = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 2 {
            bail!("Malformed association line: {}", line);
        }
        pairs.push((fields[0].to_string(), fields[1].to_string()));
    }
    Ok(pairs)
}

/// Open3D trajectory log: a metadata line followed by four matrix rows per pose.
pub fn load_trajectory_log(path: &Path) -> Result<Vec<SE3>> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let lines: Vec<String> = BufReader::new(file)
        .lines()
        .collect::<std::io::Result<_>>()?;
    let lines: Vec<&str> = lines.iter().map(|l| l.trim()).filter(|l| !l.is_empty()).collect();

    if lines.len() % 5 != 0 {
        bail!("{} is truncated ({} lines)", path.display(), lines.len());
    }

    let mut poses = Vec::with_capacity(lines.len() / 5);
    for block in lines.chunks(5) {
        let mut values = Vec::with_capacity(16);
        for row in &block[1..] {
            for v in row.split_whitespace() {
                values.push(v.parse::<f64>().with_context(|| format!("Bad matrix entry {}", v))?);
            }
        }
        if values.len() != 16 {
            bail!("Expected 16 matrix entries after '{}', got {}", block[0], values.len());
        }
        poses.push(SE3::from_matrix(Matrix4::from_row_slice(&values)));
    }
    Ok(poses)
}

/// Detections CSV with header `label,score,u_min,v_min,u_max,v_max`.
pub fn load_detections(path: &Path) -> Result<Vec<Detection>> {
    let mut rdr = ReaderBuilder::new()
        .comment(Some(b'#'))
        .trim(csv::Trim::All)
        .from_path(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;

    let mut detections = Vec::new();
    for rec in rdr.deserialize() {
        let det: Detection = rec.with_context(|| format!("Malformed detection in {}", path.display()))?;
        detections.push(det);
    }
    Ok(detections)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use image::{ImageBuffer, Luma, RgbImage};

    const TRAJECTORY: &str = "\
0 0 1
1 0 0 0.5
0 1 0 0
0 0 1 0
0 0 0 1
1 1 2
0 -1 0 1
1 0 0 2
0 0 1 3
0 0 0 1
";

    fn write_sequence(dir: &Path) {
        fs::write(
            dir.join("data_association.txt"),
            "depth/frame-000000.png color/frame-000000.png\ndepth/frame-000010.png color/frame-000010.png\n",
        )
        .unwrap();
        fs::write(dir.join("trajectory.log"), TRAJECTORY).unwrap();
    }

    #[test]
    fn test_parse_sequence_id() {
        assert_eq!(parse_sequence_id("frame-000123").unwrap(), 123);
        assert!(parse_sequence_id("frame-abc").is_err());
    }

    #[test]
    fn test_load_table() {
        let dir = tempfile::tempdir().unwrap();
        write_sequence(dir.path());

        let table = SequenceTable::load(dir.path(), "prediction_no_augment").unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.entries[1].sequence_id, 10);
        assert_eq!(table.entries[1].name, "frame-000010");
        assert_relative_eq!(table.entries[0].pose.translation.x, 0.5);
        assert_relative_eq!(table.entries[1].pose.translation.z, 3.0);
        assert!(
            table
                .detection_path(&table.entries[0])
                .ends_with("prediction_no_augment/frame-000000.csv")
        );
    }

    #[test]
    fn test_mismatched_table_fails() {
        let dir = tempfile::tempdir().unwrap();
        write_sequence(dir.path());
        fs::write(
            dir.path().join("data_association.txt"),
            "depth/frame-000000.png color/frame-000000.png\n",
        )
        .unwrap();
        assert!(SequenceTable::load(dir.path(), "pred").is_err());
    }

    #[test]
    fn test_load_frame_and_detections() {
        let dir = tempfile::tempdir().unwrap();
        write_sequence(dir.path());
        fs::create_dir_all(dir.path().join("color")).unwrap();
        fs::create_dir_all(dir.path().join("depth")).unwrap();
        fs::create_dir_all(dir.path().join("pred")).unwrap();

        RgbImage::from_pixel(8, 6, image::Rgb([10, 20, 30]))
            .save(dir.path().join("color/frame-000000.png"))
            .unwrap();
        ImageBuffer::<Luma<u16>, Vec<u16>>::from_pixel(8, 6, Luma([1500]))
            .save(dir.path().join("depth/frame-000000.png"))
            .unwrap();
        fs::write(
            dir.path().join("pred/frame-000000.csv"),
            "label,score,u_min,v_min,u_max,v_max\nchair,0.9,1,1,5,4\n",
        )
        .unwrap();

        let table = SequenceTable::load(dir.path(), "pred").unwrap();
        let frame = table.load_frame(&table.entries[0]).unwrap();
        assert_eq!(frame.detections.len(), 1);
        assert_eq!(frame.detections[0].label, "chair");
        assert_eq!(frame.rgbd.depth.get_pixel(3, 3)[0], 1500);

        // Missing detections is a per-frame error.
        assert!(table.load_frame(&table.entries[1]).is_err());
    }
}
