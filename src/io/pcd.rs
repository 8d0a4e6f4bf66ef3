//! PCD v0.7 point cloud files.
//!
//! Covers the subset of the format the engine needs to persist and
//! reload its feature maps: `ascii` and `binary` data sections with
//! per-field scalar counts. The lzf-compressed `binary_compressed`
//! variant is rejected at load time.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;

use crate::core::types::{Point, PointCloud};
use crate::error::SlamError;

/// On-disk representation of a saved map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PcdFormat {
    /// Human-readable, one point per line.
    Ascii,
    /// Packed little-endian binary.
    Binary,
}

const FIELDS: &str = "x y z intensity time laser_id";
const SIZES: &str = "8 8 8 4 8 1";
const TYPES: &str = "F F F F F U";
const COUNTS: &str = "1 1 1 1 1 1";

/// Write a cloud to a PCD file.
pub fn save_pcd(path: &Path, cloud: &PointCloud, format: PcdFormat) -> Result<(), SlamError> {
    let file = File::create(path)?;
    let mut out = BufWriter::new(file);

    let data = match format {
        PcdFormat::Ascii => "ascii",
        PcdFormat::Binary => "binary",
    };
    write!(
        out,
        "# .PCD v0.7 - Point Cloud Data file format\n\
         VERSION 0.7\n\
         FIELDS {FIELDS}\n\
         SIZE {SIZES}\n\
         TYPE {TYPES}\n\
         COUNT {COUNTS}\n\
         WIDTH {n}\n\
         HEIGHT 1\n\
         VIEWPOINT 0 0 0 1 0 0 0\n\
         POINTS {n}\n\
         DATA {data}\n",
        n = cloud.len(),
    )?;

    match format {
        PcdFormat::Ascii => {
            for p in &cloud.points {
                writeln!(
                    out,
                    "{} {} {} {} {} {}",
                    p.x, p.y, p.z, p.intensity, p.time, p.laser_id
                )?;
            }
        }
        PcdFormat::Binary => {
            for p in &cloud.points {
                out.write_all(&p.x.to_le_bytes())?;
                out.write_all(&p.y.to_le_bytes())?;
                out.write_all(&p.z.to_le_bytes())?;
                out.write_all(&p.intensity.to_le_bytes())?;
                out.write_all(&p.time.to_le_bytes())?;
                out.write_all(&[p.laser_id])?;
            }
        }
    }
    out.flush()?;
    Ok(())
}

/// Parsed PCD header.
struct Header {
    fields: Vec<String>,
    sizes: Vec<usize>,
    types: Vec<char>,
    points: usize,
    data: String,
}

fn format_error(path: &Path, reason: impl Into<String>) -> SlamError {
    SlamError::MapLoadFormat {
        path: path.display().to_string(),
        reason: reason.into(),
    }
}

/// Read a cloud from a PCD file.
///
/// The loaded cloud carries the `world` frame id; missing optional
/// fields (`intensity`, `time`, `laser_id`) default to zero.
pub fn load_pcd(path: &Path) -> Result<PointCloud, SlamError> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);

    let header = parse_header(path, &mut reader)?;
    if header.fields.len() != header.sizes.len() || header.fields.len() != header.types.len() {
        return Err(format_error(path, "FIELDS/SIZE/TYPE lengths disagree"));
    }
    let find = |name: &str| header.fields.iter().position(|f| f == name);
    let ix = find("x").ok_or_else(|| format_error(path, "missing field x"))?;
    let iy = find("y").ok_or_else(|| format_error(path, "missing field y"))?;
    let iz = find("z").ok_or_else(|| format_error(path, "missing field z"))?;
    let ii = find("intensity");
    let it = find("time");
    let il = find("laser_id");

    let mut cloud = PointCloud::with_capacity("world", 0.0, 0, header.points);

    match header.data.as_str() {
        "ascii" => {
            let mut line = String::new();
            for row in 0..header.points {
                line.clear();
                if reader.read_line(&mut line)? == 0 {
                    return Err(format_error(
                        path,
                        format!("expected {} points, file ends at {row}", header.points),
                    ));
                }
                let values: Vec<f64> = line
                    .split_whitespace()
                    .map(str::parse::<f64>)
                    .collect::<Result<_, _>>()
                    .map_err(|e| format_error(path, format!("row {row}: {e}")))?;
                if values.len() != header.fields.len() {
                    return Err(format_error(path, format!("row {row}: wrong field count")));
                }
                cloud.push(Point::new(
                    values[ix],
                    values[iy],
                    values[iz],
                    it.map_or(0.0, |i| values[i]),
                    il.map_or(0, |i| values[i] as u8),
                    ii.map_or(0.0, |i| values[i] as f32),
                ));
            }
        }
        "binary" => {
            let stride: usize = header.sizes.iter().sum();
            let mut buffer = vec![0u8; stride * header.points];
            reader
                .read_exact(&mut buffer)
                .map_err(|_| format_error(path, "binary payload shorter than POINTS"))?;

            let mut offsets = Vec::with_capacity(header.fields.len());
            let mut offset = 0;
            for &size in &header.sizes {
                offsets.push(offset);
                offset += size;
            }
            let read_scalar = |record: &[u8], field: usize| -> Result<f64, SlamError> {
                let start = offsets[field];
                let size = header.sizes[field];
                let bytes = &record[start..start + size];
                match (header.types[field], size) {
                    ('F', 8) => Ok(f64::from_le_bytes(bytes.try_into().unwrap_or_default())),
                    ('F', 4) => Ok(f32::from_le_bytes(bytes.try_into().unwrap_or_default()) as f64),
                    ('U', 1) => Ok(bytes[0] as f64),
                    ('U', 2) => Ok(u16::from_le_bytes(bytes.try_into().unwrap_or_default()) as f64),
                    ('U', 4) => Ok(u32::from_le_bytes(bytes.try_into().unwrap_or_default()) as f64),
                    ('I', 4) => Ok(i32::from_le_bytes(bytes.try_into().unwrap_or_default()) as f64),
                    (t, s) => Err(format_error(path, format!("unsupported field type {t}{s}"))),
                }
            };

            for row in 0..header.points {
                let record = &buffer[row * stride..(row + 1) * stride];
                cloud.push(Point::new(
                    read_scalar(record, ix)?,
                    read_scalar(record, iy)?,
                    read_scalar(record, iz)?,
                    it.map(|i| read_scalar(record, i)).transpose()?.unwrap_or(0.0),
                    il.map(|i| read_scalar(record, i)).transpose()?.unwrap_or(0.0) as u8,
                    ii.map(|i| read_scalar(record, i)).transpose()?.unwrap_or(0.0) as f32,
                ));
            }
        }
        "binary_compressed" => {
            return Err(format_error(path, "binary_compressed data is not supported"));
        }
        other => {
            return Err(format_error(path, format!("unknown DATA section '{other}'")));
        }
    }

    Ok(cloud)
}

fn parse_header(path: &Path, reader: &mut BufReader<File>) -> Result<Header, SlamError> {
    let mut fields = None;
    let mut sizes = None;
    let mut types = None;
    let mut counts: Option<Vec<usize>> = None;
    let mut points = None;
    let mut line = String::new();

    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            return Err(format_error(path, "header ends before DATA"));
        }
        let trimmed = line.trim();
        if trimmed.starts_with('#') || trimmed.is_empty() {
            continue;
        }
        let mut tokens = trimmed.split_whitespace();
        let keyword = tokens.next().unwrap_or_default();
        let rest: Vec<&str> = tokens.collect();
        match keyword {
            "VERSION" | "WIDTH" | "HEIGHT" | "VIEWPOINT" => {}
            "FIELDS" => fields = Some(rest.iter().map(|s| s.to_string()).collect::<Vec<_>>()),
            "SIZE" => {
                sizes = Some(
                    rest.iter()
                        .map(|s| s.parse::<usize>())
                        .collect::<Result<Vec<_>, _>>()
                        .map_err(|e| format_error(path, format!("bad SIZE: {e}")))?,
                )
            }
            "TYPE" => {
                types = Some(
                    rest.iter()
                        .map(|s| s.chars().next().unwrap_or('?'))
                        .collect::<Vec<_>>(),
                )
            }
            "COUNT" => {
                counts = Some(
                    rest.iter()
                        .map(|s| s.parse::<usize>())
                        .collect::<Result<Vec<_>, _>>()
                        .map_err(|e| format_error(path, format!("bad COUNT: {e}")))?,
                )
            }
            "POINTS" => {
                points = Some(
                    rest.first()
                        .and_then(|s| s.parse::<usize>().ok())
                        .ok_or_else(|| format_error(path, "bad POINTS"))?,
                )
            }
            "DATA" => {
                let data = rest
                    .first()
                    .map(|s| s.to_string())
                    .ok_or_else(|| format_error(path, "bad DATA"))?;
                if let Some(counts) = &counts {
                    if counts.iter().any(|&c| c != 1) {
                        return Err(format_error(path, "multi-count fields are not supported"));
                    }
                }
                return Ok(Header {
                    fields: fields.ok_or_else(|| format_error(path, "missing FIELDS"))?,
                    sizes: sizes.ok_or_else(|| format_error(path, "missing SIZE"))?,
                    types: types.ok_or_else(|| format_error(path, "missing TYPE"))?,
                    points: points.ok_or_else(|| format_error(path, "missing POINTS"))?,
                    data,
                });
            }
            other => {
                return Err(format_error(path, format!("unknown header keyword '{other}'")));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sample_cloud() -> PointCloud {
        let mut cloud = PointCloud::new("world", 0.0, 0);
        cloud.push(Point::new(1.0, -2.5, 0.25, 0.01, 3, 17.5));
        cloud.push(Point::new(-4.0, 0.0, 2.0, 0.05, 12, 0.0));
        cloud.push(Point::new(0.0, 0.0, 0.0, 0.0, 0, 255.0));
        cloud
    }

    fn assert_clouds_equal(a: &PointCloud, b: &PointCloud) {
        assert_eq!(a.len(), b.len());
        for (pa, pb) in a.points.iter().zip(b.points.iter()) {
            assert_relative_eq!(pa.x, pb.x, epsilon = 1e-12);
            assert_relative_eq!(pa.y, pb.y, epsilon = 1e-12);
            assert_relative_eq!(pa.z, pb.z, epsilon = 1e-12);
            assert_relative_eq!(pa.time, pb.time, epsilon = 1e-12);
            assert_eq!(pa.laser_id, pb.laser_id);
            assert_relative_eq!(pa.intensity, pb.intensity);
        }
    }

    #[test]
    fn test_ascii_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("map.pcd");
        let cloud = sample_cloud();
        save_pcd(&path, &cloud, PcdFormat::Ascii).unwrap();
        let back = load_pcd(&path).unwrap();
        assert_clouds_equal(&cloud, &back);
    }

    #[test]
    fn test_binary_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("map.pcd");
        let cloud = sample_cloud();
        save_pcd(&path, &cloud, PcdFormat::Binary).unwrap();
        let back = load_pcd(&path).unwrap();
        assert_clouds_equal(&cloud, &back);
    }

    #[test]
    fn test_empty_cloud_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.pcd");
        let cloud = PointCloud::new("world", 0.0, 0);
        save_pcd(&path, &cloud, PcdFormat::Binary).unwrap();
        let back = load_pcd(&path).unwrap();
        assert!(back.is_empty());
    }

    #[test]
    fn test_binary_compressed_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("compressed.pcd");
        std::fs::write(
            &path,
            "VERSION 0.7\nFIELDS x y z\nSIZE 4 4 4\nTYPE F F F\nCOUNT 1 1 1\n\
             WIDTH 0\nHEIGHT 1\nPOINTS 0\nDATA binary_compressed\n",
        )
        .unwrap();
        assert!(matches!(
            load_pcd(&path),
            Err(SlamError::MapLoadFormat { .. })
        ));
    }

    #[test]
    fn test_truncated_payload_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.pcd");
        std::fs::write(
            &path,
            "VERSION 0.7\nFIELDS x y z\nSIZE 8 8 8\nTYPE F F F\nCOUNT 1 1 1\n\
             WIDTH 5\nHEIGHT 1\nPOINTS 5\nDATA binary\nxx",
        )
        .unwrap();
        assert!(matches!(
            load_pcd(&path),
            Err(SlamError::MapLoadFormat { .. })
        ));
    }

    #[test]
    fn test_garbage_header_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("garbage.pcd");
        std::fs::write(&path, "not a pcd file at all\n").unwrap();
        assert!(matches!(
            load_pcd(&path),
            Err(SlamError::MapLoadFormat { .. })
        ));
    }

    #[test]
    fn test_missing_field_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nofield.pcd");
        std::fs::write(
            &path,
            "VERSION 0.7\nFIELDS x y\nSIZE 8 8\nTYPE F F\nCOUNT 1 1\n\
             WIDTH 0\nHEIGHT 1\nPOINTS 0\nDATA ascii\n",
        )
        .unwrap();
        assert!(matches!(
            load_pcd(&path),
            Err(SlamError::MapLoadFormat { .. })
        ));
    }
}
