//! Reading input point clouds and writing the reconstruction artifacts.
//!
//! Point clouds are read from PLY files (`x y z nx ny nz` vertex properties, float or
//! double) or from whitespace-separated text files with six values per line. Meshes and
//! point sets are written as binary PLY; sampled grids as NPY arrays.

use crate::error::{ReconstructionError, Result};
use crate::grid::VoxelGridSamples;
use crate::isosurface::TriangleMesh;
use crate::point_set::PointSet;
use crate::Real;
use na::{Point3, Vector3};
use ply_rs::parser;
use ply_rs::ply::{
    self, Addable, DefaultElement, ElementDef, Encoding, Ply, Property, PropertyDef,
    PropertyType, ScalarType,
};
use ply_rs::writer::Writer;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

/// Normals shorter than this are considered missing and their point is dropped.
pub const MIN_NORMAL_NORM: Real = 1.0e-5;

const HAS_POSITION: u8 = 0b000111;
const HAS_NORMAL: u8 = 0b111000;

#[derive(Default)]
struct OrientedVertex {
    pos: Point3<Real>,
    normal: Vector3<Real>,
    seen: u8,
}

fn scalar(property: Property) -> Option<Real> {
    match property {
        Property::Float(v) => Some(v as Real),
        Property::Double(v) => Some(v),
        Property::Char(v) => Some(v as Real),
        Property::UChar(v) => Some(v as Real),
        Property::Short(v) => Some(v as Real),
        Property::UShort(v) => Some(v as Real),
        Property::Int(v) => Some(v as Real),
        Property::UInt(v) => Some(v as Real),
        _ => None,
    }
}

impl ply::PropertyAccess for OrientedVertex {
    fn new() -> Self {
        Self::default()
    }

    fn set_property(&mut self, key: String, property: Property) {
        let slot = match key.as_ref() {
            "x" => 0,
            "y" => 1,
            "z" => 2,
            "nx" => 3,
            "ny" => 4,
            "nz" => 5,
            _ => return,
        };

        if let Some(value) = scalar(property) {
            if slot < 3 {
                self.pos[slot] = value;
            } else {
                self.normal[slot - 3] = value;
            }
            self.seen |= 1 << slot;
        }
    }
}

/// Reads an oriented point cloud, picking the format from the file extension.
///
/// Files ending in `.ply` are parsed as PLY, anything else as text with six
/// whitespace-separated values per line.
pub fn read_point_cloud(path: impl AsRef<Path>) -> Result<PointSet<Real>> {
    let path = path.as_ref();
    let mut reader = BufReader::new(File::open(path)?);
    let is_ply = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("ply"));

    let points = if is_ply {
        read_ply_points(&mut reader)?
    } else {
        read_text_points(reader)?
    };

    tracing::info!("Loaded {} oriented points from {}", points.len(), path.display());
    Ok(points)
}

/// Reads the `vertex` element of a PLY stream.
pub fn read_ply_points(reader: &mut impl BufRead) -> Result<PointSet<Real>> {
    let vertex_parser = parser::Parser::<OrientedVertex>::new();
    let header = vertex_parser
        .read_header(reader)
        .map_err(|e| ReconstructionError::Ply(e.to_string()))?;

    let mut vertices = None;
    for (_, element) in &header.elements {
        let payload = vertex_parser
            .read_payload_for_element(reader, element, &header)
            .map_err(|e| ReconstructionError::Ply(e.to_string()))?;

        // Elements are stored in sequence: the ones before `vertex` still have to be read.
        if element.name == "vertex" {
            vertices = Some(payload);
            break;
        }
    }

    let vertices =
        vertices.ok_or_else(|| ReconstructionError::Ply("no vertex element".to_string()))?;

    if let Some(v) = vertices.iter().find(|v| v.seen & HAS_POSITION != HAS_POSITION) {
        return Err(ReconstructionError::input(format!(
            "vertex is missing coordinates (properties found: {:#08b})",
            v.seen
        )));
    }
    if vertices.iter().any(|v| v.seen & HAS_NORMAL != HAS_NORMAL) {
        return Err(ReconstructionError::input(
            "the point cloud must have nx, ny and nz vertex properties",
        ));
    }

    orient(vertices.iter().map(|v| (v.pos, v.normal)))
}

/// Reads lines of `x y z nx ny nz`. Empty lines and lines starting with `#` are skipped.
pub fn read_text_points(reader: impl BufRead) -> Result<PointSet<Real>> {
    let mut vertices = vec![];

    for (line_id, line) in reader.lines().enumerate() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let values = line
            .split_whitespace()
            .map(|elt| elt.parse::<Real>())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| ReconstructionError::input(format!("line {}: {e}", line_id + 1)))?;

        if values.len() < 6 {
            return Err(ReconstructionError::input(format!(
                "line {}: expected 6 values, found {}",
                line_id + 1,
                values.len()
            )));
        }

        vertices.push((
            Point3::new(values[0], values[1], values[2]),
            Vector3::new(values[3], values[4], values[5]),
        ));
    }

    orient(vertices.into_iter())
}

/// Drops the points with non-finite coordinates or without a usable normal, and
/// normalizes the other normals.
fn orient(vertices: impl Iterator<Item = (Point3<Real>, Vector3<Real>)>) -> Result<PointSet<Real>> {
    let mut positions = vec![];
    let mut normals = vec![];
    let mut non_finite = 0;
    let mut degenerate = 0;

    for (pos, normal) in vertices {
        if !pos.iter().chain(normal.iter()).all(|e| e.is_finite()) {
            non_finite += 1;
            continue;
        }

        match normal.try_normalize(MIN_NORMAL_NORM) {
            Some(normal) => {
                positions.push(pos);
                normals.push(normal);
            }
            None => degenerate += 1,
        }
    }

    if non_finite > 0 {
        tracing::warn!("Dropped {} points with non-finite coordinates", non_finite);
    }
    if degenerate > 0 {
        tracing::warn!("Dropped {} points with degenerate normals", degenerate);
    }

    PointSet::new(positions, normals)
}

fn float_property(name: &str) -> PropertyDef {
    PropertyDef::new(name.to_string(), PropertyType::Scalar(ScalarType::Float))
}

fn vertex_element(
    positions: &[Point3<Real>],
    normals: Option<&[Vector3<Real>]>,
    extra: Option<(&str, &[Real])>,
) -> (ElementDef, Vec<DefaultElement>) {
    let mut def = ElementDef::new("vertex".to_string());
    for name in ["x", "y", "z"] {
        def.properties.add(float_property(name));
    }
    if normals.is_some() {
        for name in ["nx", "ny", "nz"] {
            def.properties.add(float_property(name));
        }
    }
    if let Some((name, _)) = extra {
        def.properties.add(float_property(name));
    }

    let payload = positions
        .iter()
        .enumerate()
        .map(|(i, pt)| {
            let mut vertex = DefaultElement::new();
            vertex.insert("x".to_string(), Property::Float(pt.x as f32));
            vertex.insert("y".to_string(), Property::Float(pt.y as f32));
            vertex.insert("z".to_string(), Property::Float(pt.z as f32));

            if let Some(normals) = normals {
                let n = normals[i];
                vertex.insert("nx".to_string(), Property::Float(n.x as f32));
                vertex.insert("ny".to_string(), Property::Float(n.y as f32));
                vertex.insert("nz".to_string(), Property::Float(n.z as f32));
            }
            if let Some((name, values)) = extra {
                vertex.insert(name.to_string(), Property::Float(values[i] as f32));
            }

            vertex
        })
        .collect();

    (def, payload)
}

fn write_ply(out: &mut impl Write, mut ply: Ply<DefaultElement>) -> Result<()> {
    ply.header.encoding = Encoding::BinaryLittleEndian;
    ply.make_consistent()
        .map_err(|e| ReconstructionError::Ply(format!("{e:?}")))?;
    Writer::<DefaultElement>::new().write_ply(out, &mut ply)?;
    Ok(())
}

/// Writes a triangle mesh with its vertex normals.
pub fn write_mesh_ply(out: &mut impl Write, mesh: &TriangleMesh) -> Result<()> {
    let mut ply = Ply::<DefaultElement>::new();
    ply.header
        .comments
        .push("reconstructed with neural splines".to_string());

    let normals = (mesh.normals.len() == mesh.vertices.len()).then_some(&mesh.normals[..]);
    let (vertex_def, vertices) = vertex_element(&mesh.vertices, normals, None);
    ply.header.elements.add(vertex_def);
    ply.payload.insert("vertex".to_string(), vertices);

    let mut face_def = ElementDef::new("face".to_string());
    face_def.properties.add(PropertyDef::new(
        "vertex_indices".to_string(),
        PropertyType::List(ScalarType::UChar, ScalarType::Int),
    ));
    ply.header.elements.add(face_def);

    let faces = mesh
        .faces
        .iter()
        .map(|face| {
            let mut element = DefaultElement::new();
            element.insert(
                "vertex_indices".to_string(),
                Property::ListInt(face.iter().map(|i| *i as i32).collect()),
            );
            element
        })
        .collect();
    ply.payload.insert("face".to_string(), faces);

    write_ply(out, ply)
}

/// Writes points with optional normals and an optional extra scalar property per point.
pub fn write_points_ply(
    out: &mut impl Write,
    positions: &[Point3<Real>],
    normals: Option<&[Vector3<Real>]>,
    extra: Option<(&str, &[Real])>,
) -> Result<()> {
    let mut ply = Ply::<DefaultElement>::new();
    let (vertex_def, vertices) = vertex_element(positions, normals, extra);
    ply.header.elements.add(vertex_def);
    ply.payload.insert("vertex".to_string(), vertices);
    write_ply(out, ply)
}

/// Writes the grid values as a little-endian `f64` NPY array of shape `[nx, ny, nz]`.
pub fn write_grid_npy(out: &mut impl Write, samples: &VoxelGridSamples) -> Result<()> {
    let dims = samples.grid().dims();
    let mut header = format!(
        "{{'descr': '<f8', 'fortran_order': False, 'shape': ({}, {}, {}), }}",
        dims.x, dims.y, dims.z
    );
    // Magic (6 bytes), version (2), header length (2), then the header padded so that the
    // data starts on a 64-byte boundary.
    let unpadded = 10 + header.len() + 1;
    header.extend(std::iter::repeat(' ').take((64 - unpadded % 64) % 64));
    header.push('\n');

    let mut out = BufWriter::new(out);
    out.write_all(b"\x93NUMPY\x01\x00")?;
    out.write_all(&(header.len() as u16).to_le_bytes())?;
    out.write_all(header.as_bytes())?;
    for value in samples.values() {
        out.write_all(&value.to_le_bytes())?;
    }
    out.flush()?;
    Ok(())
}

/// Creates `path` and hands a buffered writer to `write`.
pub fn write_file(
    path: impl AsRef<Path>,
    write: impl FnOnce(&mut BufWriter<File>) -> Result<()>,
) -> Result<()> {
    let path = path.as_ref();
    let mut out = BufWriter::new(File::create(path)?);
    write(&mut out)?;
    out.flush()?;
    tracing::info!("Wrote {}", path.display());
    Ok(())
}
