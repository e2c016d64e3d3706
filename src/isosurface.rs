use crate::grid::VoxelGridSamples;
use crate::Real;
use fnv::FnvHashMap;
use itertools::iproduct;
use na::{Point3, Vector3};

/// Splits a cube into six tetrahedra sharing its `0-7` diagonal.
///
/// Corner `c` of a cube is offset by `(c & 1, (c >> 1) & 1, (c >> 2) & 1)`. Neighboring
/// cubes split their shared faces the same way, so the extracted surface is watertight.
const CUBE_TETRAHEDRA: [[usize; 4]; 6] = [
    [0, 1, 3, 7],
    [0, 1, 5, 7],
    [0, 2, 3, 7],
    [0, 2, 6, 7],
    [0, 4, 5, 7],
    [0, 4, 6, 7],
];

/// An indexed triangle mesh with per-vertex normals.
#[derive(Clone, Debug, Default, PartialEq)]
#[cfg_attr(
    feature = "serde-serialize",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct TriangleMesh {
    /// The vertex positions.
    pub vertices: Vec<Point3<Real>>,
    /// One unit normal per vertex (zero where undefined).
    pub normals: Vec<Vector3<Real>>,
    /// Counterclockwise triangles, seen from the side the normals point to.
    pub faces: Vec<[u32; 3]>,
}

impl TriangleMesh {
    /// Does this mesh have no triangle?
    pub fn is_empty(&self) -> bool {
        self.faces.is_empty()
    }

    /// Replaces the normals by the area-weighted average of the adjacent face normals.
    pub fn recompute_normals(&mut self) {
        let mut normals = vec![Vector3::zeros(); self.vertices.len()];

        for face in &self.faces {
            let [a, b, c] = face.map(|i| self.vertices[i as usize]);
            let area_normal = (b - a).cross(&(c - a));
            for i in face {
                normals[*i as usize] += area_normal;
            }
        }

        self.normals = normals
            .into_iter()
            .map(|n| n.try_normalize(0.0).unwrap_or_else(Vector3::zeros))
            .collect();
    }
}

struct MeshBuilder {
    level: Real,
    vertex_ids: FnvHashMap<(usize, usize), u32>,
    mesh: TriangleMesh,
}

impl MeshBuilder {
    /// The vertex where the level set crosses the edge between two voxel centers.
    fn edge_vertex(&mut self, a: Corner, b: Corner) -> u32 {
        let key = (a.id.min(b.id), a.id.max(b.id));

        if let Some(id) = self.vertex_ids.get(&key) {
            return *id;
        }

        let t = ((self.level - a.value) / (b.value - a.value)).clamp(0.0, 1.0);
        let id = self.mesh.vertices.len() as u32;
        self.mesh.vertices.push(a.pos + (b.pos - a.pos) * t);
        self.vertex_ids.insert(key, id);
        id
    }

    fn push_triangle(&mut self, mut tri: [u32; 3], outward: &Vector3<Real>) {
        let [a, b, c] = tri.map(|i| self.mesh.vertices[i as usize]);
        let normal = (b - a).cross(&(c - a));

        if normal.norm_squared() == 0.0 {
            return;
        }
        if normal.dot(outward) < 0.0 {
            tri.swap(1, 2);
        }

        self.mesh.faces.push(tri);
    }

    fn polygonize(&mut self, tet: [Corner; 4]) {
        let (inside, outside): (Vec<_>, Vec<_>) =
            tet.iter().copied().partition(|c| c.value > self.level);

        if inside.is_empty() || outside.is_empty() {
            return;
        }

        let centroid = |corners: &[Corner]| {
            corners.iter().map(|c| c.pos.coords).sum::<Vector3<Real>>() / corners.len() as Real
        };
        let outward = centroid(&inside) - centroid(&outside);

        match (inside.len(), outside.len()) {
            (1, 3) | (3, 1) => {
                let (apex, base) = if inside.len() == 1 {
                    (inside[0], &outside)
                } else {
                    (outside[0], &inside)
                };
                let tri = [
                    self.edge_vertex(apex, base[0]),
                    self.edge_vertex(apex, base[1]),
                    self.edge_vertex(apex, base[2]),
                ];
                self.push_triangle(tri, &outward);
            }
            _ => {
                let (p0, p1, n0, n1) = (inside[0], inside[1], outside[0], outside[1]);
                let quad = [
                    self.edge_vertex(p0, n0),
                    self.edge_vertex(p0, n1),
                    self.edge_vertex(p1, n1),
                    self.edge_vertex(p1, n0),
                ];
                self.push_triangle([quad[0], quad[1], quad[2]], &outward);
                self.push_triangle([quad[0], quad[2], quad[3]], &outward);
            }
        }
    }
}

#[derive(Copy, Clone, Debug)]
struct Corner {
    id: usize,
    pos: Point3<Real>,
    value: Real,
}

/// Extracts the `level` isosurface of a sampled field by marching tetrahedra.
///
/// The cells are the cubes joining eight neighboring voxel centers. Triangles are oriented
/// towards values above `level`, and vertices are shared between adjacent triangles.
pub fn extract_isosurface(samples: &VoxelGridSamples, level: Real) -> TriangleMesh {
    let grid = samples.grid();
    let dims = grid.dims();
    let mut builder = MeshBuilder {
        level,
        vertex_ids: FnvHashMap::default(),
        mesh: TriangleMesh::default(),
    };

    let cubes = iproduct!(
        0..dims.x.saturating_sub(1),
        0..dims.y.saturating_sub(1),
        0..dims.z.saturating_sub(1)
    );

    for (i, j, k) in cubes {
        let corners: [Corner; 8] = std::array::from_fn(|c| {
            let (ci, cj, ck) = (i + (c & 1), j + ((c >> 1) & 1), k + ((c >> 2) & 1));
            Corner {
                id: grid.linear_index(ci, cj, ck),
                pos: grid.voxel_center(ci, cj, ck),
                value: samples.value(ci, cj, ck),
            }
        });

        let has_inside = corners.iter().any(|c| c.value > level);
        let has_outside = corners.iter().any(|c| c.value <= level);
        if !(has_inside && has_outside) {
            continue;
        }

        for tet in CUBE_TETRAHEDRA {
            builder.polygonize(tet.map(|c| corners[c]));
        }
    }

    let mut mesh = builder.mesh;
    mesh.recompute_normals();
    tracing::info!(
        "Extracted isosurface with {} vertices and {} triangles",
        mesh.vertices.len(),
        mesh.faces.len()
    );
    mesh
}
