use crate::error::Result;
use crate::hgrid::HGrid;
use crate::point_set::PointSet;
use crate::Real;
use na::{Point3, Vector3};

/// Replaces all the points falling into the same cubic voxel by their average.
///
/// Normals are averaged too and re-normalized when the average is not degenerate. Voxels
/// are emitted in lexicographic order of their grid coordinates, so the output does not
/// depend on the input order beyond the averaging itself.
pub fn downsample_voxel_grid(
    points: &PointSet<Real>,
    origin: Point3<Real>,
    voxel_size: Real,
) -> Result<PointSet<Real>> {
    let mut grid = HGrid::new(origin, voxel_size);

    for (pid, pt) in points.positions().iter().enumerate() {
        grid.insert(pt, pid);
    }

    let mut cells: Vec<_> = grid.cells().collect();
    cells.sort_by_key(|(key, _)| (key.x, key.y, key.z));

    let mut positions = Vec::with_capacity(cells.len());
    let mut normals = Vec::with_capacity(cells.len());

    for (_, ids) in cells {
        let weight = 1.0 / ids.len() as Real;
        let mut center = Vector3::zeros();
        let mut normal = Vector3::zeros();

        for id in ids {
            center += points.positions()[*id].coords;
            normal += points.normals()[*id];
        }

        positions.push(Point3::from(center * weight));
        normals.push(normal.try_normalize(1.0e-12).unwrap_or(normal * weight));
    }

    tracing::debug!(
        "Voxel downsampling kept {} of {} points",
        positions.len(),
        points.len()
    );
    PointSet::new(positions, normals)
}
