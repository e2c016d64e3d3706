// Spatial hashing of points into cubic cells, used by the voxel downsampling filter and
// the blue-noise landmark sampler.

use fnv::FnvHasher;

use std::collections::HashMap;
use std::hash::BuildHasher;

use crate::Real;
use na::Point3;

/// Hasher with a fixed key so that iteration order is reproducible across runs.
#[derive(Copy, Clone, Debug, Default)]
pub struct DeterministicState;

impl BuildHasher for DeterministicState {
    type Hasher = FnvHasher;

    fn build_hasher(&self) -> FnvHasher {
        FnvHasher::with_key(1820)
    }
}

/// A sparse grid of cubic cells, each holding the elements inserted at points inside it.
#[derive(PartialEq, Debug, Clone)]
pub struct HGrid<T> {
    cells: HashMap<Point3<i64>, Vec<T>, DeterministicState>,
    origin: Point3<Real>,
    cell_width: Real,
}

impl<T> HGrid<T> {
    /// A grid with cells of width `cell_width`, the cell `(0, 0, 0)` starting at `origin`.
    pub fn new(origin: Point3<Real>, cell_width: Real) -> Self {
        Self {
            cells: HashMap::with_hasher(DeterministicState),
            origin,
            cell_width,
        }
    }

    fn quantify(value: Real, cell_width: Real) -> i64 {
        (value / cell_width).floor() as i64
    }

    /// The logical cell containing `point`.
    pub fn key(&self, point: &Point3<Real>) -> Point3<i64> {
        Point3::from((point - self.origin).map(|e| Self::quantify(e, self.cell_width)))
    }

    pub fn insert(&mut self, point: &Point3<Real>, element: T) {
        let key = self.key(point);
        self.cells.entry(key).or_default().push(element)
    }

    /// The non-empty cells, in deterministic (but unspecified) order.
    pub fn cells(&self) -> impl Iterator<Item = (&Point3<i64>, &Vec<T>)> {
        self.cells.iter()
    }

    /// The elements of every non-empty cell at most `radius` cells away from `cell`
    /// along each axis, `cell` included.
    pub fn neighbors(&self, cell: &Point3<i64>, radius: i64) -> impl Iterator<Item = &T> {
        let cells = &self.cells;
        CellRangeIterator::with_center(*cell, radius)
            .filter_map(move |key| cells.get(&key))
            .flatten()
    }
}

struct CellRangeIterator {
    start: Point3<i64>,
    end: Point3<i64>,
    curr: Point3<i64>,
    done: bool,
}

impl CellRangeIterator {
    fn with_center(center: Point3<i64>, radius: i64) -> Self {
        let start = center.map(|e| e.saturating_sub(radius));
        Self {
            start,
            end: center.map(|e| e.saturating_add(radius)),
            curr: start,
            done: false,
        }
    }
}

impl Iterator for CellRangeIterator {
    type Item = Point3<i64>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        if self.curr == self.end {
            self.done = true;
            Some(self.curr)
        } else {
            let result = self.curr;

            for i in 0..3 {
                if self.curr[i] == self.end[i] {
                    self.curr[i] = self.start[i];
                } else {
                    self.curr[i] += 1;
                    break;
                }
            }

            Some(result)
        }
    }
}
