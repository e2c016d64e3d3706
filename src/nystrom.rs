use crate::config::{NystromConfig, NystromMode};
use crate::error::{ReconstructionError, Result};
use crate::hgrid::HGrid;
use crate::point_set::PointSet;
use crate::{Real, Scalar};
use fnv::FnvHashSet;
use na::{Point3, Vector3};
use parry::bounding_volume::Aabb;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;

/// Bisection steps on the Poisson-disk radius of the blue-noise sampler.
const BLUE_NOISE_BISECTION_STEPS: usize = 32;

/// The landmark points anchoring one kernel basis function each.
///
/// Landmarks are drawn from the constraint points of the regression (see
/// [`PointSet::constraint_points`]), so the basis spans both the on-surface points and
/// their copies shifted along the normals.
#[derive(Clone, Debug, PartialEq)]
pub struct NystromBasis<T: na::Scalar = Real> {
    points: PointSet<T>,
    indices: Vec<usize>,
}

impl<T: Scalar> NystromBasis<T> {
    /// Number of landmarks.
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Is this basis empty?
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// The landmark positions.
    pub fn positions(&self) -> &[Point3<T>] {
        self.points.positions()
    }

    /// The normals of the oriented points the landmarks were generated from.
    pub fn normals(&self) -> &[Vector3<T>] {
        self.points.normals()
    }

    /// The landmarks as an oriented point set.
    pub fn points(&self) -> &PointSet<T> {
        &self.points
    }

    /// Index of each landmark in the point set it was sampled from.
    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    /// Converts the landmarks to another precision.
    pub fn cast<U: Scalar>(&self) -> NystromBasis<U> {
        NystromBasis {
            points: self.points.cast(),
            indices: self.indices.clone(),
        }
    }
}

/// Selects landmark points from an oriented point set.
///
/// Every strategy is deterministic for a given seed, point set and sample count.
#[derive(Copy, Clone, Debug)]
pub struct NystromSampler {
    config: NystromConfig,
}

impl NystromSampler {
    /// A sampler following `config`.
    pub fn new(config: NystromConfig) -> Self {
        Self { config }
    }

    /// Picks at most `num_samples` distinct landmarks from `points`.
    ///
    /// If `points` has fewer distinct positions than requested (or if `num_samples` is
    /// zero) every distinct position becomes a landmark.
    pub fn sample(&self, points: &PointSet<Real>) -> Result<NystromBasis<Real>> {
        if points.is_empty() {
            return Err(ReconstructionError::input(
                "cannot select Nystrom samples from an empty point set",
            ));
        }

        let distinct = distinct_indices(points.positions());
        let target = self.config.num_samples;

        let indices = if target == 0 || target >= distinct.len() {
            if target > distinct.len() {
                tracing::warn!(
                    "Requested {} Nystrom samples but the input has only {} distinct points",
                    target,
                    distinct.len()
                );
            }
            distinct
        } else {
            let mut rng = StdRng::seed_from_u64(self.config.seed);
            let positions = points.positions();

            match self.config.mode {
                NystromMode::Random => {
                    let mut shuffled = distinct;
                    shuffled.shuffle(&mut rng);
                    shuffled.truncate(target);
                    shuffled.sort_unstable();
                    shuffled
                }
                NystromMode::BlueNoise => blue_noise(positions, &distinct, target, &mut rng),
                NystromMode::KMeans => k_means(
                    positions,
                    &distinct,
                    target,
                    self.config.kmeans_iterations,
                    &mut rng,
                ),
            }
        };

        tracing::info!(
            "Selected {} Nystrom samples ({} mode)",
            indices.len(),
            self.config.mode
        );

        Ok(NystromBasis {
            points: points.select(&indices),
            indices,
        })
    }
}

/// Indices of the first occurrence of every distinct position, in input order.
fn distinct_indices(positions: &[Point3<Real>]) -> Vec<usize> {
    // Adding 0.0 maps -0.0 to +0.0 so both hash the same.
    let bits = |pt: &Point3<Real>| pt.coords.map(|e| (e + 0.0).to_bits());
    let mut seen = FnvHashSet::default();

    positions
        .iter()
        .enumerate()
        .filter(|(_, pt)| seen.insert(bits(pt)))
        .map(|(i, _)| i)
        .collect()
}

/// Greedy Poisson-disk pruning, bisecting on the disk radius until the number of kept
/// points is as close as possible to `target` without exceeding it.
fn blue_noise(
    positions: &[Point3<Real>],
    candidates: &[usize],
    target: usize,
    rng: &mut StdRng,
) -> Vec<usize> {
    let mut order = candidates.to_vec();
    order.shuffle(rng);

    let aabb = Aabb::from_points(candidates.iter().map(|i| &positions[*i]));
    let mut lo = 0.0;
    let mut hi = aabb.extents().norm();
    let mut best: Option<Vec<usize>> = None;

    for _ in 0..BLUE_NOISE_BISECTION_STEPS {
        let radius = (lo + hi) / 2.0;
        let selected = poisson_disk_pass(positions, &order, radius);

        if selected.len() > target {
            lo = radius;
        } else {
            hi = radius;
            let len = selected.len();
            if best.as_ref().map_or(true, |b| len > b.len()) {
                best = Some(selected);
            }
            if len == target {
                break;
            }
        }
    }

    let mut result = best.unwrap_or_else(|| vec![order[0]]);
    result.sort_unstable();
    result
}

fn poisson_disk_pass(positions: &[Point3<Real>], order: &[usize], radius: Real) -> Vec<usize> {
    let mut grid = HGrid::new(Point3::origin(), radius);
    let mut selected = vec![];
    let sq_radius = radius * radius;

    for &i in order {
        let pt = &positions[i];
        let key = grid.key(pt);
        let is_free = grid
            .neighbors(&key, 1)
            .all(|j| na::distance_squared(pt, &positions[*j]) >= sq_radius);

        if is_free {
            grid.insert(pt, i);
            selected.push(i);
        }
    }

    selected
}

/// Lloyd's algorithm seeded with k-means++; returns the input point nearest to each
/// centroid, duplicates removed, in centroid order.
fn k_means(
    positions: &[Point3<Real>],
    candidates: &[usize],
    k: usize,
    iterations: usize,
    rng: &mut StdRng,
) -> Vec<usize> {
    let points: Vec<_> = candidates.iter().map(|i| positions[*i]).collect();
    let mut centroids = k_means_plus_plus(&points, k, rng);
    let mut assignments = vec![usize::MAX; points.len()];

    for iter in 0..iterations {
        let new_assignments: Vec<_> = points
            .par_iter()
            .map(|pt| nearest(&centroids, pt))
            .collect();

        if new_assignments == assignments {
            tracing::debug!("k-means converged after {} iterations", iter);
            break;
        }
        assignments = new_assignments;

        let mut sums = vec![Vector3::zeros(); k];
        let mut counts = vec![0usize; k];

        for (pt, cluster) in points.iter().zip(assignments.iter()) {
            sums[*cluster] += pt.coords;
            counts[*cluster] += 1;
        }

        for ((centroid, sum), count) in centroids.iter_mut().zip(sums).zip(counts) {
            // Empty clusters keep their previous centroid.
            if count > 0 {
                *centroid = Point3::from(sum / count as Real);
            }
        }
    }

    let nearest_points: Vec<_> = centroids
        .par_iter()
        .map(|centroid| candidates[nearest(&points, centroid)])
        .collect();

    let mut seen = FnvHashSet::default();
    nearest_points
        .into_iter()
        .filter(|i| seen.insert(*i))
        .collect()
}

fn k_means_plus_plus(points: &[Point3<Real>], k: usize, rng: &mut StdRng) -> Vec<Point3<Real>> {
    let mut centroids = Vec::with_capacity(k);
    centroids.push(points[rng.random_range(0..points.len())]);

    let mut sq_dists: Vec<Real> = points
        .par_iter()
        .map(|pt| na::distance_squared(pt, &centroids[0]))
        .collect();

    while centroids.len() < k {
        let total: Real = sq_dists.iter().sum();
        let next = if total > 0.0 {
            let mut remaining = rng.random::<Real>() * total;
            let mut chosen = points.len() - 1;

            for (i, d) in sq_dists.iter().enumerate() {
                if remaining < *d {
                    chosen = i;
                    break;
                }
                remaining -= *d;
            }

            chosen
        } else {
            rng.random_range(0..points.len())
        };

        let centroid = points[next];
        centroids.push(centroid);
        sq_dists
            .par_iter_mut()
            .zip(points.par_iter())
            .for_each(|(d, pt)| *d = d.min(na::distance_squared(pt, &centroid)));
    }

    centroids
}

fn nearest(candidates: &[Point3<Real>], pt: &Point3<Real>) -> usize {
    let mut best = 0;
    let mut best_dist = Real::MAX;

    for (i, c) in candidates.iter().enumerate() {
        let dist = na::distance_squared(c, pt);
        if dist < best_dist {
            best = i;
            best_dist = dist;
        }
    }

    best
}
