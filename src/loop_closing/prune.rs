//! Geometric-consistency pruning of node matches.
//!
//! Two matches are compatible when they preserve the distance between their
//! centroids on both sides. Inliers are the largest mutually compatible set
//! found greedily from every seed.

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use super::traits::OutlierPruner;

/// Configuration for the consistency pruner.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PrunerConfig {
    /// Absolute distance tolerance (meters).
    pub distance_tolerance: f64,

    /// Tolerance relative to the local distance.
    pub relative_tolerance: f64,
}

impl Default for PrunerConfig {
    fn default() -> Self {
        Self {
            distance_tolerance: 0.5,
            relative_tolerance: 0.1,
        }
    }
}

pub struct ConsistencyPruner {
    config: PrunerConfig,
}

impl ConsistencyPruner {
    pub fn new(config: PrunerConfig) -> Self {
        Self { config }
    }

    fn compatible(&self, local: &[Vector3<f64>], remote: &[Vector3<f64>], i: usize, j: usize) -> bool {
        let dl = (local[i] - local[j]).norm();
        let dr = (remote[i] - remote[j]).norm();
        let tolerance = self.config.distance_tolerance.max(self.config.relative_tolerance * dl);
        (dl - dr).abs() <= tolerance
    }
}

impl OutlierPruner for ConsistencyPruner {
    fn prune_outliers(&self, local: &[Vector3<f64>], remote: &[Vector3<f64>]) -> Vec<bool> {
        let n = local.len().min(remote.len());
        if n < 3 {
            return vec![true; n];
        }

        let mut adjacency = vec![vec![false; n]; n];
        for i in 0..n {
            for j in (i + 1)..n {
                let ok = self.compatible(local, remote, i, j);
                adjacency[i][j] = ok;
                adjacency[j][i] = ok;
            }
        }
        let degree: Vec<usize> = adjacency
            .iter()
            .map(|row| row.iter().filter(|&&c| c).count())
            .collect();

        let mut order: Vec<usize> = (0..n).collect();
        order.sort_by(|a, b| degree[*b].cmp(&degree[*a]).then(a.cmp(b)));

        let mut best: Vec<usize> = Vec::new();
        for &seed in &order {
            if degree[seed] < best.len() {
                continue;
            }
            let mut clique = vec![seed];
            for &candidate in &order {
                if candidate != seed && clique.iter().all(|&m| adjacency[m][candidate]) {
                    clique.push(candidate);
                }
            }
            if clique.len() > best.len() {
                best = clique;
            }
        }

        let mut mask = vec![false; n];
        for i in best {
            mask[i] = true;
        }
        mask
    }
}

/// Keep the items whose mask entry is set. Match scores are carried unchanged.
pub fn apply_mask<T: Clone>(items: &[T], mask: &[bool]) -> Vec<T> {
    items
        .iter()
        .zip(mask)
        .filter(|(_, keep)| **keep)
        .map(|(item, _)| item.clone())
        .collect()
}
