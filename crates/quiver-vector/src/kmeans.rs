//! K-means clustering for codebook training.
//!
//! Lloyd's algorithm over a column window of a set of full vectors. The
//! product quantizer runs one trainer per subvector in parallel, each
//! configured with its own `(offset, width)` window; trainers share no
//! mutable state.
//!
//! The policy is deliberately deterministic so that fitting the same data
//! always produces the same codebook:
//!
//! - Initialization seeds from the first `k` distinct subvector rows in
//!   input order; if fewer distinct rows exist, the last distinct one is
//!   repeated.
//! - Assignment uses squared Euclidean distance; ties go to the lowest
//!   centroid index.
//! - A cluster that loses all members keeps its previous centroid.
//! - Iteration stops when no label changes, or after `max_iter` rounds.

/// Iteration cap for a single training run.
pub const MAX_ITERATIONS: usize = 100;

/// A k-means trainer over a column window of a vector set.
#[derive(Debug, Clone)]
pub struct KMeans {
    /// Number of clusters. Must be at most 256 so labels fit in a byte.
    pub k: usize,
    /// Maximum Lloyd iterations.
    pub max_iter: usize,
    /// First column of the window.
    pub offset: usize,
    /// Width of the window.
    pub width: usize,
}

/// Output of a training run.
#[derive(Debug, Clone)]
pub struct KMeansOutput {
    /// The `k` centroids, each of the window width.
    pub centroids: Vec<Vec<f32>>,
    /// Centroid id per input row, in `[0, k)`.
    pub labels: Vec<u8>,
    /// Lloyd iterations actually run.
    pub iterations: usize,
}

impl KMeans {
    /// Cluster the `(offset, width)` window of `vectors`.
    ///
    /// Always produces exactly `k` centroids; with fewer than `k` distinct
    /// rows the tail centroids are duplicates and simply never win an
    /// assignment over their earlier twin.
    #[must_use]
    pub fn fit(&self, vectors: &[Vec<f32>]) -> KMeansOutput {
        debug_assert!(self.k > 0 && self.k <= 256, "k must fit in a byte label");

        let mut centroids = self.seed_centroids(vectors);
        let mut labels: Option<Vec<u8>> = None;
        let mut iterations = 0;

        for _ in 0..self.max_iter {
            iterations += 1;
            let assigned = self.assign(vectors, &centroids);
            if labels.as_ref() == Some(&assigned) {
                break;
            }
            self.update_centroids(&mut centroids, vectors, &assigned);
            labels = Some(assigned);
        }

        KMeansOutput { centroids, labels: labels.unwrap_or_default(), iterations }
    }

    fn window<'a>(&self, vector: &'a [f32]) -> &'a [f32] {
        &vector[self.offset..self.offset + self.width]
    }

    /// First `k` distinct rows in input order, padded with the last
    /// distinct row when there are not enough.
    fn seed_centroids(&self, vectors: &[Vec<f32>]) -> Vec<Vec<f32>> {
        let mut seeds: Vec<Vec<f32>> = Vec::with_capacity(self.k);
        for vector in vectors {
            let row = self.window(vector);
            if !seeds.iter().any(|s| s.as_slice() == row) {
                seeds.push(row.to_vec());
                if seeds.len() == self.k {
                    break;
                }
            }
        }
        let pad = seeds.last().cloned().unwrap_or_else(|| vec![0.0; self.width]);
        while seeds.len() < self.k {
            seeds.push(pad.clone());
        }
        seeds
    }

    fn assign(&self, vectors: &[Vec<f32>], centroids: &[Vec<f32>]) -> Vec<u8> {
        vectors
            .iter()
            .map(|vector| {
                let row = self.window(vector);
                let mut best = 0usize;
                let mut best_dist = f32::MAX;
                for (j, centroid) in centroids.iter().enumerate() {
                    let dist: f32 =
                        row.iter().zip(centroid.iter()).map(|(x, y)| (x - y) * (x - y)).sum();
                    // Strict comparison keeps the lowest index on ties
                    if dist < best_dist {
                        best_dist = dist;
                        best = j;
                    }
                }
                best as u8
            })
            .collect()
    }

    fn update_centroids(&self, centroids: &mut [Vec<f32>], vectors: &[Vec<f32>], labels: &[u8]) {
        let mut sums = vec![vec![0.0f32; self.width]; self.k];
        let mut counts = vec![0usize; self.k];

        for (vector, &label) in vectors.iter().zip(labels.iter()) {
            let row = self.window(vector);
            let sum = &mut sums[label as usize];
            for (s, &v) in sum.iter_mut().zip(row.iter()) {
                *s += v;
            }
            counts[label as usize] += 1;
        }

        for ((centroid, sum), &count) in centroids.iter_mut().zip(sums).zip(counts.iter()) {
            // Empty clusters keep their previous centroid
            if count > 0 {
                for (c, s) in centroid.iter_mut().zip(sum) {
                    *c = s / count as f32;
                }
            }
        }
    }
}
