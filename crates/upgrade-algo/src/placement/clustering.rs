//! Agglomerative clustering of violated buses.
//!
//! Starts with every bus in its own cluster and repeatedly merges the two
//! clusters with the smallest average pairwise distance (average linkage,
//! UPGMA) until `k` clusters remain. Ties merge the pair with the lowest
//! member indices, so the partition is deterministic for a given matrix.

use upgrade_core::{UpgradeError, UpgradeResult};

/// Average distance between every member of `a` and every member of `b`.
fn average_linkage(distances: &[Vec<f64>], a: &[usize], b: &[usize]) -> f64 {
    let total: f64 = a
        .iter()
        .flat_map(|&i| b.iter().map(move |&j| distances[i][j]))
        .sum();
    total / (a.len() * b.len()) as f64
}

/// Partition `0..n` into `k` clusters using average linkage.
///
/// Clusters are returned with sorted members, ordered by their smallest
/// member.
pub fn agglomerative(distances: &[Vec<f64>], k: usize) -> UpgradeResult<Vec<Vec<usize>>> {
    let n = distances.len();
    if distances.iter().any(|row| row.len() != n) {
        return Err(UpgradeError::Other(format!(
            "distance matrix is not square ({} rows)",
            n
        )));
    }
    if k == 0 || k > n {
        return Err(UpgradeError::Other(format!(
            "cannot form {} clusters from {} buses",
            k, n
        )));
    }

    let mut clusters: Vec<Vec<usize>> = (0..n).map(|i| vec![i]).collect();
    while clusters.len() > k {
        let mut best: Option<(usize, usize, f64)> = None;
        for a in 0..clusters.len() {
            for b in (a + 1)..clusters.len() {
                let d = average_linkage(distances, &clusters[a], &clusters[b]);
                let closer = match best {
                    None => true,
                    Some((_, _, current)) => d < current - 1e-12,
                };
                if closer {
                    best = Some((a, b, d));
                }
            }
        }
        let Some((a, b, _)) = best else {
            break;
        };
        let merged = clusters.remove(b);
        clusters[a].extend(merged);
        clusters[a].sort_unstable();
    }

    clusters.sort_by_key(|c| c.first().copied().unwrap_or(usize::MAX));
    Ok(clusters)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Buses on a line at positions 0, 1, 10, 11, 30.
    fn line_matrix() -> Vec<Vec<f64>> {
        let positions = [0.0f64, 1.0, 10.0, 11.0, 30.0];
        positions
            .iter()
            .map(|a| positions.iter().map(|b| (a - b).abs()).collect())
            .collect()
    }

    #[test]
    fn test_single_cluster_holds_everything() {
        let clusters = agglomerative(&line_matrix(), 1).unwrap();
        assert_eq!(clusters, vec![vec![0, 1, 2, 3, 4]]);
    }

    #[test]
    fn test_groups_nearby_buses() {
        let clusters = agglomerative(&line_matrix(), 3).unwrap();
        assert_eq!(clusters, vec![vec![0, 1], vec![2, 3], vec![4]]);
    }

    #[test]
    fn test_k_equal_to_n_is_identity() {
        let clusters = agglomerative(&line_matrix(), 5).unwrap();
        assert_eq!(clusters.len(), 5);
        assert!(clusters.iter().all(|c| c.len() == 1));
    }

    #[test]
    fn test_rejects_invalid_k() {
        assert!(agglomerative(&line_matrix(), 0).is_err());
        assert!(agglomerative(&line_matrix(), 6).is_err());
        assert!(agglomerative(&[vec![0.0, 1.0]], 1).is_err());
    }
}
