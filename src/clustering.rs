// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

/// Density-based clustering (DBSCAN) of 2-D points. A point with at least
/// `min_samples` points (itself included) within `radius` is a core point;
/// clusters are the connected regions of core points plus the points they
/// reach. Returns the cluster label of each point, None for noise.
pub fn dbscan(points: &[(f64, f64)], radius: f64, min_samples: usize)
              -> Vec<Option<usize>> {
    let radius_sq = radius * radius;
    let neighbors = |i: usize| -> Vec<usize> {
        let (xi, yi) = points[i];
        (0..points.len()).filter(|&j| {
            let (dx, dy) = (points[j].0 - xi, points[j].1 - yi);
            dx * dx + dy * dy <= radius_sq
        }).collect()
    };

    let mut labels = vec![None; points.len()];
    let mut visited = vec![false; points.len()];
    let mut next_label = 0;
    for i in 0..points.len() {
        if visited[i] {
            continue;
        }
        visited[i] = true;
        let mut seeds = neighbors(i);
        if seeds.len() < min_samples {
            continue;  // Noise, unless a later cluster reaches it.
        }
        labels[i] = Some(next_label);
        let mut k = 0;
        while k < seeds.len() {
            let j = seeds[k];
            k += 1;
            if !visited[j] {
                visited[j] = true;
                let reached = neighbors(j);
                if reached.len() >= min_samples {
                    seeds.extend(reached);
                }
            }
            if labels[j].is_none() {
                labels[j] = Some(next_label);
            }
        }
        next_label += 1;
    }
    labels
}

/// Indices of the members of the most populous cluster. Ties go to the
/// lower label. Empty if every point is noise.
pub fn largest_cluster(labels: &[Option<usize>]) -> Vec<usize> {
    let num_clusters = labels.iter().flatten().max().map_or(0, |m| m + 1);
    let mut sizes = vec![0; num_clusters];
    for label in labels.iter().flatten() {
        sizes[*label] += 1;
    }
    let mut best: Option<(usize, usize)> = None;  // label, size
    for (label, size) in sizes.into_iter().enumerate() {
        if best.map_or(true, |(_, best_size)| size > best_size) {
            best = Some((label, size));
        }
    }
    match best {
        None => Vec::new(),
        Some((best_label, _)) => labels.iter().enumerate()
            .filter(|(_, l)| **l == Some(best_label))
            .map(|(i, _)| i)
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty() {
        assert!(dbscan(&[], 1.0, 3).is_empty());
        assert!(largest_cluster(&[]).is_empty());
        assert!(largest_cluster(&[None, None]).is_empty());
    }

    #[test]
    fn test_two_blobs_and_noise() {
        let mut points = Vec::new();
        for i in 0..8 {
            points.push((10.0 + 0.1 * i as f64, -4.0));
        }
        for i in 0..4 {
            points.push((-20.0, 5.0 + 0.1 * i as f64));
        }
        points.push((100.0, 100.0));
        points.push((-50.0, 3.0));

        let labels = dbscan(&points, 0.5, 3);
        assert!(labels[0..8].iter().all(|l| *l == labels[0]));
        assert!(labels[8..12].iter().all(|l| *l == labels[8]));
        assert!(labels[0].is_some() && labels[8].is_some());
        assert_ne!(labels[0], labels[8]);
        assert_eq!(labels[12], None);
        assert_eq!(labels[13], None);

        assert_eq!(largest_cluster(&labels), (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn test_chain_is_one_cluster() {
        // Points spaced just within the radius link up end to end.
        let points: Vec<(f64, f64)> = (0..10).map(|i| (i as f64 * 0.9, 0.0)).collect();
        let labels = dbscan(&points, 1.0, 2);
        assert!(labels.iter().all(|l| *l == Some(0)));
    }

    #[test]
    fn test_too_sparse() {
        let points = [(0.0, 0.0), (5.0, 0.0), (10.0, 0.0)];
        assert_eq!(dbscan(&points, 1.0, 2), vec![None, None, None]);
    }

}  // mod tests.
