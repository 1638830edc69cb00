//! Device layouts: which simulated devices are in radio range of which.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Undirected edges between device indices.
pub struct Topology {
    pub nodes: usize,
    pub edges: Vec<(usize, usize)>,
}

impl Topology {
    /// `0 - 1 - 2 - ... - n-1`
    pub fn line(nodes: usize) -> Self {
        let edges = (1..nodes).map(|i| (i - 1, i)).collect();
        Self { nodes, edges }
    }

    /// Width x height grid, 4-neighbourhood. Index = y * width + x.
    pub fn grid(width: usize, height: usize) -> Self {
        let mut edges = Vec::new();
        for y in 0..height {
            for x in 0..width {
                let i = y * width + x;
                if x + 1 < width {
                    edges.push((i, i + 1));
                }
                if y + 1 < height {
                    edges.push((i, i + width));
                }
            }
        }
        Self {
            nodes: width * height,
            edges,
        }
    }

    /// Devices scattered on a unit square, linked when closer than
    /// `range`. A spanning chain keeps the graph connected.
    pub fn scatter(nodes: usize, range: f64, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let points: Vec<(f64, f64)> = (0..nodes)
            .map(|_| (rng.random::<f64>(), rng.random::<f64>()))
            .collect();

        let mut edges = Vec::new();
        for i in 0..nodes {
            for j in (i + 1)..nodes {
                let (dx, dy) = (points[i].0 - points[j].0, points[i].1 - points[j].1);
                if (dx * dx + dy * dy).sqrt() <= range || j == i + 1 {
                    edges.push((i, j));
                }
            }
        }
        Self { nodes, edges }
    }

    pub fn degree(&self, node: usize) -> usize {
        self.edges
            .iter()
            .filter(|(a, b)| *a == node || *b == node)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_edges() {
        let t = Topology::line(4);
        assert_eq!(t.edges, vec![(0, 1), (1, 2), (2, 3)]);
        assert_eq!(t.degree(0), 1);
        assert_eq!(t.degree(1), 2);
    }

    #[test]
    fn grid_edges() {
        let t = Topology::grid(3, 2);
        assert_eq!(t.nodes, 6);
        // 2 rows * 2 horizontal + 3 vertical
        assert_eq!(t.edges.len(), 7);
        assert_eq!(t.degree(4), 3);
    }

    #[test]
    fn scatter_is_connected_and_deterministic() {
        let a = Topology::scatter(20, 0.2, 7);
        let b = Topology::scatter(20, 0.2, 7);
        assert_eq!(a.edges, b.edges);
        for i in 1..20 {
            assert!(a.edges.contains(&(i - 1, i)));
        }
    }
}
