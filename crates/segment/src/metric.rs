/// Distance metric a table is configured with. Determines both how a
/// segment engine scores a candidate and which direction "better" points in
/// the top-k reduction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Metric {
    /// Squared Euclidean distance. Smaller is better.
    #[default]
    L2,
    /// Inner product. Larger is better.
    Ip,
}

impl Metric {
    pub fn distance(self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            Metric::L2 => a
                .iter()
                .zip(b)
                .map(|(x, y)| {
                    let d = x - y;
                    d * d
                })
                .sum(),
            Metric::Ip => a.iter().zip(b).map(|(x, y)| x * y).sum(),
        }
    }

    /// Does `candidate` rank strictly better than `incumbent` under this
    /// metric's ordering?
    pub fn is_better(self, candidate: f32, incumbent: f32) -> bool {
        match self {
            Metric::L2 => candidate < incumbent,
            Metric::Ip => candidate > incumbent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn l2_prefers_closer_points() {
        assert!(Metric::L2.is_better(1.0, 2.0));
        assert!(!Metric::L2.is_better(2.0, 1.0));
    }

    #[test]
    fn ip_prefers_larger_products() {
        assert!(Metric::Ip.is_better(2.0, 1.0));
        assert!(!Metric::Ip.is_better(1.0, 2.0));
    }

    #[test]
    fn l2_distance_is_squared_euclidean() {
        assert_eq!(Metric::L2.distance(&[0.0, 0.0], &[3.0, 4.0]), 25.0);
    }
}
