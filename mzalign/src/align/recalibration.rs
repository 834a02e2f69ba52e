//! Monotone retention time recalibration of one sample onto the consensus time axis.
use tracing::debug;

/// A retention time anchor: a raw time, the consensus time it should map to and a weight
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Anchor {
    pub raw: f64,
    pub target: f64,
    pub weight: f64,
}

impl Anchor {
    pub fn new(raw: f64, target: f64, weight: f64) -> Self {
        Self {
            raw,
            target,
            weight,
        }
    }
}

/// A mapping from a sample's raw retention times to recalibrated ones
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Recalibration {
    #[default]
    Identity,
    Shift(f64),
    /// Linear interpolation between strictly increasing knots, extrapolating the outermost
    /// slopes
    Piecewise { raw: Vec<f64>, target: Vec<f64> },
}

impl Recalibration {
    pub fn apply(&self, rt: f64) -> f64 {
        match self {
            Recalibration::Identity => rt,
            Recalibration::Shift(shift) => rt + shift,
            Recalibration::Piecewise { raw, target } => {
                let n = raw.len();
                let i = raw.partition_point(|x| *x < rt).clamp(1, n - 1);
                let slope = (target[i] - target[i - 1]) / (raw[i] - raw[i - 1]);
                target[i - 1] + (rt - raw[i - 1]) * slope
            }
        }
    }

    pub fn is_identity(&self) -> bool {
        matches!(self, Recalibration::Identity)
    }

    /// The mapping from recalibrated times back to raw times
    pub fn invert(&self) -> Self {
        match self {
            Recalibration::Identity => Recalibration::Identity,
            Recalibration::Shift(shift) => Recalibration::Shift(-shift),
            Recalibration::Piecewise { raw, target } => Recalibration::Piecewise {
                raw: target.clone(),
                target: raw.clone(),
            },
        }
    }

    /// Fit a monotone mapping through the anchors.
    ///
    /// The highest weight chain of anchors increasing in both coordinates becomes the knots
    /// of a piecewise linear function. With fewer than two usable knots the median offset
    /// is used, and without anchors the identity.
    pub fn fit(anchors: &[Anchor]) -> Self {
        let mut anchors: Vec<Anchor> = anchors
            .iter()
            .copied()
            .filter(|a| a.raw.is_finite() && a.target.is_finite() && a.weight > 0.0)
            .collect();
        if anchors.is_empty() {
            return Recalibration::Identity;
        }
        anchors.sort_by(|a, b| a.raw.total_cmp(&b.raw).then(a.target.total_cmp(&b.target)));
        let path = monotone_path(&anchors);
        if path.len() >= 2 {
            debug!(
                "Recalibrating with {} of {} anchors",
                path.len(),
                anchors.len()
            );
            let (raw, target) = path.into_iter().map(|a| (a.raw, a.target)).unzip();
            return Recalibration::Piecewise { raw, target };
        }
        let mut offsets: Vec<f64> = anchors.iter().map(|a| a.target - a.raw).collect();
        match crate::stats::median(&mut offsets) {
            Some(shift) => Recalibration::Shift(shift),
            None => Recalibration::Identity,
        }
    }
}

/// The chain of anchors, strictly increasing in both coordinates, with the largest sum of
/// edge weights. Anchors must be sorted by raw time.
fn monotone_path(anchors: &[Anchor]) -> Vec<Anchor> {
    let n = anchors.len();
    let mut best = vec![0.0; n];
    let mut previous: Vec<Option<usize>> = vec![None; n];
    for i in 0..n {
        best[i] = anchors[i].weight;
        for j in 0..i {
            let (a, b) = (&anchors[j], &anchors[i]);
            if b.raw > a.raw && b.target > a.target {
                let candidate = best[j] + b.weight;
                if candidate > best[i] {
                    best[i] = candidate;
                    previous[i] = Some(j);
                }
            }
        }
    }
    let Some(end) = (0..n).max_by(|a, b| best[*a].total_cmp(&best[*b]).then(b.cmp(a))) else {
        return Vec::new();
    };
    let mut path = Vec::new();
    let mut current = Some(end);
    while let Some(i) = current {
        path.push(anchors[i]);
        current = previous[i];
    }
    path.reverse();
    path
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_identity_without_anchors() {
        let r = Recalibration::fit(&[]);
        assert!(r.is_identity());
        assert_eq!(r.apply(1234.0), 1234.0);
    }

    #[test]
    fn test_constant_offset() {
        let anchors: Vec<_> = (0..20)
            .map(|i| Anchor::new(i as f64 * 1000.0, i as f64 * 1000.0 - 3000.0, 1.0))
            .collect();
        let r = Recalibration::fit(&anchors);
        for x in [0.0, 5500.0, 19000.0, 40000.0, -1000.0] {
            assert!((r.apply(x) - (x - 3000.0)).abs() < 1e-6);
        }
    }

    #[test]
    fn test_outlier_skipped() {
        let mut anchors: Vec<_> = (0..10)
            .map(|i| Anchor::new(i as f64 * 1000.0, i as f64 * 1000.0 + 500.0, 2.0))
            .collect();
        anchors.push(Anchor::new(4500.0, 100.0, 1.0));
        let r = Recalibration::fit(&anchors);
        assert!((r.apply(4500.0) - 5000.0).abs() < 1e-6);
    }

    #[test]
    fn test_single_anchor_shift() {
        let r = Recalibration::fit(&[Anchor::new(1000.0, 1200.0, 1.0)]);
        assert_eq!(r, Recalibration::Shift(200.0));
        assert_eq!(r.invert().apply(1200.0), 1000.0);
    }

    #[test]
    fn test_invert_piecewise() {
        let anchors = [
            Anchor::new(0.0, 100.0, 1.0),
            Anchor::new(1000.0, 1300.0, 1.0),
            Anchor::new(2000.0, 2200.0, 1.0),
        ];
        let r = Recalibration::fit(&anchors);
        let inverse = r.invert();
        for x in [0.0, 500.0, 1700.0, 3000.0] {
            assert!((inverse.apply(r.apply(x)) - x).abs() < 1e-6);
        }
    }
}
