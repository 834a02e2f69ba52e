//! Elution profile models fit to trace segments.
//!
//! Segments are fit with the Gaussian and bi-Gaussian models of
//! [`mzsignal::feature_statistics`] over a time axis in minutes, after removing the
//! segment's baseline. The better scoring model is kept, and its score against a straight
//! line model is mapped onto a [`Quality`].
use mzsignal::feature_statistics::{FitConfig, PeakFitArgs, PeakShape};

use crate::ion::Quality;
use crate::params::PeakShapeParams;
use crate::trace::{Segment, Trace};

const MILLIS_PER_MINUTE: f64 = 60_000.0;

/// The better of the fitted elution models for one segment
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PeakShapeFit {
    /// The fitted model over retention times in minutes, above `baseline`
    pub model: PeakShape,
    pub baseline: f64,
    /// One minus the ratio of the model's squared error to a straight line's, in `[0, 1]`
    pub score: f64,
    pub quality: Quality,
    pub converged: bool,
}

impl PeakShapeFit {
    fn unusable(location: f64, height: f64, baseline: f64) -> Self {
        let model = PeakShape::Gaussian(mzsignal::feature_statistics::GaussianPeakShape::new(
            location / MILLIS_PER_MINUTE,
            1.0 / MILLIS_PER_MINUTE,
            height,
        ));
        Self {
            model,
            baseline,
            score: 0.0,
            quality: Quality::Unusable,
            converged: false,
        }
    }

    /// The fitted center in milliseconds
    pub fn location(&self) -> f64 {
        let mu = match &self.model {
            PeakShape::Gaussian(p) => p.mu,
            PeakShape::SkewedGaussian(p) => p.mu,
            PeakShape::BiGaussian(p) => p.mu,
        };
        mu * MILLIS_PER_MINUTE
    }

    /// The width of the model in milliseconds, averaging both sides of a bi-Gaussian
    pub fn scale(&self) -> f64 {
        let sigma = match &self.model {
            PeakShape::Gaussian(p) => p.sigma,
            PeakShape::SkewedGaussian(p) => p.sigma,
            PeakShape::BiGaussian(p) => (p.sigma_rising + p.sigma_falling) / 2.0,
        };
        sigma.abs() * MILLIS_PER_MINUTE
    }

    pub fn height(&self) -> f64 {
        match &self.model {
            PeakShape::Gaussian(p) => p.amplitude,
            PeakShape::SkewedGaussian(p) => p.amplitude,
            PeakShape::BiGaussian(p) => p.amplitude,
        }
    }

    pub fn is_bigaussian(&self) -> bool {
        matches!(self.model, PeakShape::BiGaussian(_))
    }

    /// The modelled intensity at `retention_time` milliseconds, baseline included
    pub fn evaluate(&self, retention_time: f64) -> f64 {
        self.baseline + self.model.density(retention_time / MILLIS_PER_MINUTE)
    }
}

pub fn classify(score: f64, params: &PeakShapeParams) -> Quality {
    if score >= params.good_score {
        Quality::Good
    } else if score >= params.decent_score {
        Quality::Decent
    } else if score >= params.bad_score {
        Quality::Bad
    } else {
        Quality::Unusable
    }
}

/// Fit Gaussian and bi-Gaussian models to `segment` of `trace`, keeping the model that
/// scores better.
pub fn fit_peak_shape(trace: &Trace, segment: &Segment, params: &PeakShapeParams) -> PeakShapeFit {
    let points = trace.segment_points(segment);
    let baseline = points
        .iter()
        .map(|p| p.intensity as f64)
        .fold(f64::INFINITY, f64::min);
    let apex_rt = trace.retention_time_at(segment.apex) as f64;
    let height = trace.intensity_at(segment.apex) as f64 - baseline;
    if points.len() < 3 || !height.is_finite() || height <= 0.0 {
        return PeakShapeFit::unusable(apex_rt, height.max(0.0), baseline.max(0.0));
    }

    let times: Vec<f64> = points
        .iter()
        .map(|p| p.retention_time as f64 / MILLIS_PER_MINUTE)
        .collect();
    let intensities: Vec<f32> = points
        .iter()
        .map(|p| (p.intensity as f64 - baseline) as f32)
        .collect();
    let args = PeakFitArgs::from((times.as_slice(), intensities.as_slice()));
    let config = FitConfig::default().max_iter(params.max_iterations);

    let candidates = [PeakShape::gaussian(&args), PeakShape::bigaussian(&args)];
    let best = candidates
        .into_iter()
        .map(|mut shape| {
            let fit = shape.fit_with(args.borrow(), config.clone());
            let score = if fit.score.is_finite() { fit.score } else { 0.0 };
            (shape, score, fit.converged)
        })
        .max_by(|a, b| a.1.total_cmp(&b.1));

    match best {
        Some((model, score, converged)) => PeakShapeFit {
            model,
            baseline,
            score,
            quality: classify(score, params),
            converged,
        },
        None => PeakShapeFit::unusable(apex_rt, height, baseline),
    }
}
