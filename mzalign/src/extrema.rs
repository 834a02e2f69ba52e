//! Extrema detection over smoothed traces and the segmentation built on it.
use mzsignal::smooth::{moving_average_dyn, savitsky_golay, SavitskyGolayError};
use tracing::trace;

use crate::error::TraceError;
use crate::noise::NoiseModel;
use crate::params::SegmentationParams;
use crate::stats::quantile;
use crate::trace::{Segment, Trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtremumKind {
    Minimum,
    Maximum,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Extremum {
    pub index: usize,
    pub kind: ExtremumKind,
    pub intensity: f64,
}

/// Alternating minima and maxima over a trace, always starting with a minimum
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Extrema {
    points: Vec<Extremum>,
}

impl Extrema {
    fn start(intensity: f64) -> Self {
        Self {
            points: vec![Extremum {
                index: 0,
                kind: ExtremumKind::Minimum,
                intensity,
            }],
        }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Extremum> {
        self.points.iter()
    }

    pub fn maxima(&self) -> impl Iterator<Item = &Extremum> + '_ {
        self.points
            .iter()
            .filter(|e| e.kind == ExtremumKind::Maximum)
    }

    fn last(&self) -> Option<&Extremum> {
        self.points.last()
    }

    /// Record an extremum, replacing the previous one when it is of the same kind and
    /// less extreme.
    fn offer(&mut self, index: usize, kind: ExtremumKind, intensity: f64, significant: bool) {
        let Some(last) = self.points.last_mut() else {
            self.points.push(Extremum {
                index,
                kind,
                intensity,
            });
            return;
        };
        if last.kind == kind {
            let more_extreme = match kind {
                ExtremumKind::Maximum => intensity > last.intensity,
                ExtremumKind::Minimum => intensity < last.intensity,
            };
            if more_extreme {
                last.index = index;
                last.intensity = intensity;
            }
        } else if significant {
            self.points.push(Extremum {
                index,
                kind,
                intensity,
            });
        }
    }

    /// Remove maxima that do not rise above their higher neighboring minimum by more than
    /// `jump`, merging them into the neighboring peak.
    pub fn remove_noise_maxima(&mut self, jump: f64) {
        loop {
            let mut weakest: Option<(usize, f64)> = None;
            for (pos, e) in self.points.iter().enumerate() {
                if e.kind != ExtremumKind::Maximum || pos == 0 {
                    continue;
                }
                let left = self.points[pos - 1].intensity;
                let floor = match self.points.get(pos + 1) {
                    Some(right) => left.max(right.intensity),
                    None => left,
                };
                let ratio = if floor > 0.0 {
                    e.intensity / floor
                } else {
                    f64::INFINITY
                };
                if ratio <= jump && weakest.map(|(_, r)| ratio < r).unwrap_or(true) {
                    weakest = Some((pos, ratio));
                }
            }
            let Some((pos, _)) = weakest else {
                break;
            };
            match self.points.get(pos + 1) {
                None => {
                    self.points.remove(pos);
                }
                Some(right) => {
                    let drop = if right.intensity >= self.points[pos - 1].intensity {
                        pos + 1
                    } else {
                        pos - 1
                    };
                    self.points.remove(pos.max(drop));
                    self.points.remove(pos.min(drop));
                }
            }
        }
    }

    /// One segment per maximum, bounded by the neighboring minima or the trace edges
    pub fn segments(&self, length: usize) -> Vec<Segment> {
        self.points
            .iter()
            .enumerate()
            .filter(|(_, e)| e.kind == ExtremumKind::Maximum)
            .map(|(pos, e)| {
                let start = pos
                    .checked_sub(1)
                    .map(|p| self.points[p].index)
                    .unwrap_or(0);
                let end = self
                    .points
                    .get(pos + 1)
                    .map(|p| p.index)
                    .unwrap_or(length.saturating_sub(1));
                Segment::new(start, e.index, end)
            })
            .collect()
    }
}

/// The widest window [`moving_average_dyn`] supports
const MAX_MOVING_AVERAGE_WINDOW: usize = 20;

/// A smoothing filter of fixed half-width. Linear kernels within reach of
/// [`moving_average_dyn`] are a moving average, everything else a Savitzky-Golay filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SmoothingKernel {
    pub half_width: usize,
    pub polynomial_order: usize,
}

impl SmoothingKernel {
    pub fn new(half_width: usize, polynomial_order: usize) -> Self {
        Self {
            half_width,
            polynomial_order,
        }
    }

    /// Pick the kernel for a trace of `length` points from the ladder
    pub fn for_length(length: usize, params: &SegmentationParams) -> Self {
        params
            .ladder
            .iter()
            .find(|s| length < s.max_length)
            .or(params.ladder.last())
            .map(|step| Self::new(step.half_width, step.polynomial_order))
            .unwrap_or(Self::new(0, 1))
    }

    pub fn window_length(&self) -> usize {
        2 * self.half_width + 1
    }

    fn is_moving_average(&self) -> bool {
        self.polynomial_order <= 1 && self.window_length() <= MAX_MOVING_AVERAGE_WINDOW
    }

    /// The polynomial order handed to the Savitzky-Golay filter. Its edge refit only
    /// covers the padding when the order is at least the half-width.
    fn effective_order(&self) -> usize {
        self.polynomial_order
            .max(self.half_width)
            .min(self.window_length() - 1)
    }

    /// Smooth `values` as if they were surrounded by zeros, clamping at zero
    pub fn smooth(&self, values: &[f32]) -> Result<Vec<f64>, SavitskyGolayError> {
        let data: Vec<f64> = values.iter().map(|v| *v as f64).collect();
        if self.half_width == 0 || data.is_empty() {
            return Ok(data);
        }
        let h = self.half_width;
        if self.is_moving_average() {
            let mut padded = data;
            padded.extend(std::iter::repeat(0.0).take(h));
            let mut out = vec![0.0; padded.len()];
            moving_average_dyn(&padded, &mut out, self.window_length());
            out.truncate(values.len());
            return Ok(out);
        }
        let pad = self.window_length();
        let mut padded = vec![0.0; pad];
        padded.extend_from_slice(&data);
        padded.extend(std::iter::repeat(0.0).take(pad));
        let smoothed = savitsky_golay(&padded, self.window_length(), self.effective_order(), 0)?;
        Ok(smoothed[pad..pad + values.len()].to_vec())
    }
}

/// The outcome of extrema detection, including every smoothing half-width tried
#[derive(Debug, Clone, PartialEq)]
pub struct ExtremaDetection {
    pub extrema: Extrema,
    pub half_widths: Vec<usize>,
    pub smoothed: Vec<f64>,
}

fn scan_extrema(raw: &[f32], smoothed: &[f64], initial_threshold: f64, decay: f64) -> Extrema {
    let n = raw.len();
    let mut extrema = Extrema::start(raw[0] as f64);
    let mut threshold = initial_threshold;
    for k in 1..n.saturating_sub(1) {
        let a = raw[k - 1] as f64;
        let b = raw[k] as f64;
        let c = raw[k + 1] as f64;
        if let Some(last) = extrema.last().copied() {
            let significant = (b - last.intensity).abs() > threshold
                && (smoothed[k] - smoothed[last.index]).abs() > threshold;
            if b > a && b >= c {
                extrema.offer(k, ExtremumKind::Maximum, b, significant);
            } else if b < a && b <= c {
                extrema.offer(k, ExtremumKind::Minimum, b, significant);
            }
        }
        threshold = threshold * decay + (1.0 - decay) * (b - c).abs();
    }
    extrema
}

/// Find extrema of `trace`, escalating the smoothing half-width while the trace is too
/// dense in extrema for its length.
pub fn detect_extrema(
    trace: &Trace,
    noise: &NoiseModel,
    params: &SegmentationParams,
) -> Result<ExtremaDetection, TraceError> {
    let raw = trace.intensities();
    let n = raw.len();
    if n < params.min_trace_length.max(3) {
        let smoothed: Vec<f64> = raw.iter().map(|v| *v as f64).collect();
        let mut extrema = Extrema::default();
        if let Some((apex, v)) = smoothed
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
        {
            extrema = Extrema::start(smoothed[0]);
            if apex > 0 {
                extrema.offer(apex, ExtremumKind::Maximum, *v, true);
            }
        }
        return Ok(ExtremaDetection {
            extrema,
            half_widths: Vec::new(),
            smoothed,
        });
    }

    let mut filter = SmoothingKernel::for_length(n, params);
    let mut half_widths = Vec::new();
    let max_rounds = params.escalation.len() + 1;
    loop {
        half_widths.push(filter.half_width);
        let smoothed = filter.smooth(&raw).map_err(|e| TraceError::Smoothing {
            half_width: filter.half_width,
            reason: e.to_string(),
        })?;
        let apex = smoothed
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i)
            .unwrap_or_default();
        let initial = noise.noise_level(trace.scan_index_at(apex), trace.mz_at(apex))
            * params.noise_factor;
        let extrema = scan_extrema(&raw, &smoothed, initial, params.threshold_decay);

        let current = filter.half_width;
        let escalate_to = params
            .escalation
            .iter()
            .filter(|rule| {
                n >= rule.min_length
                    && extrema.len() > rule.max_extrema
                    && rule.half_width > current
                    && rule.half_width <= params.max_half_width
            })
            .map(|rule| rule.half_width)
            .max();
        match escalate_to {
            Some(width) if half_widths.len() < max_rounds => {
                trace!(
                    "Escalating smoothing of {} from {current} to {width} ({} extrema over {n} points)",
                    trace.key(),
                    extrema.len()
                );
                filter = SmoothingKernel::new(width, params.escalation_polynomial_order);
            }
            _ => {
                return Ok(ExtremaDetection {
                    extrema,
                    half_widths,
                    smoothed,
                })
            }
        }
    }
}

/// The `q` quantile of the ratios between consecutive intensities, larger over smaller
pub fn typical_jump(intensities: &[f32], q: f64) -> f64 {
    let mut ratios: Vec<f64> = intensities
        .windows(2)
        .filter_map(|w| {
            let (lo, hi) = if w[0] < w[1] { (w[0], w[1]) } else { (w[1], w[0]) };
            if lo > 0.0 {
                Some(hi as f64 / lo as f64)
            } else {
                None
            }
        })
        .collect();
    quantile(&mut ratios, q).unwrap_or(1.0)
}

/// Detect extrema, drop those explained by ordinary scan-to-scan variation, and add one
/// segment per remaining maximum to `trace`.
pub fn segment_trace(
    trace: &mut Trace,
    noise: &NoiseModel,
    params: &SegmentationParams,
) -> Result<ExtremaDetection, TraceError> {
    let mut detection = detect_extrema(trace, noise, params)?;
    let jump = typical_jump(&trace.intensities(), params.jump_quantile);
    detection.extrema.remove_noise_maxima(jump);
    for seg in detection.extrema.segments(trace.len()) {
        trace.add_segment(seg.start, seg.apex, seg.end)?;
    }
    Ok(detection)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::scan::ScanPoint;
    use crate::trace::TraceKey;

    fn gaussian(x: f64, mu: f64, sigma: f64, height: f64) -> f64 {
        height * (-(x - mu).powi(2) / (2.0 * sigma * sigma)).exp()
    }

    fn make_trace(intensities: &[f64]) -> Trace {
        let points = intensities
            .iter()
            .enumerate()
            .map(|(i, v)| ScanPoint::new(i, i as i64 * 1000, 250.0, *v as f32))
            .collect();
        Trace::from_points(TraceKey::new(0, 250.0), points).unwrap()
    }

    fn check_segments(trace: &Trace) {
        let segs = trace.segments();
        assert!(segs.windows(2).all(|w| w[0].start <= w[1].start && w[0].end <= w[1].start));
        assert!(segs.iter().all(|s| s.start <= s.apex && s.apex <= s.end && s.end < trace.len()));
    }

    #[test]
    fn test_single_bump() {
        let values: Vec<f64> = (0..20).map(|i| gaussian(i as f64, 10.0, 3.0, 1e5) + 50.0).collect();
        let mut trace = make_trace(&values);
        segment_trace(&mut trace, &NoiseModel::Zero, &SegmentationParams::default()).unwrap();
        assert_eq!(trace.segments().len(), 1);
        assert_eq!(trace.segments()[0].apex, 10);
        check_segments(&trace);
    }

    #[test]
    fn test_two_bumps() {
        let values: Vec<f64> = (0..40)
            .map(|i| {
                let x = i as f64;
                gaussian(x, 10.0, 3.0, 1e5) + gaussian(x, 30.0, 3.0, 8e4) + 20.0
            })
            .collect();
        let mut trace = make_trace(&values);
        segment_trace(&mut trace, &NoiseModel::Global(200.0), &SegmentationParams::default())
            .unwrap();
        let segs = trace.segments();
        assert_eq!(segs.len(), 2, "{segs:?}");
        assert_eq!(segs[0].apex, 10);
        assert_eq!(segs[1].apex, 30);
        check_segments(&trace);
    }

    #[test]
    fn test_escalation_is_monotone() {
        // a long trace with a dense square wave on top of a broad peak
        let values: Vec<f64> = (0..240)
            .map(|i| {
                let x = i as f64;
                let wave = if i % 20 < 10 { 4000.0 } else { 0.0 };
                gaussian(x, 120.0, 40.0, 1e4) + wave + 100.0
            })
            .collect();
        let trace = make_trace(&values);
        let params = SegmentationParams::default();
        let detection = detect_extrema(&trace, &NoiseModel::Zero, &params).unwrap();
        assert!(detection.half_widths.len() > 1, "{:?}", detection.half_widths);
        assert!(detection.half_widths.windows(2).all(|w| w[0] <= w[1]));
        assert!(detection
            .half_widths
            .iter()
            .all(|w| *w <= params.max_half_width));
    }

    #[test]
    fn test_kernel_ladder_by_length() {
        let params = SegmentationParams::default();
        let widths: Vec<_> = [5, 15, 20, 500]
            .into_iter()
            .map(|n| SmoothingKernel::for_length(n, &params).half_width)
            .collect();
        assert_eq!(widths, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_moving_average_is_centered() {
        let kernel = SmoothingKernel::new(1, 1);
        let smoothed = kernel.smooth(&[3.0, 6.0, 9.0, 6.0, 3.0]).unwrap();
        let expected = [3.0, 6.0, 7.0, 6.0, 3.0];
        for (s, e) in smoothed.iter().zip(expected) {
            assert!((s - e).abs() < 1e-9, "{smoothed:?}");
        }
    }

    #[test]
    fn test_savitzky_golay_keeps_quadratic_interior() {
        let values: Vec<f32> = (0..30).map(|i| 1000.0 - (i as f32 - 15.0).powi(2)).collect();
        for kernel in [SmoothingKernel::new(2, 2), SmoothingKernel::new(4, 2)] {
            let smoothed = kernel.smooth(&values).unwrap();
            assert_eq!(smoothed.len(), values.len());
            let h = kernel.half_width;
            for i in h..values.len() - h {
                assert!(
                    (smoothed[i] - values[i] as f64).abs() < 1e-3,
                    "{kernel:?} at {i}: {} vs {}",
                    smoothed[i],
                    values[i]
                );
            }
            assert!(smoothed.iter().all(|v| *v >= 0.0));
        }
    }

    #[test]
    fn test_noise_maxima_merged() {
        let mut extrema = Extrema::start(10.0);
        extrema.offer(3, ExtremumKind::Maximum, 100.0, true);
        extrema.offer(5, ExtremumKind::Minimum, 90.0, true);
        extrema.offer(6, ExtremumKind::Maximum, 95.0, true);
        extrema.offer(8, ExtremumKind::Minimum, 5.0, true);
        extrema.remove_noise_maxima(1.5);
        let segs = extrema.segments(10);
        assert_eq!(segs, vec![Segment::new(0, 3, 8)]);
    }

    #[test]
    fn test_typical_jump() {
        let jump = typical_jump(&[100.0, 110.0, 121.0, 0.0, 50.0], 0.33);
        assert!((jump - 1.1).abs() < 1e-6);
    }
}
