//! Noise level estimation from scan statistics.
//!
//! MS1 noise is estimated locally: every scan contributes a low intensity quantile per m/z bin,
//! and the level at a scan is the median of those values over a window of neighboring MS1
//! scans. MS/MS noise is a single global level.
use mzpeaks::{prelude::*, PeakSet};
use tracing::debug;

use crate::params::NoiseParams;
use crate::scan::{Scan, ScanIndex};
use crate::stats::{median, quantile};

/// A noise level function over scans and m/z.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum NoiseModel {
    /// Built from too few scans to say anything, always zero
    #[default]
    Zero,
    Global(f64),
    Local(LocalNoiseModel),
}

impl NoiseModel {
    pub fn noise_level(&self, scan_index: ScanIndex, mz: f64) -> f64 {
        match self {
            NoiseModel::Zero => 0.0,
            NoiseModel::Global(level) => *level,
            NoiseModel::Local(model) => model.noise_level(scan_index, mz),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LocalNoiseModel {
    scans: Vec<ScanIndex>,
    bin_width: f64,
    levels: Vec<Vec<Option<f64>>>,
    fallback: Vec<f64>,
}

impl LocalNoiseModel {
    pub fn noise_level(&self, scan_index: ScanIndex, mz: f64) -> f64 {
        let i = self
            .scans
            .partition_point(|s| *s <= scan_index)
            .saturating_sub(1);
        let bin = (mz.max(0.0) / self.bin_width) as usize;
        self.levels[i]
            .get(bin)
            .copied()
            .flatten()
            .unwrap_or(self.fallback[i])
    }
}

/// Accumulates MS1 scans for a [`NoiseModel::Local`] model
#[derive(Debug, Clone)]
pub struct NoiseStatistics {
    params: NoiseParams,
    scans: Vec<ScanIndex>,
    per_bin: Vec<Vec<Option<f64>>>,
    overall: Vec<f64>,
}

impl NoiseStatistics {
    pub fn new(params: NoiseParams) -> Self {
        Self {
            params,
            scans: Vec::new(),
            per_bin: Vec::new(),
            overall: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.scans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scans.is_empty()
    }

    pub fn add(&mut self, scan: &Scan, peaks: &PeakSet) {
        if peaks.is_empty() {
            return;
        }
        let mut bins: Vec<Vec<f64>> = Vec::new();
        let mut all = Vec::with_capacity(peaks.len());
        for p in peaks.iter() {
            let bin = (p.mz.max(0.0) / self.params.mz_bin_width) as usize;
            if bins.len() <= bin {
                bins.resize_with(bin + 1, Vec::new);
            }
            bins[bin].push(p.intensity as f64);
            all.push(p.intensity as f64);
        }
        let q = self.params.quantile;
        self.per_bin
            .push(bins.into_iter().map(|mut b| quantile(&mut b, q)).collect());
        self.overall.push(quantile(&mut all, q).unwrap_or_default());
        self.scans.push(scan.index);
    }

    pub fn done(self) -> NoiseModel {
        if self.scans.is_empty() {
            debug!("No MS1 scans to estimate noise from");
            return NoiseModel::Zero;
        }
        let n = self.scans.len();
        let half = self.params.window_size.max(1) / 2;
        let n_bins = self.per_bin.iter().map(|b| b.len()).max().unwrap_or_default();
        let mut levels = Vec::with_capacity(n);
        let mut fallback = Vec::with_capacity(n);
        let mut buffer = Vec::new();
        for i in 0..n {
            let lo = i.saturating_sub(half);
            let hi = (i + half + 1).min(n);
            let mut row = Vec::with_capacity(n_bins);
            for bin in 0..n_bins {
                buffer.clear();
                buffer.extend(
                    self.per_bin[lo..hi]
                        .iter()
                        .filter_map(|b| b.get(bin).copied().flatten()),
                );
                row.push(median(&mut buffer));
            }
            levels.push(row);
            buffer.clear();
            buffer.extend_from_slice(&self.overall[lo..hi]);
            fallback.push(median(&mut buffer).unwrap_or_default());
        }
        NoiseModel::Local(LocalNoiseModel {
            scans: self.scans,
            bin_width: self.params.mz_bin_width,
            levels,
            fallback,
        })
    }
}

/// The summary of fragment spectrum noise for one run
#[derive(Debug, Clone, Copy, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Ms2NoiseInformation {
    pub noise_level: f64,
    pub lower_quartile: f64,
    pub upper_quartile: f64,
    pub scans: usize,
}

/// Accumulates MS/MS scans for a global [`NoiseModel`]
#[derive(Debug, Clone)]
pub struct Ms2NoiseStatistics {
    quantile: f64,
    levels: Vec<f64>,
}

impl Ms2NoiseStatistics {
    pub fn new(quantile: f64) -> Self {
        Self {
            quantile,
            levels: Vec::new(),
        }
    }

    pub fn add(&mut self, peaks: &PeakSet) {
        let mut intensities: Vec<f64> = peaks.iter().map(|p| p.intensity as f64).collect();
        if let Some(level) = quantile(&mut intensities, self.quantile) {
            self.levels.push(level);
        }
    }

    pub fn len(&self) -> usize {
        self.levels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    pub fn done(mut self) -> (NoiseModel, Ms2NoiseInformation) {
        let scans = self.levels.len();
        match median(&mut self.levels) {
            Some(level) => {
                let info = Ms2NoiseInformation {
                    noise_level: level,
                    lower_quartile: quantile(&mut self.levels, 0.25).unwrap_or(level),
                    upper_quartile: quantile(&mut self.levels, 0.75).unwrap_or(level),
                    scans,
                };
                (NoiseModel::Global(level), info)
            }
            None => (NoiseModel::Zero, Ms2NoiseInformation::default()),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::scan::Polarity;
    use mzpeaks::CentroidPeak;

    fn flat_spectrum(level: f32) -> PeakSet {
        PeakSet::new(
            (0..50)
                .map(|i| CentroidPeak::new(100.0 + i as f64 * 4.0, level, i))
                .collect(),
        )
    }

    #[test]
    fn test_empty_is_zero() {
        let stats = NoiseStatistics::new(NoiseParams::default());
        let model = stats.done();
        assert_eq!(model, NoiseModel::Zero);
        assert_eq!(model.noise_level(10, 500.0), 0.0);
        let (ms2, info) = Ms2NoiseStatistics::new(0.2).done();
        assert_eq!(ms2.noise_level(0, 100.0), 0.0);
        assert_eq!(info.scans, 0);
    }

    #[test]
    fn test_local_levels_follow_baseline() {
        let params = NoiseParams {
            window_size: 10,
            ..Default::default()
        };
        let mut stats = NoiseStatistics::new(params);
        for i in 0..100 {
            let level = if i < 50 { 100.0 } else { 1000.0 };
            let scan = Scan::new(i, i as i64 * 500, Polarity::Positive);
            stats.add(&scan, &flat_spectrum(level));
        }
        let model = stats.done();
        assert!((model.noise_level(5, 150.0) - 100.0).abs() < 1e-6);
        assert!((model.noise_level(95, 150.0) - 1000.0).abs() < 1e-6);
        // no peaks were seen above 300 m/z, so the scan-wide level is used
        assert!((model.noise_level(95, 5000.0) - 1000.0).abs() < 1e-6);
    }

    #[test]
    fn test_ms2_global() {
        let mut stats = Ms2NoiseStatistics::new(0.2);
        for level in [10.0, 20.0, 30.0] {
            stats.add(&flat_spectrum(level));
        }
        let (model, info) = stats.done();
        assert_eq!(model, NoiseModel::Global(20.0));
        assert_eq!(info.scans, 3);
        assert_eq!(model.noise_level(1, 1.0), 20.0);
    }
}
