//! Configuration for every processing stage.
//!
//! All thresholds live here and are passed explicitly to the builder and the orchestrator
//! so a run is reproducible from its [`ProcessingParams`] alone.
use mzpeaks::Tolerance;

use crate::ion::Quality;

/// The ion types searched for as adduct partners by default
pub const DEFAULT_DETECTABLE_ION_TYPES: &[&str] = &[
    "[M+Na]+",
    "[M+K]+",
    "[M+H]+",
    "[M-H2O+H]+",
    "[M-H4O2+H]+",
    "[M-H2O+Na]+",
    "[M+NH3+H]+",
    "[M-H]-",
    "[M+Cl]-",
    "[M+Br]-",
    "[M-H2O-H]-",
];

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(default)
)]
pub struct NoiseParams {
    /// The number of MS1 scans pooled around each scan
    pub window_size: usize,
    /// The intensity quantile taken as a scan's noise level
    pub quantile: f64,
    /// The width of the m/z bins noise is estimated in
    pub mz_bin_width: f64,
}

impl Default for NoiseParams {
    fn default() -> Self {
        Self {
            window_size: 100,
            quantile: 0.2,
            mz_bin_width: 100.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(default)
)]
pub struct TraceParams {
    /// The mass tolerance between consecutive points of a trace
    pub mass_tolerance_ppm: f64,
    /// The variance of the log-intensity ratio term when choosing between candidates
    pub intensity_variance: f64,
    /// The fraction of the isolation window searched when the precursor peak is missing
    pub isolation_window_fraction: f64,
}

impl TraceParams {
    pub fn tolerance(&self) -> Tolerance {
        Tolerance::PPM(self.mass_tolerance_ppm)
    }
}

impl Default for TraceParams {
    fn default() -> Self {
        Self {
            mass_tolerance_ppm: 20.0,
            intensity_variance: 1.0,
            isolation_window_fraction: 0.33,
        }
    }
}

/// Use a smoothing filter of `half_width` for traces shorter than `max_length`.
///
/// A Savitzky-Golay `polynomial_order` below `half_width` is raised to it, the lowest
/// order whose edge refit stays inside the zero padding.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SmoothingStep {
    pub max_length: usize,
    pub half_width: usize,
    pub polynomial_order: usize,
}

/// Escalate to `half_width` when a trace of at least `min_length` points produced more
/// than `max_extrema` extrema
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct EscalationRule {
    pub min_length: usize,
    pub max_extrema: usize,
    pub half_width: usize,
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(default)
)]
pub struct SegmentationParams {
    /// Traces with fewer points are never smoothed nor kept
    pub min_trace_length: usize,
    pub ladder: Vec<SmoothingStep>,
    pub escalation: Vec<EscalationRule>,
    /// The polynomial order used once the ladder escalates. Orders of one or less are a
    /// moving average while the window spans at most 20 points.
    pub escalation_polynomial_order: usize,
    pub max_half_width: usize,
    /// The initial extremum threshold as a fraction of the local noise level
    pub noise_factor: f64,
    /// The weight of the previous threshold in the adaptive update
    pub threshold_decay: f64,
    /// The quantile of scan-to-scan intensity ratios taken as the typical jump
    pub jump_quantile: f64,
}

impl Default for SegmentationParams {
    fn default() -> Self {
        Self {
            min_trace_length: 3,
            ladder: vec![
                SmoothingStep {
                    max_length: 10,
                    half_width: 1,
                    polynomial_order: 1,
                },
                SmoothingStep {
                    max_length: 20,
                    half_width: 2,
                    polynomial_order: 2,
                },
                SmoothingStep {
                    max_length: 50,
                    half_width: 3,
                    polynomial_order: 2,
                },
                SmoothingStep {
                    max_length: u32::MAX as usize,
                    half_width: 4,
                    polynomial_order: 2,
                },
            ],
            escalation: vec![
                EscalationRule {
                    min_length: 100,
                    max_extrema: 8,
                    half_width: 6,
                },
                EscalationRule {
                    min_length: 200,
                    max_extrema: 16,
                    half_width: 9,
                },
            ],
            escalation_polynomial_order: 1,
            max_half_width: 9,
            noise_factor: 0.1,
            threshold_decay: 0.9,
            jump_quantile: 0.33,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(default)
)]
pub struct CorrelationParams {
    pub mass_tolerance_ppm: f64,
    /// Extra absolute slack around isotope positions to allow for mass defects
    pub isotope_mass_slack: f64,
    pub max_isotopes: usize,
    pub min_isotope_correlation: f64,
    pub min_adduct_correlation: f64,
    /// The minimum number of shared scans two traces must have to be correlated
    pub min_overlap: usize,
    /// A correlated peak one isotope below the ion marks the ion as an isotope peak itself
    /// when the ion reaches at most this fraction of its intensity
    pub monoisotopic_ratio: f64,
    pub detectable_ion_types: Vec<String>,
}

impl CorrelationParams {
    pub fn tolerance(&self) -> Tolerance {
        Tolerance::PPM(self.mass_tolerance_ppm)
    }
}

impl Default for CorrelationParams {
    fn default() -> Self {
        Self {
            mass_tolerance_ppm: 10.0,
            isotope_mass_slack: 0.005,
            max_isotopes: 5,
            min_isotope_correlation: 0.7,
            min_adduct_correlation: 0.8,
            min_overlap: 4,
            monoisotopic_ratio: 0.6,
            detectable_ion_types: DEFAULT_DETECTABLE_ION_TYPES
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(default)
)]
pub struct Ms2Params {
    /// The tolerance used to merge fragment peaks of different scans
    pub mass_tolerance_ppm: f64,
    /// The largest distance in milliseconds between an MS/MS scan and a segment apex it
    /// may be attached to when no segment spans it
    pub max_apex_distance: i64,
    /// Fragment intensity more than this many m/z above the precursor counts as intensity
    /// after the precursor
    pub after_precursor_margin: f64,
    /// The half-width in m/z of the isolation window assumed when a scan does not report one
    pub isolation_half_width: f64,
}

impl Ms2Params {
    pub fn tolerance(&self) -> Tolerance {
        Tolerance::PPM(self.mass_tolerance_ppm)
    }
}

impl Default for Ms2Params {
    fn default() -> Self {
        Self {
            mass_tolerance_ppm: 10.0,
            max_apex_distance: 5000,
            after_precursor_margin: 2.5,
            isolation_half_width: 0.5,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(default)
)]
pub struct PeakShapeParams {
    pub good_score: f64,
    pub decent_score: f64,
    pub bad_score: f64,
    /// The gradient descent budget of each model fit
    pub max_iterations: usize,
}

impl Default for PeakShapeParams {
    fn default() -> Self {
        Self {
            good_score: 0.9,
            decent_score: 0.75,
            bad_score: 0.5,
            max_iterations: 2000,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(default)
)]
pub struct AlignmentParams {
    pub mass_tolerance_ppm: f64,
    /// The widest retention time difference, in milliseconds, considered by the coarse
    /// error estimate
    pub max_rt_shift: f64,
    /// The smallest retention time tolerance, in milliseconds, used for clustering
    pub min_rt_error: f64,
    /// Rows and ions are matched within this many error terms
    pub rt_window_factor: f64,
    pub prefilter_error_factor: f64,
    pub prefilter_min_matches: usize,
    pub first_round_error_factor: f64,
    /// The weight of the fragment spectrum cosine when both sides have one
    pub cosine_weight: f64,
    pub large_cohort_size: usize,
    pub min_entries_in_large_cohort: usize,
}

impl AlignmentParams {
    pub fn tolerance(&self) -> Tolerance {
        Tolerance::PPM(self.mass_tolerance_ppm)
    }
}

impl Default for AlignmentParams {
    fn default() -> Self {
        Self {
            mass_tolerance_ppm: 10.0,
            max_rt_shift: 120_000.0,
            min_rt_error: 500.0,
            rt_window_factor: 4.0,
            prefilter_error_factor: 15.0,
            prefilter_min_matches: 1,
            first_round_error_factor: 5.0,
            cosine_weight: 0.5,
            large_cohort_size: 50,
            min_entries_in_large_cohort: 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(default)
)]
pub struct GapFillingParams {
    /// Gap filled segments must lie within this many error terms of the row
    pub rt_window_factor: f64,
    /// The strict pass requires a peak shape score of at least this fraction of the
    /// cluster's typical score
    pub strict_shape_fraction: f64,
    pub strict_min_quality: Quality,
    pub permissive_min_quality: Quality,
}

impl Default for GapFillingParams {
    fn default() -> Self {
        Self {
            rt_window_factor: 3.0,
            strict_shape_fraction: 0.8,
            strict_min_quality: Quality::Decent,
            permissive_min_quality: Quality::Bad,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(default)
)]
pub struct NetworkParams {
    pub seed: u64,
    pub burn_in: usize,
    pub iterations: usize,
    /// Types at least this fraction as likely as the best are retained
    pub retain_fraction: f64,
    /// The prior weight of an edge being a coincidence rather than an adduct relation
    pub unrelated_prior: f64,
    /// The weight given to a node carrying two different types at once
    pub inconsistency_penalty: f64,
    /// The prior weight of a protonated or deprotonated type relative to other adducts
    pub common_type_prior: f64,
}

impl Default for NetworkParams {
    fn default() -> Self {
        Self {
            seed: 0x5eed,
            burn_in: 200,
            iterations: 1000,
            retain_fraction: 0.2,
            unrelated_prior: 0.05,
            inconsistency_penalty: 0.01,
            common_type_prior: 2.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(default)
)]
pub struct ProcessingParams {
    pub noise: NoiseParams,
    pub trace: TraceParams,
    pub segmentation: SegmentationParams,
    pub correlation: CorrelationParams,
    pub ms2: Ms2Params,
    pub peak_shape: PeakShapeParams,
    pub alignment: AlignmentParams,
    pub gap_filling: GapFillingParams,
    pub network: NetworkParams,
    /// The size of the worker pool, zero to use all available cores
    pub threads: usize,
}
