//! Ions: MS/MS-triggered elution events with their correlated partners.
use std::fmt::Display;
use std::sync::Arc;

use mzpeaks::PeakSet;

use crate::correlation::to_isotope_spectrum;
use crate::ion_type::IonType;
use crate::peak_shape::PeakShapeFit;
use crate::scan::{Polarity, ScanIndex};
use crate::spectrum::MergedSpectrum;
use crate::trace::{Segment, Trace, TraceKey};

/// A coarse rating of MS1 evidence, MS/MS evidence or elution shape
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Quality {
    #[default]
    Unusable,
    Bad,
    Decent,
    Good,
}

impl Quality {
    pub fn better_than(&self, other: Quality) -> bool {
        *self > other
    }

    pub fn at_least(&self, other: Quality) -> bool {
        *self >= other
    }
}

impl Display for Quality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// The identity of an ion within its sample: a trace and one of its segments
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IonKey {
    pub trace: TraceKey,
    pub segment: Segment,
}

impl Display for IonKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}[{}-{}-{}]",
            self.trace, self.segment.start, self.segment.apex, self.segment.end
        )
    }
}

/// A segment of another trace whose intensity profile follows the ion's
#[derive(Debug, Clone)]
pub struct CorrelatedTrace {
    pub trace: Arc<Trace>,
    pub segment: Segment,
    pub coefficient: f64,
    /// The number of scans both traces were compared over
    pub overlap: usize,
}

impl CorrelatedTrace {
    pub fn apex_intensity(&self) -> f32 {
        self.trace.intensity_at(self.segment.apex)
    }

    pub fn mz(&self) -> f64 {
        let (a, b) = self.trace.segment_fwhm(&self.segment, 0.5);
        self.trace.weighted_mz(a, b)
    }
}

/// Another ion of the same compound, explained by two ion types
#[derive(Debug, Clone)]
pub struct AdductPartner {
    /// The type assumed for the ion itself
    pub ion_type: IonType,
    /// The type of the partner under that assumption
    pub partner_type: IonType,
    pub partner: CorrelatedTrace,
    pub isotopes: Vec<CorrelatedTrace>,
}

/// An elution event of one m/z with at least one fragmentation spectrum, or recovered by
/// gap filling.
#[derive(Debug, Clone)]
pub struct FragmentedIon {
    pub trace: Arc<Trace>,
    pub segment: Segment,
    pub polarity: Polarity,
    pub charge: i32,
    pub msms: Option<MergedSpectrum>,
    /// The merged fragment peak list after filtering
    pub msms_peaks: Option<PeakSet>,
    pub isotopes: Vec<CorrelatedTrace>,
    pub adducts: Vec<AdductPartner>,
    pub detected_type: Option<IonType>,
    pub possible_types: Vec<IonType>,
    pub ms1_quality: Quality,
    pub ms2_quality: Quality,
    pub peak_shape: Option<PeakShapeFit>,
    /// The merged fragment intensity above the precursor m/z
    pub intensity_after_precursor: f64,
    /// The fraction of the MS1 isolation window intensity not explained by the ion or its
    /// isotopes, averaged over the fragmentation scans
    pub chimeric_pollution: f64,
    pub gap_filled: bool,
}

impl FragmentedIon {
    pub fn new(trace: Arc<Trace>, segment: Segment, polarity: Polarity) -> Self {
        Self {
            trace,
            segment,
            polarity,
            charge: polarity.charge(),
            msms: None,
            msms_peaks: None,
            isotopes: Vec::new(),
            adducts: Vec::new(),
            detected_type: None,
            possible_types: Vec::new(),
            ms1_quality: Quality::Unusable,
            ms2_quality: Quality::Unusable,
            peak_shape: None,
            intensity_after_precursor: 0.0,
            chimeric_pollution: 0.0,
            gap_filled: false,
        }
    }

    /// An ion recovered without fragmentation evidence
    pub fn gap_filled(trace: Arc<Trace>, segment: Segment, polarity: Polarity) -> Self {
        let mut ion = Self::new(trace, segment, polarity);
        ion.gap_filled = true;
        ion
    }

    pub fn key(&self) -> IonKey {
        IonKey {
            trace: self.trace.key(),
            segment: self.segment,
        }
    }

    pub fn has_msms(&self) -> bool {
        self.msms.is_some()
    }

    /// The intensity-weighted m/z over the half-maximum window of the segment
    pub fn mz(&self) -> f64 {
        let (a, b) = self.trace.segment_fwhm(&self.segment, 0.5);
        self.trace.weighted_mz(a, b)
    }

    pub fn apex_intensity(&self) -> f32 {
        self.trace.intensity_at(self.segment.apex)
    }

    pub fn apex_scan(&self) -> ScanIndex {
        self.trace.scan_index_at(self.segment.apex)
    }

    pub fn apex_retention_time(&self) -> i64 {
        self.trace.retention_time_at(self.segment.apex)
    }

    pub fn retention_time_span(&self) -> (i64, i64) {
        (
            self.trace.retention_time_at(self.segment.start),
            self.trace.retention_time_at(self.segment.end),
        )
    }

    pub fn scan_span(&self) -> (ScanIndex, ScanIndex) {
        (
            self.trace.scan_index_at(self.segment.start),
            self.trace.scan_index_at(self.segment.end),
        )
    }

    /// Whether the fragmentation evidence of this ion is at least `quality`
    pub fn ms2_at_least(&self, quality: Quality) -> bool {
        self.has_msms() && self.ms2_quality.at_least(quality)
    }

    /// The isotope pattern as (m/z, intensity relative to the monoisotopic peak) pairs
    pub fn isotope_pattern(&self) -> Vec<(f64, f64)> {
        to_isotope_spectrum(&self.trace, self.mz(), &self.isotopes)
    }

    /// The types this ion may be, the detected type if there is one
    pub fn candidate_types(&self) -> Vec<IonType> {
        match &self.detected_type {
            Some(t) => vec![t.clone()],
            None => self.possible_types.clone(),
        }
    }
}
