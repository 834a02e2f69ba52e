//! Scan metadata, the run container and the spectrum lookup interface.
use std::collections::HashMap;
use std::fmt::Display;

use identity_hash::BuildIdentityHasher;
use mzpeaks::{prelude::*, CentroidPeak, PeakSet, MZ};
use thiserror::Error;

use crate::error::ProcessingError;

/// The acquisition index of a scan within its run
pub type ScanIndex = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Polarity {
    #[default]
    Unknown,
    Positive,
    Negative,
}

impl Polarity {
    /// The sign of a singly charged ion of this polarity, positive when unknown
    pub fn charge(&self) -> i32 {
        match self {
            Polarity::Negative => -1,
            _ => 1,
        }
    }

    pub fn from_charge(charge: i32) -> Self {
        match charge.signum() {
            1 => Self::Positive,
            -1 => Self::Negative,
            _ => Self::Unknown,
        }
    }
}

impl Display for Polarity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// The m/z offsets below and above the selected precursor m/z that were isolated
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct IsolationWindow {
    pub lower_offset: f64,
    pub upper_offset: f64,
}

impl IsolationWindow {
    pub fn new(lower_offset: f64, upper_offset: f64) -> Self {
        Self {
            lower_offset,
            upper_offset,
        }
    }

    pub fn width(&self) -> f64 {
        self.lower_offset + self.upper_offset
    }

    pub fn bounds(&self, center: f64) -> (f64, f64) {
        (center - self.lower_offset, center + self.upper_offset)
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Precursor {
    pub mz: f64,
    pub intensity: f32,
    /// Zero when the charge state is not known
    pub charge: i32,
    pub isolation_window: Option<IsolationWindow>,
}

impl Precursor {
    pub fn new(mz: f64, intensity: f32, charge: i32) -> Self {
        Self {
            mz,
            intensity,
            charge,
            isolation_window: None,
        }
    }

    pub fn with_isolation_window(mut self, window: IsolationWindow) -> Self {
        self.isolation_window = Some(window);
        self
    }
}

/// Scan metadata. The presence of a precursor makes this a fragmentation (MS/MS) scan.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Scan {
    pub index: ScanIndex,
    /// Retention time in milliseconds
    pub retention_time: i64,
    pub polarity: Polarity,
    pub precursor: Option<Precursor>,
    pub collision_energy: f64,
    pub tic: f64,
    pub peak_count: usize,
    pub centroided: bool,
}

impl Scan {
    pub fn new(index: ScanIndex, retention_time: i64, polarity: Polarity) -> Self {
        Self {
            index,
            retention_time,
            polarity,
            precursor: None,
            collision_energy: 0.0,
            tic: 0.0,
            peak_count: 0,
            centroided: true,
        }
    }

    pub fn with_precursor(mut self, precursor: Precursor, collision_energy: f64) -> Self {
        self.precursor = Some(precursor);
        self.collision_energy = collision_energy;
        self
    }

    /// Fill in the peak count and total ion current from the scan's peak list
    pub fn with_peaks(mut self, peaks: &PeakSet) -> Self {
        self.peak_count = peaks.len();
        self.tic = peaks.iter().map(|p| p.intensity as f64).sum();
        self
    }

    pub fn is_msms(&self) -> bool {
        self.precursor.is_some()
    }
}

/// A single peak bound to the scan it was observed in
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ScanPoint {
    pub scan_index: ScanIndex,
    pub retention_time: i64,
    pub mz: f64,
    pub intensity: f32,
}

impl ScanPoint {
    pub fn new(scan_index: ScanIndex, retention_time: i64, mz: f64, intensity: f32) -> Self {
        Self {
            scan_index,
            retention_time,
            mz,
            intensity,
        }
    }

    pub fn from_peak(scan: &Scan, peak: &CentroidPeak) -> Self {
        Self::new(scan.index, scan.retention_time, peak.mz, peak.intensity)
    }
}

impl CoordinateLike<MZ> for ScanPoint {
    fn coordinate(&self) -> f64 {
        self.mz
    }
}

impl IntensityMeasurement for ScanPoint {
    fn intensity(&self) -> f32 {
        self.intensity
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    #[error("No spectrum is stored for scan {0}")]
    MissingSpectrum(ScanIndex),
    #[error("Failed to read the spectrum for scan {0}: {1}")]
    ReadFailed(ScanIndex, String),
}

/// Provides the centroided peak list of a scan. Lookups are expected to be fast and
/// already resident; a failure is fatal for the sample being processed.
pub trait SpectrumStorage: Send + Sync {
    fn get_scan(&self, scan: &Scan) -> Result<&PeakSet, StorageError>;
}

#[derive(Debug, Default, Clone)]
pub struct InMemorySpectrumStorage {
    spectra: HashMap<ScanIndex, PeakSet, BuildIdentityHasher<ScanIndex>>,
}

impl InMemorySpectrumStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, index: ScanIndex, peaks: PeakSet) -> Option<PeakSet> {
        self.spectra.insert(index, peaks)
    }

    pub fn len(&self) -> usize {
        self.spectra.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spectra.is_empty()
    }
}

impl SpectrumStorage for InMemorySpectrumStorage {
    fn get_scan(&self, scan: &Scan) -> Result<&PeakSet, StorageError> {
        self.spectra
            .get(&scan.index)
            .ok_or(StorageError::MissingSpectrum(scan.index))
    }
}

/// The scans of one LC-MS run ordered by index, with retention times non-decreasing.
#[derive(Debug, Clone, Default)]
pub struct LCMSRun {
    pub identifier: String,
    scans: Vec<Scan>,
}

impl LCMSRun {
    pub fn new(identifier: impl Into<String>, scans: Vec<Scan>) -> Result<Self, ProcessingError> {
        let identifier = identifier.into();
        for pair in scans.windows(2) {
            if pair[0].index >= pair[1].index {
                return Err(ProcessingError::InvalidInputData(format!(
                    "Scans of {identifier} are not ordered by index ({} before {})",
                    pair[0].index, pair[1].index
                )));
            }
            if pair[0].retention_time > pair[1].retention_time {
                return Err(ProcessingError::InvalidInputData(format!(
                    "Retention time decreases between scans {} and {} of {identifier}",
                    pair[0].index, pair[1].index
                )));
            }
        }
        Ok(Self { identifier, scans })
    }

    pub fn scans(&self) -> &[Scan] {
        &self.scans
    }

    pub fn len(&self) -> usize {
        self.scans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scans.is_empty()
    }

    fn position(&self, index: ScanIndex) -> Result<usize, usize> {
        self.scans.binary_search_by(|s| s.index.cmp(&index))
    }

    pub fn get(&self, index: ScanIndex) -> Option<&Scan> {
        self.position(index).ok().map(|i| &self.scans[i])
    }

    /// Scans with an index in `first..=last`
    pub fn scans_between(&self, first: ScanIndex, last: ScanIndex) -> &[Scan] {
        if first > last {
            return &[];
        }
        let start = self.scans.partition_point(|s| s.index < first);
        let end = self.scans.partition_point(|s| s.index <= last);
        &self.scans[start..end]
    }

    /// Scans acquired strictly after the scan `index`
    pub fn scans_after(&self, index: ScanIndex) -> &[Scan] {
        let start = self.scans.partition_point(|s| s.index <= index);
        &self.scans[start..]
    }

    /// Scans acquired strictly before the scan `index`
    pub fn scans_before(&self, index: ScanIndex) -> &[Scan] {
        let end = self.scans.partition_point(|s| s.index < index);
        &self.scans[..end]
    }

    /// Scans with a retention time in `start..=end`
    pub fn scans_between_times(&self, start: i64, end: i64) -> &[Scan] {
        if start > end {
            return &[];
        }
        let i = self.scans.partition_point(|s| s.retention_time < start);
        let j = self.scans.partition_point(|s| s.retention_time <= end);
        &self.scans[i..j]
    }

    pub fn ms1_scans(&self) -> impl Iterator<Item = &Scan> + '_ {
        self.scans.iter().filter(|s| !s.is_msms())
    }

    pub fn msms_scans(&self) -> impl Iterator<Item = &Scan> + '_ {
        self.scans.iter().filter(|s| s.is_msms())
    }

    /// The closest MS1 scan preceding `index`, falling back to the closest following one
    pub fn nearest_ms1(&self, index: ScanIndex) -> Option<&Scan> {
        self.scans_before(index)
            .iter()
            .rev()
            .find(|s| !s.is_msms())
            .or_else(|| self.scans_after(index).iter().find(|s| !s.is_msms()))
    }

    pub fn max_retention_time(&self) -> i64 {
        self.scans.last().map(|s| s.retention_time).unwrap_or_default()
    }
}
