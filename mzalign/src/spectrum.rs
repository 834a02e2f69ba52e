//! Fragmentation spectra merged over the MS/MS scans of one elution event.
use mzpeaks::{CentroidPeak, PeakSet, Tolerance};

use crate::ion::Quality;
use crate::scan::{Precursor, Scan, ScanIndex};

/// A fragment peak observed in one or more scans
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MergedPeak {
    pub mz: f64,
    pub intensity: f32,
    sources: Vec<ScanIndex>,
}

impl MergedPeak {
    fn new(scan_index: ScanIndex, mz: f64, intensity: f32) -> Self {
        Self {
            mz,
            intensity,
            sources: vec![scan_index],
        }
    }

    fn add(&mut self, scan_index: ScanIndex, mz: f64, intensity: f32) {
        let total = self.intensity as f64 + intensity as f64;
        if total > 0.0 {
            self.mz = (self.mz * self.intensity as f64 + mz * intensity as f64) / total;
        }
        self.intensity += intensity;
        self.sources.push(scan_index);
    }

    /// The scans this peak was seen in
    pub fn sources(&self) -> &[ScanIndex] {
        &self.sources
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
struct MergedScan {
    index: ScanIndex,
    retention_time: i64,
    tic: f64,
    collision_energy: f64,
}

/// The sum of the fragmentation scans of one precursor.
///
/// Peaks from different scans within the merge tolerance are combined, summing their
/// intensities and recording which scans contributed.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MergedSpectrum {
    precursor: Precursor,
    scans: Vec<MergedScan>,
    peaks: Vec<MergedPeak>,
    noise_level: f64,
}

impl MergedSpectrum {
    pub fn new(precursor: Precursor, noise_level: f64) -> Self {
        Self {
            precursor,
            scans: Vec::new(),
            peaks: Vec::new(),
            noise_level,
        }
    }

    pub fn precursor(&self) -> &Precursor {
        &self.precursor
    }

    pub fn noise_level(&self) -> f64 {
        self.noise_level
    }

    pub fn peaks(&self) -> &[MergedPeak] {
        &self.peaks
    }

    pub fn len(&self) -> usize {
        self.peaks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peaks.is_empty()
    }

    pub fn scan_count(&self) -> usize {
        self.scans.len()
    }

    pub fn scan_indices(&self) -> impl Iterator<Item = ScanIndex> + '_ {
        self.scans.iter().map(|s| s.index)
    }

    pub fn retention_times(&self) -> impl Iterator<Item = i64> + '_ {
        self.scans.iter().map(|s| s.retention_time)
    }

    /// The mean collision energy of the merged scans
    pub fn collision_energy(&self) -> f64 {
        if self.scans.is_empty() {
            return 0.0;
        }
        self.scans.iter().map(|s| s.collision_energy).sum::<f64>() / self.scans.len() as f64
    }

    fn highest_tic_scan(&self) -> Option<ScanIndex> {
        self.scans
            .iter()
            .max_by(|a, b| a.tic.total_cmp(&b.tic))
            .map(|s| s.index)
    }

    /// Add the peaks of `scan` to the spectrum, merging each into the nearest existing peak
    /// within `tolerance`.
    pub fn merge(&mut self, scan: &Scan, peaks: &PeakSet, tolerance: Tolerance) {
        self.scans.push(MergedScan {
            index: scan.index,
            retention_time: scan.retention_time,
            tic: scan.tic,
            collision_energy: scan.collision_energy,
        });
        for peak in peaks.iter() {
            let (lo, hi) = tolerance.bounds(peak.mz);
            let start = self.peaks.partition_point(|p| p.mz < lo);
            let nearest = self.peaks[start..]
                .iter()
                .enumerate()
                .take_while(|(_, p)| p.mz <= hi)
                .filter(|(_, p)| !p.sources.contains(&scan.index))
                .min_by(|a, b| {
                    (a.1.mz - peak.mz)
                        .abs()
                        .total_cmp(&(b.1.mz - peak.mz).abs())
                })
                .map(|(i, _)| start + i);
            match nearest {
                Some(i) => self.peaks[i].add(scan.index, peak.mz, peak.intensity),
                None => {
                    let i = self.peaks.partition_point(|p| p.mz < peak.mz);
                    self.peaks
                        .insert(i, MergedPeak::new(scan.index, peak.mz, peak.intensity));
                }
            }
        }
    }

    /// Produce the final fragment peak list.
    ///
    /// With at least five scans a peak must be seen in a fifth of them, or be above twice
    /// the noise level in the most intense scan, and may not lie more than 10 m/z above the
    /// precursor. With fewer scans peaks below twice the noise level or within 20 m/z of the
    /// precursor are removed.
    pub fn finish_merging(&self) -> PeakSet {
        let n = self.scans.len();
        let precursor_mz = self.precursor.mz;
        let baseline = 2.0 * self.noise_level;
        let kept: Vec<&MergedPeak> = if n >= 5 {
            let min_sources = (n as f64 * 0.2).ceil() as usize;
            let top = self.highest_tic_scan();
            self.peaks
                .iter()
                .filter(|p| p.mz <= precursor_mz + 10.0)
                .filter(|p| {
                    p.sources.len() >= min_sources
                        || (p.intensity as f64 > baseline
                            && top.map(|t| p.sources.contains(&t)).unwrap_or(false))
                })
                .collect()
        } else {
            self.peaks
                .iter()
                .filter(|p| p.intensity as f64 >= baseline && p.mz <= precursor_mz - 20.0)
                .collect()
        };
        PeakSet::new(
            kept.into_iter()
                .enumerate()
                .map(|(i, p)| CentroidPeak::new(p.mz, p.intensity, i as u32))
                .collect(),
        )
    }

    /// Rate a finished peak list by the number of fragments clearly above noise
    pub fn quality(&self, finished: &PeakSet) -> Quality {
        let threshold = 3.0 * self.noise_level;
        let limit = self.precursor.mz - 20.0;
        let informative = finished
            .iter()
            .filter(|p| p.mz < limit && p.intensity as f64 >= threshold)
            .count();
        match informative {
            n if n >= 5 => Quality::Good,
            n if n >= 3 => Quality::Decent,
            _ => Quality::Bad,
        }
    }

    /// The summed intensity of the peaks below the precursor and above noise
    pub fn total_intensity(&self) -> f64 {
        let limit = self.precursor.mz - 20.0;
        self.peaks
            .iter()
            .filter(|p| p.mz < limit && p.intensity as f64 >= self.noise_level)
            .map(|p| p.intensity as f64)
            .sum()
    }

    /// The summed intensity of the merged peaks more than `margin` m/z above the precursor
    pub fn intensity_after_precursor(&self, margin: f64) -> f64 {
        let limit = self.precursor.mz + margin;
        self.peaks
            .iter()
            .filter(|p| p.mz > limit)
            .map(|p| p.intensity as f64)
            .sum()
    }

    /// The cosine similarity of two spectra after matching peaks within `tolerance`
    pub fn cosine(&self, other: &MergedSpectrum, tolerance: Tolerance) -> f64 {
        cosine(&self.peaks, &other.peaks, tolerance)
    }
}

/// The fraction of the intensity of `peaks` within `lo..=hi` that does not match any of
/// the `explained` m/z values within `tolerance`. An empty window is not polluted.
pub fn chimeric_pollution(
    peaks: &PeakSet,
    (lo, hi): (f64, f64),
    explained: &[f64],
    tolerance: Tolerance,
) -> f64 {
    let (mut total, mut foreign) = (0.0, 0.0);
    for peak in peaks.iter().filter(|p| lo <= p.mz && p.mz <= hi) {
        let intensity = peak.intensity as f64;
        total += intensity;
        let matched = explained.iter().any(|mz| {
            let (a, b) = tolerance.bounds(*mz);
            a <= peak.mz && peak.mz <= b
        });
        if !matched {
            foreign += intensity;
        }
    }
    if total > 0.0 {
        foreign / total
    } else {
        0.0
    }
}

fn cosine(left: &[MergedPeak], right: &[MergedPeak], tolerance: Tolerance) -> f64 {
    let norm = |peaks: &[MergedPeak]| {
        peaks
            .iter()
            .map(|p| (p.intensity as f64).powi(2))
            .sum::<f64>()
            .sqrt()
    };
    let (nl, nr) = (norm(left), norm(right));
    if nl == 0.0 || nr == 0.0 {
        return 0.0;
    }
    let mut dot = 0.0;
    let mut j = 0;
    for p in left {
        let (lo, hi) = tolerance.bounds(p.mz);
        while j < right.len() && right[j].mz < lo {
            j += 1;
        }
        if j < right.len() && right[j].mz <= hi {
            dot += p.intensity as f64 * right[j].intensity as f64;
            j += 1;
        }
    }
    (dot / (nl * nr)).clamp(0.0, 1.0)
}
