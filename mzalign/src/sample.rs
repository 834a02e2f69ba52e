//! One LC-MS run with its noise context, detected ions and retention time correction.
use std::collections::HashSet;
use std::fmt::Debug;
use std::sync::Arc;

use rayon::prelude::*;
use statrs::distribution::Exp;
use tracing::{debug, info, warn};

use crate::align::recalibration::Recalibration;
use crate::builder::{ChromatogramBuilder, ChromatogramCache};
use crate::correlation::CorrelationDetector;
use crate::error::ProcessingError;
use crate::ion::{FragmentedIon, IonKey, Quality};
use crate::noise::{Ms2NoiseInformation, Ms2NoiseStatistics, NoiseModel, NoiseStatistics};
use crate::params::ProcessingParams;
use crate::peak_shape::fit_peak_shape;
use crate::processing::CancellationToken;
use crate::scan::{LCMSRun, Polarity, ScanIndex, SpectrumStorage};
use crate::segmenter::{assign_fragmentation_scans, SegmentScans};
use crate::spectrum::{chimeric_pollution, MergedSpectrum};
use crate::stats::robust_average;
use crate::trace::{Segment, TraceKey};

/// Robust summaries of the elution widths of a sample's ions
#[derive(Debug, Clone, Copy, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PeakWidthStatistics {
    /// The width at 20% of the apex height in milliseconds
    pub width: f64,
    pub width_to_height: f64,
    /// The robust spread of the width to height ratios around `width_to_height`
    pub width_to_height_std: f64,
    pub count: usize,
}

fn width_to_height(ion: &FragmentedIon) -> Option<f64> {
    let height = ion.apex_intensity() as f64;
    (height > 0.0).then(|| ion.trace.segment_width(&ion.segment, 0.2) as f64 / height)
}

impl PeakWidthStatistics {
    pub fn from_ions<'a>(ions: impl IntoIterator<Item = &'a FragmentedIon>) -> Self {
        let mut widths = Vec::new();
        let mut ratios = Vec::new();
        for ion in ions {
            widths.push(ion.trace.segment_width(&ion.segment, 0.2) as f64);
            ratios.extend(width_to_height(ion));
        }
        let width_to_height = robust_average(&mut ratios).unwrap_or_default();
        let mut deviations: Vec<f64> = ratios
            .iter()
            .map(|r| (r - width_to_height).powi(2))
            .collect();
        Self {
            count: widths.len(),
            width: robust_average(&mut widths).unwrap_or_default(),
            width_to_height,
            width_to_height_std: robust_average(&mut deviations)
                .unwrap_or_default()
                .sqrt(),
        }
    }

    /// How many standard deviations the width to height ratio of `ion` lies from the
    /// sample's typical ratio
    pub fn deviation(&self, ion: &FragmentedIon) -> Option<f64> {
        if self.width_to_height_std <= 0.0 {
            return None;
        }
        width_to_height(ion).map(|r| (r - self.width_to_height) / self.width_to_height_std)
    }
}

/// An exponential distribution over the fragment intensity found above the precursor,
/// with the median taken from the ions with usable MS/MS.
///
/// Only the upper half of the sorted values is considered, skipping zeros. Returns `None`
/// when no positive value remains.
pub fn intensity_after_precursor_distribution<'a>(
    ions: impl IntoIterator<Item = &'a FragmentedIon>,
) -> Option<Exp> {
    let mut values: Vec<f64> = ions
        .into_iter()
        .filter(|ion| ion.ms2_at_least(Quality::Decent))
        .map(|ion| ion.intensity_after_precursor)
        .collect();
    values.sort_by(f64::total_cmp);
    let median = values[values.len() / 2..]
        .iter()
        .copied()
        .find(|v| *v > 0.0)?;
    info!("Median intensity after precursor in MS/MS: {median}");
    Exp::new(std::f64::consts::LN_2 / median).ok()
}

/// A run prepared for feature detection and alignment
pub struct ProcessedSample {
    pub index: usize,
    run: LCMSRun,
    storage: Box<dyn SpectrumStorage>,
    pub ms1_noise: NoiseModel,
    pub ms2_noise: NoiseModel,
    pub ms2_noise_information: Ms2NoiseInformation,
    cache: ChromatogramCache,
    pub ions: Vec<Arc<FragmentedIon>>,
    pub gap_filled_ions: Vec<Arc<FragmentedIon>>,
    pub recalibration: Recalibration,
    pub peak_widths: PeakWidthStatistics,
    pub intensity_after_precursor: Option<Exp>,
    /// The latest retention time of any sample once alignment starts, of this run before
    pub max_retention_time: i64,
}

/// The parts of a sample that alignment modifies
#[derive(Debug, Clone)]
pub struct AlignmentState {
    ions: Vec<Arc<FragmentedIon>>,
    gap_filled_ions: Vec<Arc<FragmentedIon>>,
    recalibration: Recalibration,
    max_retention_time: i64,
}

impl Debug for ProcessedSample {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessedSample")
            .field("index", &self.index)
            .field("run", &self.run.identifier)
            .field("scans", &self.run.len())
            .field("ions", &self.ions.len())
            .field("gap_filled_ions", &self.gap_filled_ions.len())
            .field("recalibration", &self.recalibration)
            .field("peak_widths", &self.peak_widths)
            .field("intensity_after_precursor", &self.intensity_after_precursor)
            .field("max_retention_time", &self.max_retention_time)
            .finish()
    }
}

impl ProcessedSample {
    /// Validate a run and collect its noise statistics.
    ///
    /// Scans that are not centroided are skipped. A run without fragmentation scans is
    /// rejected.
    pub fn new(
        index: usize,
        run: LCMSRun,
        storage: Box<dyn SpectrumStorage>,
        params: &ProcessingParams,
    ) -> Result<Self, ProcessingError> {
        let identifier = run.identifier.clone();
        let total = run.len();
        let scans: Vec<_> = run.scans().iter().filter(|s| s.centroided).cloned().collect();
        if scans.len() < total {
            warn!(
                "Skipping {} scans of {identifier} that are not centroided",
                total - scans.len()
            );
        }
        if !scans.iter().any(|s| s.is_msms()) {
            return Err(ProcessingError::InvalidInputData(
                "Run has no MS/MS spectra.".to_string(),
            ));
        }
        if scans.iter().all(|s| s.is_msms()) {
            return Err(ProcessingError::InvalidInputData(
                "Run has no MS1 spectra to trace precursors in.".to_string(),
            ));
        }
        let run = LCMSRun::new(identifier, scans)?;

        let mut ms1_stats = NoiseStatistics::new(params.noise.clone());
        let mut ms2_stats = Ms2NoiseStatistics::new(params.noise.quantile);
        for scan in run.scans() {
            let peaks = storage.get_scan(scan)?;
            if scan.is_msms() {
                ms2_stats.add(peaks);
            } else {
                ms1_stats.add(scan, peaks);
            }
        }
        debug!(
            "{}: noise from {} MS1 and {} MS/MS scans",
            run.identifier,
            ms1_stats.len(),
            ms2_stats.len()
        );
        let ms1_noise = ms1_stats.done();
        let (ms2_noise, ms2_noise_information) = ms2_stats.done();
        let max_retention_time = run.max_retention_time();
        Ok(Self {
            index,
            run,
            storage,
            ms1_noise,
            ms2_noise,
            ms2_noise_information,
            cache: ChromatogramCache::new(),
            ions: Vec::new(),
            gap_filled_ions: Vec::new(),
            recalibration: Recalibration::Identity,
            peak_widths: PeakWidthStatistics::default(),
            intensity_after_precursor: None,
            max_retention_time,
        })
    }

    pub fn run(&self) -> &LCMSRun {
        &self.run
    }

    pub fn identifier(&self) -> &str {
        &self.run.identifier
    }

    pub fn storage(&self) -> &dyn SpectrumStorage {
        self.storage.as_ref()
    }

    pub fn builder<'a>(
        &'a self,
        params: &'a ProcessingParams,
    ) -> ChromatogramBuilder<'a, dyn SpectrumStorage> {
        ChromatogramBuilder::new(
            &self.run,
            self.storage.as_ref(),
            &self.ms1_noise,
            params,
            &self.cache,
        )
    }

    /// The polarity of the run's first scan
    pub fn polarity(&self) -> Polarity {
        self.run
            .scans()
            .first()
            .map(|s| s.polarity)
            .unwrap_or_default()
    }

    /// Confirmed and gap filled ions
    pub fn all_ions(&self) -> impl Iterator<Item = &Arc<FragmentedIon>> + '_ {
        self.ions.iter().chain(self.gap_filled_ions.iter())
    }

    pub fn recalibrated_time(&self, retention_time: i64) -> f64 {
        self.recalibration.apply(retention_time as f64)
    }

    /// Whether any ion of this sample already covers part of `segment` of the trace `key`
    pub fn is_segment_used(&self, key: TraceKey, segment: &Segment) -> bool {
        self.all_ions()
            .any(|ion| ion.trace.key() == key && ion.segment.overlaps(segment))
    }

    pub fn contains_ion(&self, key: &IonKey) -> bool {
        self.all_ions().any(|ion| ion.key() == *key)
    }

    /// Capture the state alignment will modify
    pub fn alignment_state(&self) -> AlignmentState {
        AlignmentState {
            ions: self.ions.clone(),
            gap_filled_ions: self.gap_filled_ions.clone(),
            recalibration: self.recalibration.clone(),
            max_retention_time: self.max_retention_time,
        }
    }

    pub fn restore_alignment_state(&mut self, state: AlignmentState) {
        self.ions = state.ions;
        self.gap_filled_ions = state.gap_filled_ions;
        self.recalibration = state.recalibration;
        self.max_retention_time = state.max_retention_time;
    }

    /// `retention_time` as a fraction of the latest retention time
    pub fn normalized_retention_time(&self, retention_time: f64) -> f64 {
        if self.max_retention_time > 0 {
            retention_time / self.max_retention_time as f64
        } else {
            0.0
        }
    }

    /// The mean over the fragmentation scans of the fraction of intensity in the MS1
    /// isolation window that neither the ion nor its isotopes explain
    fn chimeric_pollution(
        &self,
        ion: &FragmentedIon,
        scans: &[ScanIndex],
        params: &ProcessingParams,
    ) -> Result<f64, ProcessingError> {
        let mut explained: Vec<f64> = vec![ion.mz()];
        explained.extend(ion.isotopes.iter().map(|iso| iso.mz()));
        let mut total = 0.0;
        let mut count = 0usize;
        for index in scans {
            let Some(scan) = self.run.get(*index) else {
                continue;
            };
            let (Some(precursor), Some(ms1)) = (&scan.precursor, self.run.nearest_ms1(*index))
            else {
                continue;
            };
            let window = match precursor.isolation_window {
                Some(window) => window.bounds(precursor.mz),
                None => (
                    precursor.mz - params.ms2.isolation_half_width,
                    precursor.mz + params.ms2.isolation_half_width,
                ),
            };
            let peaks = self.storage.get_scan(ms1)?;
            total += chimeric_pollution(peaks, window, &explained, params.trace.tolerance());
            count += 1;
        }
        Ok(if count > 0 { total / count as f64 } else { 0.0 })
    }

    fn make_ion<S: SpectrumStorage + ?Sized>(
        &self,
        detector: &CorrelationDetector<'_, '_, S>,
        group: SegmentScans,
        params: &ProcessingParams,
    ) -> Result<Option<FragmentedIon>, ProcessingError> {
        let Some(first) = group.scans.first().and_then(|i| self.run.get(*i)) else {
            return Ok(None);
        };
        let Some(precursor) = first.precursor.clone() else {
            return Ok(None);
        };
        let polarity = match first.polarity {
            Polarity::Unknown => Polarity::from_charge(precursor.charge),
            p => p,
        };
        let noise = self.ms2_noise.noise_level(first.index, precursor.mz);
        let mut merged = MergedSpectrum::new(precursor.clone(), noise);
        for index in group.scans.iter() {
            let Some(scan) = self.run.get(*index) else {
                continue;
            };
            let peaks = self.storage.get_scan(scan)?;
            merged.merge(scan, peaks, params.ms2.tolerance());
        }
        let finished = merged.finish_merging();
        let scans = group.scans;

        let mut ion = FragmentedIon::new(group.trace, group.segment, polarity);
        if precursor.charge != 0 {
            ion.charge = precursor.charge.abs() * polarity.charge();
        }
        ion.ms2_quality = merged.quality(&finished);
        ion.intensity_after_precursor =
            merged.intensity_after_precursor(params.ms2.after_precursor_margin);
        ion.msms = Some(merged);
        ion.msms_peaks = Some(finished);
        if !detector.detect(&mut ion)? {
            return Ok(None);
        }
        ion.chimeric_pollution = self.chimeric_pollution(&ion, &scans, params)?;
        ion.peak_shape = Some(fit_peak_shape(
            &ion.trace,
            &ion.segment,
            &params.peak_shape,
        ));
        Ok(Some(ion))
    }

    /// Build ions from the fragmentation scans of the run, attach their correlated
    /// partners and fit their elution shapes.
    ///
    /// Replaces any previously detected ions and returns how many were found.
    pub fn detect_features(
        &mut self,
        params: &ProcessingParams,
        token: &CancellationToken,
    ) -> Result<usize, ProcessingError> {
        let ions = {
            let builder = self.builder(params);
            let groups = assign_fragmentation_scans(&builder, &params.ms2)?;
            token.check()?;
            let detector = CorrelationDetector::new(&builder, &self.ms1_noise, &params.correlation)?;
            let candidates = groups.len();
            let ions: Vec<Option<FragmentedIon>> = groups
                .into_par_iter()
                .map(|group| {
                    token.check()?;
                    self.make_ion(&detector, group, params)
                })
                .collect::<Result<_, ProcessingError>>()?;
            let ions: Vec<FragmentedIon> = ions.into_iter().flatten().collect();
            debug!(
                "{}: kept {} of {candidates} fragmented segments",
                self.run.identifier,
                ions.len()
            );
            ions
        };
        self.peak_widths = PeakWidthStatistics::from_ions(ions.iter());
        self.intensity_after_precursor = intensity_after_precursor_distribution(ions.iter());
        self.ions = ions.into_iter().map(Arc::new).collect();
        self.gap_filled_ions.clear();
        info!(
            "{}: detected {} ions, typical peak width {:.0} ms",
            self.run.identifier,
            self.ions.len(),
            self.peak_widths.width
        );
        Ok(self.ions.len())
    }

    /// Turn the segments of confirmed traces that no ion covers into gap filled pseudo-ions.
    ///
    /// Returns the number of pseudo-ions added.
    pub fn add_pseudo_ions(&mut self, params: &ProcessingParams) -> usize {
        let mut seen: HashSet<TraceKey> = HashSet::new();
        let traces: Vec<_> = self
            .ions
            .iter()
            .filter(|ion| seen.insert(ion.trace.key()))
            .map(|ion| (ion.trace.clone(), ion.polarity, ion.charge))
            .collect();
        let mut added: Vec<FragmentedIon> = Vec::new();
        for (trace, polarity, charge) in traces {
            for segment in trace.segments() {
                let taken = added
                    .iter()
                    .any(|a| a.trace.key() == trace.key() && a.segment.overlaps(segment));
                if taken || self.is_segment_used(trace.key(), segment) {
                    continue;
                }
                let mut ion = FragmentedIon::gap_filled(trace.clone(), *segment, polarity);
                ion.charge = charge;
                ion.peak_shape = Some(fit_peak_shape(&trace, segment, &params.peak_shape));
                added.push(ion);
            }
        }
        let n = added.len();
        self.gap_filled_ions.extend(added.into_iter().map(Arc::new));
        debug!("{}: added {n} pseudo-ions", self.run.identifier);
        n
    }

    /// Drop the ions for which `keep` returns false
    pub fn retain_ions<F: FnMut(&FragmentedIon) -> bool>(&mut self, mut keep: F) -> usize {
        let before = self.ions.len();
        self.ions.retain(|ion| keep(ion));
        before - self.ions.len()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::scan::{InMemorySpectrumStorage, Precursor, Scan, ScanPoint};
    use crate::trace::Trace;
    use mzpeaks::{CentroidPeak, PeakSet};
    use statrs::distribution::ContinuousCDF;

    fn triangle_ion(mz: f64, height: f32) -> FragmentedIon {
        let points = [0.1, 0.5, 1.0, 0.5, 0.1]
            .iter()
            .enumerate()
            .map(|(i, f)| ScanPoint::new(i, i as i64 * 1000, mz, height * f))
            .collect();
        let mut trace = Trace::from_points(TraceKey::new(0, mz), points).unwrap();
        let segment = trace.add_segment(0, 2, 4).unwrap();
        FragmentedIon::new(Arc::new(trace), segment, Polarity::Positive)
    }

    fn fragmented(after_precursor: f64, quality: Quality) -> FragmentedIon {
        let mut ion = triangle_ion(300.0, 1000.0);
        ion.msms = Some(MergedSpectrum::new(Precursor::new(300.0, 1000.0, 1), 1.0));
        ion.ms2_quality = quality;
        ion.intensity_after_precursor = after_precursor;
        ion
    }

    fn ms1_only_run() -> (LCMSRun, InMemorySpectrumStorage) {
        let mut storage = InMemorySpectrumStorage::new();
        let scans = (0..10)
            .map(|i| {
                let peaks = PeakSet::new(vec![CentroidPeak::new(300.0, 100.0, 0)]);
                let scan = Scan::new(i, i as i64 * 1000, Polarity::Positive).with_peaks(&peaks);
                storage.insert(i, peaks);
                scan
            })
            .collect();
        (LCMSRun::new("ms1", scans).unwrap(), storage)
    }

    #[test]
    fn test_rejects_ms1_only() {
        let (run, storage) = ms1_only_run();
        let err = ProcessedSample::new(0, run, Box::new(storage), &ProcessingParams::default())
            .unwrap_err();
        match err {
            ProcessingError::InvalidInputData(msg) => assert_eq!(msg, "Run has no MS/MS spectra."),
            e => panic!("unexpected error {e}"),
        }
    }

    #[test]
    fn test_rejects_msms_only() {
        let peaks = PeakSet::new(vec![CentroidPeak::new(120.0, 50.0, 0)]);
        let mut storage = InMemorySpectrumStorage::new();
        let scans = (0..3)
            .map(|i| {
                storage.insert(i, peaks.clone());
                Scan::new(i, i as i64 * 1000, Polarity::Positive)
                    .with_precursor(Precursor::new(300.0, 100.0, 1), 20.0)
                    .with_peaks(&peaks)
            })
            .collect();
        let run = LCMSRun::new("fragments", scans).unwrap();
        assert!(matches!(
            ProcessedSample::new(0, run, Box::new(storage), &ProcessingParams::default()),
            Err(ProcessingError::InvalidInputData(_))
        ));
    }

    #[test]
    fn test_skips_profile_scans() {
        let (run, mut storage) = ms1_only_run();
        let mut scans = run.scans().to_vec();
        let peaks = PeakSet::new(vec![CentroidPeak::new(120.0, 50.0, 0)]);
        let mut profile = Scan::new(20, 20_000, Polarity::Positive)
            .with_precursor(Precursor::new(300.0, 100.0, 1), 20.0);
        profile.centroided = false;
        scans.push(profile);
        storage.insert(20, peaks.clone());
        let run = LCMSRun::new("profile", scans.clone()).unwrap();
        // the only fragmentation scan is in profile mode
        assert!(ProcessedSample::new(0, run, Box::new(storage.clone()), &ProcessingParams::default()).is_err());

        scans.push(
            Scan::new(21, 21_000, Polarity::Positive)
                .with_precursor(Precursor::new(300.0, 100.0, 1), 20.0)
                .with_peaks(&peaks),
        );
        storage.insert(21, peaks);
        let run = LCMSRun::new("centroid", scans).unwrap();
        let sample =
            ProcessedSample::new(3, run, Box::new(storage), &ProcessingParams::default()).unwrap();
        assert_eq!(sample.run().len(), 11);
        assert_eq!(sample.max_retention_time, 21_000);
        assert_eq!(sample.ms2_noise_information.scans, 1);
        assert!(sample.recalibration.is_identity());
    }

    #[test]
    fn test_width_to_height_spread() {
        let ions = [
            triangle_ion(300.0, 1000.0),
            triangle_ion(310.0, 2000.0),
            triangle_ion(320.0, 4000.0),
        ];
        let stats = PeakWidthStatistics::from_ions(ions.iter());
        assert_eq!(stats.count, 3);
        assert!(stats.width_to_height_std > 0.0);
        let low = stats.deviation(&ions[0]).unwrap();
        let high = stats.deviation(&ions[2]).unwrap();
        // the lowest peak is the broadest relative to its height
        assert!(low > 0.0, "{low}");
        assert!(high < 0.0, "{high}");

        let same = [triangle_ion(300.0, 1000.0), triangle_ion(310.0, 1000.0)];
        let stats = PeakWidthStatistics::from_ions(same.iter());
        assert_eq!(stats.width_to_height_std, 0.0);
        assert!(stats.deviation(&same[0]).is_none());
    }

    #[test]
    fn test_intensity_after_precursor_distribution() {
        let ions = vec![
            fragmented(0.0, Quality::Good),
            fragmented(0.0, Quality::Good),
            fragmented(0.0, Quality::Decent),
            fragmented(4.0, Quality::Good),
            fragmented(8.0, Quality::Good),
            fragmented(10.0, Quality::Good),
            fragmented(1e6, Quality::Bad),
        ];
        let dist = intensity_after_precursor_distribution(ions.iter()).unwrap();
        assert!((dist.cdf(4.0) - 0.5).abs() < 1e-9);

        let zeros = vec![fragmented(0.0, Quality::Good), fragmented(0.0, Quality::Good)];
        assert!(intensity_after_precursor_distribution(zeros.iter()).is_none());
        assert!(intensity_after_precursor_distribution(std::iter::empty()).is_none());
    }

    #[test]
    fn test_restore_alignment_state() {
        let (run, mut storage) = ms1_only_run();
        let mut scans = run.scans().to_vec();
        let peaks = PeakSet::new(vec![CentroidPeak::new(120.0, 50.0, 0)]);
        scans.push(
            Scan::new(10, 10_000, Polarity::Positive)
                .with_precursor(Precursor::new(300.0, 100.0, 1), 20.0)
                .with_peaks(&peaks),
        );
        storage.insert(10, peaks);
        let run = LCMSRun::new("restore", scans).unwrap();
        let mut sample =
            ProcessedSample::new(0, run, Box::new(storage), &ProcessingParams::default()).unwrap();
        sample.ions.push(Arc::new(triangle_ion(300.0, 1000.0)));
        let state = sample.alignment_state();

        sample.ions.clear();
        sample
            .gap_filled_ions
            .push(Arc::new(triangle_ion(310.0, 500.0)));
        sample.recalibration = Recalibration::Shift(500.0);
        sample.max_retention_time = 50_000;
        assert!((sample.normalized_retention_time(25_000.0) - 0.5).abs() < 1e-12);

        sample.restore_alignment_state(state);
        assert_eq!(sample.ions.len(), 1);
        assert!(sample.gap_filled_ions.is_empty());
        assert!(sample.recalibration.is_identity());
        assert_eq!(sample.max_retention_time, 10_000);
    }
}
