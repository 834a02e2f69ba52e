//! Seeding, extending and segmenting chromatographic traces.
//!
//! Every search in [`ChromatogramBuilder`] returns `Ok(None)` when nothing usable is found.
//! Errors are reserved for storage failures and broken trace invariants.
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use mzpeaks::{prelude::*, CentroidPeak, PeakSet, Tolerance};
use tracing::trace;

use crate::error::BuildError;
use crate::extrema::segment_trace;
use crate::noise::NoiseModel;
use crate::params::ProcessingParams;
use crate::scan::{LCMSRun, Precursor, Scan, ScanIndex, ScanPoint, SpectrumStorage};
use crate::trace::{Trace, TraceKey};

pub type TraceResult = Result<Option<Arc<Trace>>, BuildError>;

type TraceCell = Arc<OnceLock<TraceResult>>;

/// A concurrent compute-if-absent cache of traces keyed by seed point.
///
/// Each key owns a cell that is initialized at most once, so concurrent requests for the
/// same seed wait for the single build instead of repeating it. The map lock is only held
/// while looking up or inserting cells.
#[derive(Debug, Default)]
pub struct ChromatogramCache {
    cells: Mutex<HashMap<TraceKey, TraceCell>>,
    builds: AtomicUsize,
}

impl ChromatogramCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn cell(&self, key: TraceKey) -> TraceCell {
        let mut cells = self.cells.lock().unwrap_or_else(PoisonError::into_inner);
        cells.entry(key).or_default().clone()
    }

    /// Return the trace cached for `key`, running `build` if no build has happened yet
    pub fn get_or_build<F>(&self, key: TraceKey, build: F) -> TraceResult
    where
        F: FnOnce() -> Result<Option<Trace>, BuildError>,
    {
        let cell = self.cell(key);
        cell.get_or_init(|| {
            self.builds.fetch_add(1, Ordering::Relaxed);
            let built = build()?.map(Arc::new);
            if let Some(trace) = built.as_ref() {
                self.register_members(trace);
            }
            Ok(built)
        })
        .clone()
    }

    /// Make every point of `trace` resolve to it, without replacing cells that already
    /// exist.
    fn register_members(&self, trace: &Arc<Trace>) {
        let mut cells = self.cells.lock().unwrap_or_else(PoisonError::into_inner);
        for point in trace.points() {
            cells.entry(TraceKey::from(point)).or_insert_with(|| {
                let cell = OnceLock::new();
                let _ = cell.set(Ok(Some(trace.clone())));
                Arc::new(cell)
            });
        }
    }

    pub fn get(&self, key: &TraceKey) -> Option<Arc<Trace>> {
        let cell = {
            let cells = self.cells.lock().unwrap_or_else(PoisonError::into_inner);
            cells.get(key)?.clone()
        };
        match cell.get() {
            Some(Ok(trace)) => trace.clone(),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.cells
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The number of builds actually executed
    pub fn builds(&self) -> usize {
        self.builds.load(Ordering::Relaxed)
    }
}

fn most_intense<'p>(peaks: &'p [CentroidPeak]) -> Option<&'p CentroidPeak> {
    peaks
        .iter()
        .max_by(|a, b| a.intensity.total_cmp(&b.intensity))
}

/// Builds traces for one sample from its scans, spectra and MS1 noise model.
pub struct ChromatogramBuilder<'a, S: SpectrumStorage + ?Sized> {
    run: &'a LCMSRun,
    storage: &'a S,
    noise: &'a NoiseModel,
    params: &'a ProcessingParams,
    cache: &'a ChromatogramCache,
}

impl<'a, S: SpectrumStorage + ?Sized> ChromatogramBuilder<'a, S> {
    pub fn new(
        run: &'a LCMSRun,
        storage: &'a S,
        noise: &'a NoiseModel,
        params: &'a ProcessingParams,
        cache: &'a ChromatogramCache,
    ) -> Self {
        Self {
            run,
            storage,
            noise,
            params,
            cache,
        }
    }

    pub fn run(&self) -> &LCMSRun {
        self.run
    }

    pub fn cache(&self) -> &ChromatogramCache {
        self.cache
    }

    fn peaks(&self, scan: &Scan) -> Result<&'a PeakSet, BuildError> {
        Ok(self.storage.get_scan(scan)?)
    }

    /// The most intense peak matching `target_mz` in `scan`, without building a trace
    pub fn detect_point(
        &self,
        scan: &Scan,
        target_mz: f64,
        tolerance: Tolerance,
    ) -> Result<Option<ScanPoint>, BuildError> {
        let peaks = self.peaks(scan)?;
        Ok(most_intense(peaks.all_peaks_for(target_mz, tolerance))
            .map(|p| ScanPoint::from_peak(scan, p)))
    }

    pub fn detect_seed(&self, scan: &Scan, target_mz: f64, tolerance: Tolerance) -> TraceResult {
        match self.detect_point(scan, target_mz, tolerance)? {
            Some(point) => self.build_with(point, tolerance),
            None => Ok(None),
        }
    }

    /// Seed from the most intense match across the MS1 scans of `first..=last`
    pub fn detect_in_window(
        &self,
        first: ScanIndex,
        last: ScanIndex,
        target_mz: f64,
        tolerance: Tolerance,
    ) -> TraceResult {
        let mut best: Option<ScanPoint> = None;
        for scan in self.run.scans_between(first, last) {
            if scan.is_msms() {
                continue;
            }
            if let Some(point) = self.detect_point(scan, target_mz, tolerance)? {
                if best.map(|b| point.intensity > b.intensity).unwrap_or(true) {
                    best = Some(point);
                }
            }
        }
        match best {
            Some(point) => self.build_with(point, tolerance),
            None => Ok(None),
        }
    }

    /// Walk outwards from `middle` over the MS1 scans of `first..=last` and return the
    /// first trace that can be built from a match.
    pub fn detect_nearest(
        &self,
        first: ScanIndex,
        last: ScanIndex,
        middle: ScanIndex,
        target_mz: f64,
        tolerance: Tolerance,
    ) -> TraceResult {
        let scans = self.run.scans_between(first, last);
        let mut order: Vec<&Scan> = scans.iter().filter(|s| !s.is_msms()).collect();
        order.sort_by_key(|s| (s.index.abs_diff(middle), s.index));
        for scan in order {
            if let Some(trace) = self.detect_seed(scan, target_mz, tolerance)? {
                return Ok(Some(trace));
            }
        }
        Ok(None)
    }

    /// Seed the trace of a fragmentation scan's precursor in the nearest MS1 scan.
    ///
    /// With an isolation window the central fraction of the window is searched, otherwise
    /// the trace mass tolerance around the precursor m/z.
    pub fn detect_precursor(&self, ms2_scan: &Scan, precursor: &Precursor) -> TraceResult {
        let Some(ms1) = self.run.nearest_ms1(ms2_scan.index) else {
            return Ok(None);
        };
        let peaks = self.peaks(ms1)?;
        let candidates = match precursor.isolation_window {
            Some(window) => {
                let fraction = self.params.trace.isolation_window_fraction;
                let lo = precursor.mz - window.lower_offset * fraction;
                let hi = precursor.mz + window.upper_offset * fraction;
                let width = (hi - lo) / 2.0;
                let center = (hi + lo) / 2.0;
                peaks.all_peaks_for(center, Tolerance::Da(width))
            }
            None => peaks.all_peaks_for(precursor.mz, self.params.trace.tolerance()),
        };
        match most_intense(candidates) {
            Some(peak) => self.build(ScanPoint::from_peak(ms1, peak)),
            None => Ok(None),
        }
    }

    /// Build the trace seeded at `seed`, or fetch it from the cache
    pub fn build(&self, seed: ScanPoint) -> TraceResult {
        self.build_with(seed, self.params.trace.tolerance())
    }

    /// Build the trace seeded at `seed`, extending it within `tolerance`. Only traces
    /// extended with the trace tolerance are cached.
    pub fn build_with(&self, seed: ScanPoint, tolerance: Tolerance) -> TraceResult {
        if tolerance == self.params.trace.tolerance() {
            self.cache
                .get_or_build(TraceKey::from(&seed), || self.build_trace(seed, tolerance))
        } else {
            Ok(self.build_trace(seed, tolerance)?.map(Arc::new))
        }
    }

    fn next_point<'s, I: Iterator<Item = &'s Scan>>(
        &self,
        scans: I,
        previous: &ScanPoint,
        tolerance: Tolerance,
    ) -> Result<Option<ScanPoint>, BuildError> {
        for scan in scans.filter(|s| !s.is_msms()) {
            let peaks = self.peaks(scan)?;
            let candidates = peaks.all_peaks_for(previous.mz, tolerance);
            let chosen = match candidates.len() {
                0 => None,
                1 => candidates.first(),
                _ => {
                    let (lo, hi) = tolerance.bounds(previous.mz);
                    let sigma_mz = (hi - lo) / 4.0;
                    let sigma_int = self.params.trace.intensity_variance;
                    let noise = self.noise.noise_level(scan.index, previous.mz);
                    let score = |p: &CentroidPeak| {
                        let dmz = p.mz - previous.mz;
                        let dlog = ((noise + p.intensity as f64)
                            / (noise + previous.intensity as f64))
                            .ln();
                        (-(dmz * dmz / (4.0 * sigma_mz * sigma_mz)
                            + dlog * dlog / (4.0 * sigma_int)))
                            .exp()
                    };
                    candidates
                        .iter()
                        .max_by(|a, b| score(a).total_cmp(&score(b)))
                }
            };
            return Ok(chosen.map(|p| ScanPoint::from_peak(scan, p)));
        }
        Ok(None)
    }

    fn extend(&self, seed: ScanPoint, tolerance: Tolerance) -> Result<Trace, BuildError> {
        let mut trace = Trace::new(seed);
        let mut previous = seed;
        while let Some(point) = self.next_point(
            self.run.scans_after(previous.scan_index).iter(),
            &previous,
            tolerance,
        )? {
            trace.extend_right(point)?;
            previous = point;
        }
        previous = seed;
        while let Some(point) = self.next_point(
            self.run.scans_before(previous.scan_index).iter().rev(),
            &previous,
            tolerance,
        )? {
            trace.extend_left(point)?;
            previous = point;
        }
        Ok(trace)
    }

    fn build_trace(
        &self,
        seed: ScanPoint,
        tolerance: Tolerance,
    ) -> Result<Option<Trace>, BuildError> {
        let mut trace = self.extend(seed, tolerance)?;
        let params = &self.params.segmentation;
        if trace.len() < params.min_trace_length.max(3) {
            trace!("Trace of {} is too short ({} points)", trace.key(), trace.len());
            return Ok(None);
        }
        segment_trace(&mut trace, self.noise, params)?;
        if trace.segments().is_empty() {
            return Ok(None);
        }
        trace.trim_edges();
        if !trace.contains_point(&seed) || trace.len() < 3 {
            trace!("Seed of {} was trimmed away", trace.key());
            return Ok(None);
        }
        Ok(Some(trace))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::scan::{InMemorySpectrumStorage, Polarity};

    fn gaussian(x: f64, mu: f64, sigma: f64, height: f64) -> f64 {
        height * (-(x - mu).powi(2) / (2.0 * sigma * sigma)).exp()
    }

    fn make_run(n: usize, profile: impl Fn(usize) -> Vec<(f64, f32)>) -> (LCMSRun, InMemorySpectrumStorage) {
        let mut storage = InMemorySpectrumStorage::new();
        let mut scans = Vec::new();
        for i in 0..n {
            let peaks = PeakSet::new(
                profile(i)
                    .into_iter()
                    .enumerate()
                    .map(|(j, (mz, int))| CentroidPeak::new(mz, int, j as u32))
                    .collect(),
            );
            scans.push(Scan::new(i, i as i64 * 1000, Polarity::Positive).with_peaks(&peaks));
            storage.insert(i, peaks);
        }
        (LCMSRun::new("test", scans).unwrap(), storage)
    }

    #[test_log::test]
    fn test_build_single_peak() {
        let (run, storage) = make_run(30, |i| {
            vec![
                (300.0, gaussian(i as f64, 15.0, 3.0, 1e5) as f32 + 10.0),
                (300.004, 50.0),
                (450.0, 1000.0),
            ]
        });
        let params = ProcessingParams::default();
        let cache = ChromatogramCache::new();
        let noise = NoiseModel::Zero;
        let builder = ChromatogramBuilder::new(&run, &storage, &noise, &params, &cache);
        let trace = builder
            .detect_seed(&run.scans()[15], 300.0, Tolerance::PPM(20.0))
            .unwrap()
            .unwrap();
        assert_eq!(trace.segments().len(), 1);
        let seg = trace.segments()[0];
        assert_eq!(trace.scan_index_at(seg.apex), 15);
        assert!(trace.points().iter().all(|p| (p.mz - 300.0).abs() < 1e-9));
        assert_eq!(cache.builds(), 1);

        // a seed inside the built trace is served from the cache
        let again = builder
            .detect_seed(&run.scans()[14], 300.0, Tolerance::PPM(20.0))
            .unwrap()
            .unwrap();
        assert!(Arc::ptr_eq(&trace, &again));
        assert_eq!(cache.builds(), 1);
    }

    #[test]
    fn test_trimmed_trace_keeps_seed() {
        // a peak early in the run, then a long flat tail
        let (run, storage) = make_run(40, |i| {
            vec![(300.0, gaussian(i as f64, 8.0, 2.0, 1e5) as f32 + 20.0)]
        });
        let params = ProcessingParams::default();
        let cache = ChromatogramCache::new();
        let noise = NoiseModel::Zero;
        let builder = ChromatogramBuilder::new(&run, &storage, &noise, &params, &cache);
        let mut found = 0;
        for scan in run.scans() {
            let peaks = storage.get_scan(scan).unwrap();
            let seed = ScanPoint::from_peak(scan, &peaks[0]);
            if let Some(trace) = builder.build(seed).unwrap() {
                assert!(trace.contains_point(&seed), "{seed:?} not in {}", trace.key());
                found += 1;
            }
        }
        assert!(found > 0);
        let apex_scan = &run.scans()[8];
        let apex = ScanPoint::from_peak(apex_scan, &storage.get_scan(apex_scan).unwrap()[0]);
        assert!(builder.build(apex).unwrap().is_some());
    }

    #[test]
    fn test_extension_follows_requested_tolerance() {
        // the analyte drifts by 4 ppm per scan, further than a 2 ppm search reaches
        let (run, storage) = make_run(30, |i| {
            let mz = 300.0 * (1.0 + 4e-6 * (i as f64 - 15.0));
            vec![(mz, gaussian(i as f64, 15.0, 3.0, 1e5) as f32 + 10.0)]
        });
        let params = ProcessingParams::default();
        let cache = ChromatogramCache::new();
        let noise = NoiseModel::Zero;
        let builder = ChromatogramBuilder::new(&run, &storage, &noise, &params, &cache);

        let narrow = builder
            .detect_seed(&run.scans()[15], 300.0, Tolerance::PPM(2.0))
            .unwrap();
        assert!(narrow.is_none());
        assert_eq!(cache.builds(), 0);

        let wide = builder
            .detect_seed(&run.scans()[15], 300.0, Tolerance::PPM(20.0))
            .unwrap()
            .unwrap();
        assert!(wide.len() > 10);
        assert_eq!(cache.builds(), 1);
    }

    #[test]
    fn test_no_match_is_none() {
        let (run, storage) = make_run(10, |_| vec![(300.0, 100.0)]);
        let params = ProcessingParams::default();
        let cache = ChromatogramCache::new();
        let noise = NoiseModel::Zero;
        let builder = ChromatogramBuilder::new(&run, &storage, &noise, &params, &cache);
        assert!(builder
            .detect_in_window(0, 9, 500.0, Tolerance::PPM(10.0))
            .unwrap()
            .is_none());
        assert!(builder
            .detect_nearest(0, 9, 5, 500.0, Tolerance::PPM(10.0))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_missing_spectrum_is_error() {
        let (run, _) = make_run(5, |_| vec![(300.0, 100.0)]);
        let storage = InMemorySpectrumStorage::new();
        let params = ProcessingParams::default();
        let cache = ChromatogramCache::new();
        let noise = NoiseModel::Zero;
        let builder = ChromatogramBuilder::new(&run, &storage, &noise, &params, &cache);
        assert!(builder
            .detect_seed(&run.scans()[0], 300.0, Tolerance::PPM(10.0))
            .is_err());
    }

    #[test]
    fn test_concurrent_builds_once() {
        use rayon::prelude::*;
        let (run, storage) = make_run(30, |i| {
            vec![(300.0, gaussian(i as f64, 15.0, 3.0, 1e5) as f32 + 10.0)]
        });
        let params = ProcessingParams::default();
        let cache = ChromatogramCache::new();
        let noise = NoiseModel::Zero;
        let builder = ChromatogramBuilder::new(&run, &storage, &noise, &params, &cache);
        let seed = ScanPoint::new(15, 15000, 300.0, gaussian(15.0, 15.0, 3.0, 1e5) as f32 + 10.0);
        let traces: Vec<_> = (0..16)
            .into_par_iter()
            .map(|_| builder.build(seed).unwrap().unwrap())
            .collect();
        assert!(traces.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        assert_eq!(cache.builds(), 1);
    }
}
