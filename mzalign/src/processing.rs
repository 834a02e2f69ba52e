//! The multi-sample pipeline: sample intake, feature detection and the alignment rounds.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::align::{
    apply_gap_fills, cluster_samples, coarse_error, fit_recalibrations, prefilter,
    propose_gap_fills, AlignedFeatures, Cluster, GapFill, GapFillMode,
};
use crate::consensus::ConsensusFeature;
use crate::error::ProcessingError;
use crate::ion_network::assign_ion_types;
use crate::ion_type::parse_ion_types;
use crate::params::ProcessingParams;
use crate::sample::ProcessedSample;
use crate::scan::{LCMSRun, SpectrumStorage};

/// A shared flag to stop processing between units of work
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<(), ProcessingError> {
        if self.is_cancelled() {
            Err(ProcessingError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// The retention time error measured after one alignment step
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AlignmentStep {
    pub name: String,
    /// In milliseconds
    pub error: f64,
    pub rows: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AlignmentReport {
    pub steps: Vec<AlignmentStep>,
}

impl AlignmentReport {
    fn record(&mut self, name: &str, error: f64, rows: usize) {
        info!("Alignment step {name}: error {error:.1} ms over {rows} rows");
        self.steps.push(AlignmentStep {
            name: name.to_string(),
            error,
            rows,
        });
    }

    pub fn get(&self, name: &str) -> Option<&AlignmentStep> {
        self.steps.iter().find(|s| s.name == name)
    }

    pub fn final_error(&self) -> Option<f64> {
        self.steps.last().map(|s| s.error)
    }
}

/// Processes a collection of runs into aligned consensus features.
///
/// ```no_run
/// # use mzalign::{LCMSProcessing, LCMSRun, InMemorySpectrumStorage, ProcessingParams};
/// # fn load() -> Vec<(LCMSRun, InMemorySpectrumStorage)> { Vec::new() }
/// let mut processing = LCMSProcessing::new(ProcessingParams::default())?;
/// for (run, storage) in load() {
///     processing.add_sample(run, Box::new(storage))?;
/// }
/// let features = processing.process()?;
/// # Ok::<(), mzalign::ProcessingError>(())
/// ```
pub struct LCMSProcessing {
    params: ProcessingParams,
    samples: Vec<ProcessedSample>,
    pool: rayon::ThreadPool,
    token: CancellationToken,
    report: AlignmentReport,
    rows: Vec<AlignedFeatures>,
}

impl LCMSProcessing {
    pub fn new(params: ProcessingParams) -> Result<Self, ProcessingError> {
        parse_ion_types(&params.correlation.detectable_ion_types)?;
        let threads = if params.threads > 0 {
            params.threads
        } else {
            thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        };
        debug!("Using {threads} worker threads");
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build()?;
        Ok(Self {
            params,
            samples: Vec::new(),
            pool,
            token: CancellationToken::new(),
            report: AlignmentReport::default(),
            rows: Vec::new(),
        })
    }

    pub fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
        self.token = token;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn params(&self) -> &ProcessingParams {
        &self.params
    }

    pub fn samples(&self) -> &[ProcessedSample] {
        &self.samples
    }

    pub fn report(&self) -> &AlignmentReport {
        &self.report
    }

    /// The rows of the last alignment
    pub fn rows(&self) -> &[AlignedFeatures] {
        &self.rows
    }

    /// Validate `run` and register it as the next sample, returning its index
    pub fn add_sample(
        &mut self,
        run: LCMSRun,
        storage: Box<dyn SpectrumStorage>,
    ) -> Result<usize, ProcessingError> {
        self.token.check()?;
        let index = self.samples.len();
        let params = &self.params;
        let sample = self
            .pool
            .install(|| ProcessedSample::new(index, run, storage, params))?;
        info!("Added sample {index} from {}", sample.identifier());
        self.samples.push(sample);
        Ok(index)
    }

    pub fn detect_features(&mut self, index: usize) -> Result<usize, ProcessingError> {
        let Some(sample) = self.samples.get_mut(index) else {
            return Err(ProcessingError::InvalidInputData(format!(
                "No sample with index {index}"
            )));
        };
        let (params, token) = (&self.params, &self.token);
        self.pool.install(|| sample.detect_features(params, token))
    }

    /// Detect features in every sample, returning the total number of ions
    pub fn detect_all_features(&mut self) -> Result<usize, ProcessingError> {
        let (params, token) = (&self.params, &self.token);
        let samples = &mut self.samples;
        let counts: Vec<usize> = self.pool.install(|| {
            samples
                .par_iter_mut()
                .map(|sample| sample.detect_features(params, token))
                .collect::<Result<_, ProcessingError>>()
        })?;
        Ok(counts.into_iter().sum())
    }

    /// Run the alignment rounds over the detected features of all samples.
    ///
    /// Retention times are normalized against the latest retention time of any sample. When
    /// alignment fails or is cancelled the samples are restored to their prior state.
    pub fn align(&mut self) -> Result<&[AlignedFeatures], ProcessingError> {
        if self.samples.is_empty() {
            return Err(ProcessingError::InvalidInputData(
                "No samples to align".to_string(),
            ));
        }
        let (params, token) = (&self.params, &self.token);
        let samples = &mut self.samples;
        let states: Vec<_> = samples.iter().map(|s| s.alignment_state()).collect();
        let max_retention_time = samples
            .iter()
            .map(|s| s.run().max_retention_time())
            .max()
            .unwrap_or_default();
        for sample in samples.iter_mut() {
            sample.max_retention_time = max_retention_time;
        }
        let report = &mut self.report;
        *report = AlignmentReport::default();
        match self
            .pool
            .install(|| align_samples(samples, params, token, report))
        {
            Ok(rows) => {
                self.rows = rows;
                Ok(&self.rows)
            }
            Err(e) => {
                warn!("Alignment stopped, restoring samples: {e}");
                for (sample, state) in samples.iter_mut().zip(states) {
                    sample.restore_alignment_state(state);
                }
                Err(e)
            }
        }
    }

    pub fn consensus_features(&self) -> Vec<ConsensusFeature> {
        let samples = &self.samples;
        self.pool.install(|| {
            self.rows
                .par_iter()
                .enumerate()
                .map(|(i, row)| ConsensusFeature::from_row(i, row, samples))
                .collect()
        })
    }

    /// Detect features, align and build the consensus table
    pub fn process(&mut self) -> Result<Vec<ConsensusFeature>, ProcessingError> {
        let ions = self.detect_all_features()?;
        info!("Detected {ions} ions in {} samples", self.samples.len());
        self.align()?;
        let features = self.consensus_features();
        info!("Aligned {} consensus features", features.len());
        Ok(features)
    }
}

fn clustering_window(error: f64, params: &ProcessingParams) -> f64 {
    (error * params.alignment.rt_window_factor).max(params.alignment.min_rt_error)
}

/// Record the error of `cluster`, returning the error to continue with
fn measure(
    report: &mut AlignmentReport,
    name: &str,
    cluster: &Cluster,
    previous: f64,
    params: &ProcessingParams,
) -> f64 {
    let measured = cluster.estimate_error().unwrap_or(previous);
    report.record(name, measured, cluster.len());
    measured.max(params.alignment.min_rt_error)
}

fn add_pseudo_ions(samples: &mut [ProcessedSample], params: &ProcessingParams) {
    let added: usize = samples
        .par_iter_mut()
        .map(|sample| sample.add_pseudo_ions(params))
        .sum();
    debug!("Added {added} pseudo-ions");
}

fn gap_fill(
    samples: &mut [ProcessedSample],
    cluster: &mut Cluster,
    error: f64,
    mode: GapFillMode,
    params: &ProcessingParams,
    token: &CancellationToken,
) -> Result<usize, ProcessingError> {
    let proposals: Vec<Vec<GapFill>> = {
        let cluster: &Cluster = cluster;
        samples
            .par_iter()
            .map(|sample| propose_gap_fills(sample, cluster, error, mode, params, token))
            .collect::<Result<_, ProcessingError>>()?
    };
    token.check()?;
    let added = apply_gap_fills(samples, cluster, proposals.into_iter().flatten().collect())?;
    info!("{mode:?} gap filling added {added} ions");
    Ok(added)
}

fn align_samples(
    samples: &mut [ProcessedSample],
    params: &ProcessingParams,
    token: &CancellationToken,
    report: &mut AlignmentReport,
) -> Result<Vec<AlignedFeatures>, ProcessingError> {
    token.check()?;
    let coarse = coarse_error(samples, params);
    report.record("coarse", coarse, 0);
    let removed = prefilter(samples, coarse, params);
    debug!("Prefilter removed {removed} ions");
    add_pseudo_ions(samples, params);
    token.check()?;

    let mut cluster = cluster_samples(
        samples,
        coarse * params.alignment.first_round_error_factor,
        params,
    )?;
    let mut error = measure(report, "round1", &cluster, coarse, params);
    gap_fill(samples, &mut cluster, error, GapFillMode::Strict, params, token)?;
    token.check()?;

    let mut cluster = cluster_samples(samples, clustering_window(error, params), params)?;
    error = measure(report, "round2", &cluster, error, params);
    let recalibrations = fit_recalibrations(samples, &cluster);
    for (sample, recalibration) in samples.iter_mut().zip(recalibrations) {
        sample.recalibration = recalibration;
    }
    let times: Vec<&ProcessedSample> = samples.iter().collect();
    for row in cluster.rows_mut() {
        row.set_retention_times(|s, ion| {
            times
                .iter()
                .find(|sample| sample.index == s)
                .map(|sample| sample.recalibrated_time(ion.apex_retention_time()))
                .unwrap_or(ion.apex_retention_time() as f64)
        });
    }
    error = measure(report, "recalibration", &cluster, error, params);
    token.check()?;

    add_pseudo_ions(samples, params);
    let mut cluster = cluster_samples(samples, clustering_window(error, params), params)?;
    error = measure(report, "round3", &cluster, error, params);
    let dropped = cluster.retain(|row| row.has_msms());
    debug!("Dropped {dropped} rows without fragmentation spectra");
    gap_fill(samples, &mut cluster, error, GapFillMode::Permissive, params, token)?;
    token.check()?;

    let mut cluster = cluster_samples(samples, clustering_window(error, params), params)?;
    let dropped = cluster.retain(|row| row.has_msms() && row.has_isotopes());
    debug!("Dropped {dropped} rows without fragmentation spectra or isotopes");
    if samples.len() >= params.alignment.large_cohort_size {
        let min_entries = params.alignment.min_entries_in_large_cohort;
        let dropped = cluster.retain(|row| row.len() >= min_entries);
        debug!("Dropped {dropped} rows present in fewer than {min_entries} samples");
    }
    measure(report, "final", &cluster, error, params);
    cluster.validate()?;

    let assigned = assign_ion_types(cluster.rows_mut(), &params.network);
    debug!("Assigned ion types to {assigned} rows");
    Ok(cluster.into_rows())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::scan::{InMemorySpectrumStorage, Polarity, Precursor, Scan};
    use mzpeaks::{CentroidPeak, PeakSet};

    fn small_run(name: &str, step: i64) -> (LCMSRun, InMemorySpectrumStorage) {
        let mut storage = InMemorySpectrumStorage::new();
        let mut scans = Vec::new();
        for i in 0..8 {
            let scan = if i == 4 {
                let peaks = PeakSet::new(vec![CentroidPeak::new(120.0, 50.0, 0)]);
                let scan = Scan::new(i, i as i64 * step, Polarity::Positive)
                    .with_precursor(Precursor::new(300.0, 100.0, 1), 20.0)
                    .with_peaks(&peaks);
                storage.insert(i, peaks);
                scan
            } else {
                let peaks = PeakSet::new(vec![CentroidPeak::new(300.0, 1000.0, 0)]);
                let scan = Scan::new(i, i as i64 * step, Polarity::Positive).with_peaks(&peaks);
                storage.insert(i, peaks);
                scan
            };
            scans.push(scan);
        }
        (LCMSRun::new(name, scans).unwrap(), storage)
    }

    #[test]
    fn test_cancellation() {
        let token = CancellationToken::new();
        let shared = token.clone();
        assert!(token.check().is_ok());
        shared.cancel();
        assert!(matches!(token.check(), Err(ProcessingError::Cancelled)));
    }

    #[test]
    fn test_invalid_ion_types_rejected() {
        let mut params = ProcessingParams::default();
        params.correlation.detectable_ion_types.push("[M+Xx]+".to_string());
        assert!(matches!(
            LCMSProcessing::new(params),
            Err(ProcessingError::IonType(_))
        ));
    }

    #[test]
    fn test_align_without_samples() {
        let mut processing = LCMSProcessing::new(ProcessingParams {
            threads: 1,
            ..Default::default()
        })
        .unwrap();
        assert!(processing.align().is_err());
    }

    #[test]
    fn test_cancelled_alignment_restores_samples() {
        let mut processing = LCMSProcessing::new(ProcessingParams {
            threads: 1,
            ..Default::default()
        })
        .unwrap();
        for (name, step) in [("a", 1000), ("b", 2000)] {
            let (run, storage) = small_run(name, step);
            processing.add_sample(run, Box::new(storage)).unwrap();
        }
        let token = processing.cancellation_token();
        token.cancel();
        assert!(matches!(processing.align(), Err(ProcessingError::Cancelled)));
        assert!(processing.rows().is_empty());
        assert_eq!(processing.samples()[0].max_retention_time, 7000);
        assert_eq!(processing.samples()[1].max_retention_time, 14000);
        for sample in processing.samples() {
            assert!(sample.recalibration.is_identity());
            assert!(sample.ions.is_empty());
            assert!(sample.gap_filled_ions.is_empty());
        }
    }
}
