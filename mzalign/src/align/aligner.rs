use std::cmp::Reverse;
use std::collections::HashSet;
use std::sync::Arc;

use mzpeaks::Tolerance;
use rayon::prelude::*;
use tracing::{debug, trace};

use super::cluster::{AlignedFeatures, Cluster};
use super::recalibration::{Anchor, Recalibration};
use crate::error::AlignmentError;
use crate::ion::{FragmentedIon, IonKey, Quality};
use crate::params::ProcessingParams;
use crate::sample::ProcessedSample;
use crate::stats::median;

/// The minimum fragment spectrum similarity for two ions to count as a coarse match
const MIN_COARSE_COSINE: f64 = 0.5;

/// The ions of one sample ordered by m/z, with their recalibrated apex times
struct IonIndex {
    entries: Vec<(f64, f64, Arc<FragmentedIon>)>,
}

impl IonIndex {
    fn new(sample: &ProcessedSample) -> Self {
        let mut entries: Vec<_> = sample
            .all_ions()
            .map(|ion| {
                (
                    ion.mz(),
                    sample.recalibrated_time(ion.apex_retention_time()),
                    ion.clone(),
                )
            })
            .collect();
        entries.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.total_cmp(&b.1)));
        Self { entries }
    }

    fn around(
        &self,
        mz: f64,
        tolerance: Tolerance,
    ) -> impl Iterator<Item = (usize, &(f64, f64, Arc<FragmentedIon>))> + '_ {
        let (lo, hi) = tolerance.bounds(mz);
        let start = self.entries.partition_point(|e| e.0 < lo);
        self.entries[start..]
            .iter()
            .enumerate()
            .take_while(move |(_, e)| e.0 <= hi)
            .map(move |(i, e)| (start + i, e))
    }

    /// The entry closest in time to (`mz`, `rt`) within `max_shift`
    fn nearest(
        &self,
        ion: &FragmentedIon,
        mz: f64,
        rt: f64,
        max_shift: f64,
        params: &ProcessingParams,
    ) -> Option<usize> {
        self.around(mz, params.alignment.tolerance())
            .filter(|(_, e)| (e.1 - rt).abs() <= max_shift)
            .filter(|(_, e)| match (&ion.msms, &e.2.msms) {
                (Some(a), Some(b)) => a.cosine(b, params.ms2.tolerance()) >= MIN_COARSE_COSINE,
                _ => true,
            })
            .min_by(|a, b| {
                (a.1 .1 - rt)
                    .abs()
                    .total_cmp(&(b.1 .1 - rt).abs())
                    .then(a.0.cmp(&b.0))
            })
            .map(|(i, _)| i)
    }
}

fn mutual_nearest_shifts(left: &IonIndex, right: &IonIndex, params: &ProcessingParams) -> Vec<f64> {
    let max_shift = params.alignment.max_rt_shift;
    left.entries
        .iter()
        .enumerate()
        .filter_map(|(i, (mz, rt, ion))| {
            let j = right.nearest(ion, *mz, *rt, max_shift, params)?;
            let (rmz, rrt, rion) = &right.entries[j];
            let back = left.nearest(rion, *rmz, *rrt, max_shift, params);
            (back == Some(i)).then(|| (rrt - rt).abs())
        })
        .collect()
}

/// Estimate the retention time error between samples as the median time difference of
/// ions that are each other's nearest match, never below the configured minimum.
pub fn coarse_error(samples: &[ProcessedSample], params: &ProcessingParams) -> f64 {
    let indices: Vec<IonIndex> = samples.par_iter().map(IonIndex::new).collect();
    let pairs: Vec<(usize, usize)> = (0..indices.len())
        .flat_map(|i| ((i + 1)..indices.len()).map(move |j| (i, j)))
        .collect();
    let mut shifts: Vec<f64> = pairs
        .par_iter()
        .flat_map_iter(|(i, j)| mutual_nearest_shifts(&indices[*i], &indices[*j], params))
        .collect();
    debug!("Coarse error from {} mutual matches", shifts.len());
    median(&mut shifts)
        .unwrap_or(params.alignment.min_rt_error)
        .max(params.alignment.min_rt_error)
}

/// Drop ions with weak fragmentation evidence that have fewer than the required number of
/// matches in other samples within `prefilter_error_factor` times `error`.
///
/// Returns the number of ions removed.
pub fn prefilter(samples: &mut [ProcessedSample], error: f64, params: &ProcessingParams) -> usize {
    if samples.len() < 2 {
        return 0;
    }
    let window = error * params.alignment.prefilter_error_factor;
    let tolerance = params.alignment.tolerance();
    let indices: Vec<IonIndex> = samples.par_iter().map(IonIndex::new).collect();
    let rejected: Vec<HashSet<IonKey>> = samples
        .par_iter()
        .enumerate()
        .map(|(s, sample)| {
            sample
                .ions
                .iter()
                .filter(|ion| !ion.ms2_quality.better_than(Quality::Bad))
                .filter(|ion| {
                    let mz = ion.mz();
                    let rt = sample.recalibrated_time(ion.apex_retention_time());
                    let matches = indices
                        .iter()
                        .enumerate()
                        .filter(|(o, _)| *o != s)
                        .filter(|(_, index)| {
                            index
                                .around(mz, tolerance)
                                .any(|(_, e)| (e.1 - rt).abs() <= window)
                        })
                        .count();
                    matches < params.alignment.prefilter_min_matches
                })
                .map(|ion| ion.key())
                .collect()
        })
        .collect();
    samples
        .iter_mut()
        .zip(rejected)
        .map(|(sample, rejected)| sample.retain_ions(|ion| !rejected.contains(&ion.key())))
        .sum()
}

fn gaussian_similarity(delta: f64, width: f64) -> f64 {
    if width <= 0.0 {
        return if delta == 0.0 { 1.0 } else { 0.0 };
    }
    (-0.5 * (delta / width).powi(2)).exp()
}

fn match_score(
    row: &AlignedFeatures,
    ion: &FragmentedIon,
    mz: f64,
    rt: f64,
    rt_tolerance: f64,
    params: &ProcessingParams,
) -> f64 {
    let (lo, hi) = params.alignment.tolerance().bounds(mz);
    let mut score = gaussian_similarity(row.mz() - mz, (hi - lo) / 2.0)
        * gaussian_similarity(row.retention_time() - rt, rt_tolerance);
    let reference = row
        .representative()
        .and_then(|(_, m)| m.ion.msms.as_ref());
    if let (Some(a), Some(b)) = (&ion.msms, reference) {
        let w = params.alignment.cosine_weight;
        score *= (1.0 - w) + w * a.cosine(b, params.ms2.tolerance());
    }
    score
}

/// Combine rows that are within tolerance of each other and have no sample in common
fn merge_rows(rows: &mut Vec<AlignedFeatures>, rt_tolerance: f64, tolerance: Tolerance) -> usize {
    rows.sort_by(|a, b| {
        a.mz()
            .total_cmp(&b.mz())
            .then(a.retention_time().total_cmp(&b.retention_time()))
    });
    let mut merged = 0;
    for i in 0..rows.len() {
        if rows[i].is_empty() {
            continue;
        }
        // absorbing shifts the row's consensus, so compare against where it started
        let anchor_rt = rows[i].retention_time();
        let (_, hi) = tolerance.bounds(rows[i].mz());
        let mut j = i + 1;
        while j < rows.len() && rows[j].mz() <= hi {
            if !rows[j].is_empty()
                && (rows[j].retention_time() - anchor_rt).abs() <= rt_tolerance
                && !rows[i].shares_sample_with(&rows[j])
            {
                let other = std::mem::take(&mut rows[j]);
                rows[i].absorb(other);
                merged += 1;
            }
            j += 1;
        }
    }
    rows.retain(|row| !row.is_empty());
    merged
}

/// Cluster the ions of all samples into rows.
///
/// Samples are visited from the one with the most ions down. Every candidate pairing of an
/// existing row with an ion of the current sample within the mass tolerance and
/// `rt_tolerance` is scored, and pairs are accepted greedily by descending score, ties
/// broken by row then ion order, each row and ion used at most once. Ions left over start
/// new rows. Finally rows that are close and share no sample are merged.
pub fn cluster_samples(
    samples: &[ProcessedSample],
    rt_tolerance: f64,
    params: &ProcessingParams,
) -> Result<Cluster, AlignmentError> {
    let tolerance = params.alignment.tolerance();
    let mut order: Vec<&ProcessedSample> = samples.iter().collect();
    order.sort_by_key(|s| (Reverse(s.all_ions().count()), s.index));

    let mut rows: Vec<AlignedFeatures> = Vec::new();
    for sample in order {
        let ions: Vec<(f64, f64, &Arc<FragmentedIon>)> = sample
            .all_ions()
            .map(|ion| {
                (
                    ion.mz(),
                    sample.recalibrated_time(ion.apex_retention_time()),
                    ion,
                )
            })
            .collect();
        let mut by_mz: Vec<usize> = (0..rows.len()).collect();
        by_mz.sort_by(|a, b| rows[*a].mz().total_cmp(&rows[*b].mz()).then(a.cmp(b)));

        let mut candidates: Vec<(f64, usize, usize)> = ions
            .par_iter()
            .enumerate()
            .flat_map_iter(|(k, (mz, rt, ion))| {
                let (lo, hi) = tolerance.bounds(*mz);
                let start = by_mz.partition_point(|r| rows[*r].mz() < lo);
                by_mz[start..]
                    .iter()
                    .take_while(|r| rows[**r].mz() <= hi)
                    .filter(|r| {
                        let row = &rows[**r];
                        !row.contains_sample(sample.index)
                            && (row.retention_time() - rt).abs() <= rt_tolerance
                    })
                    .map(|r| {
                        let score = match_score(&rows[*r], ion, *mz, *rt, rt_tolerance, params);
                        (score, *r, k)
                    })
                    .collect::<Vec<_>>()
            })
            .collect();
        candidates.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.1.cmp(&b.1)).then(a.2.cmp(&b.2)));

        let mut row_taken = vec![false; rows.len()];
        let mut ion_taken = vec![false; ions.len()];
        let mut matched = 0usize;
        for (_, r, k) in candidates {
            if row_taken[r] || ion_taken[k] {
                continue;
            }
            let (_, rt, ion) = ions[k];
            rows[r].insert(sample.index, ion.clone(), rt);
            row_taken[r] = true;
            ion_taken[k] = true;
            matched += 1;
        }
        for (k, (_, rt, ion)) in ions.iter().enumerate() {
            if !ion_taken[k] {
                rows.push(AlignedFeatures::new(sample.index, (*ion).clone(), *rt));
            }
        }
        trace!(
            "Sample {}: {matched} of {} ions joined existing rows",
            sample.index,
            ions.len()
        );
    }
    let merged = merge_rows(&mut rows, rt_tolerance, tolerance);
    debug!(
        "Clustered into {} rows with a tolerance of {rt_tolerance:.0} ms, {merged} merged",
        rows.len()
    );
    let cluster = Cluster::new(rows, rt_tolerance);
    cluster.validate()?;
    Ok(cluster)
}

/// Fit each sample's monotone recalibration onto the row times of `cluster`, anchored on
/// rows with fragmentation evidence and members in more than one sample.
pub fn fit_recalibrations(samples: &[ProcessedSample], cluster: &Cluster) -> Vec<Recalibration> {
    samples
        .par_iter()
        .map(|sample| {
            let anchors: Vec<Anchor> = cluster
                .rows()
                .iter()
                .filter(|row| row.len() > 1 && row.has_msms())
                .filter_map(|row| {
                    row.get(sample.index).map(|m| {
                        Anchor::new(
                            m.ion.apex_retention_time() as f64,
                            row.retention_time(),
                            (row.len() - 1) as f64,
                        )
                    })
                })
                .collect();
            Recalibration::fit(&anchors)
        })
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::align::cluster::test::make_ion;

    #[test]
    fn test_merge_rows_against_original_anchor() {
        let mut rows = vec![
            AlignedFeatures::new(0, make_ion(300.0, 10_000), 10_000.0),
            AlignedFeatures::new(1, make_ion(300.0001, 10_800), 10_800.0),
            AlignedFeatures::new(2, make_ion(300.0002, 9_300), 9_300.0),
        ];
        let merged = merge_rows(&mut rows, 1000.0, Tolerance::PPM(10.0));
        assert_eq!(merged, 2);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].len(), 3);
    }

    #[test]
    fn test_merge_rows_keeps_shared_samples_apart() {
        let mut rows = vec![
            AlignedFeatures::new(0, make_ion(300.0, 10_000), 10_000.0),
            AlignedFeatures::new(0, make_ion(300.0001, 10_200), 10_200.0),
            AlignedFeatures::new(1, make_ion(300.0, 30_000), 30_000.0),
        ];
        assert_eq!(merge_rows(&mut rows, 1000.0, Tolerance::PPM(10.0)), 0);
        assert_eq!(rows.len(), 3);
    }
}
