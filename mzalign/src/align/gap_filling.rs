use std::sync::Arc;

use tracing::{debug, trace};

use super::cluster::Cluster;
use crate::correlation::CorrelationDetector;
use crate::error::{AlignmentError, ProcessingError};
use crate::ion::{FragmentedIon, Quality};
use crate::params::{GapFillingParams, ProcessingParams};
use crate::peak_shape::{fit_peak_shape, PeakShapeFit};
use crate::processing::CancellationToken;
use crate::sample::ProcessedSample;
use crate::scan::ScanIndex;
use crate::trace::{Segment, Trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GapFillMode {
    /// Require a peak shape comparable to the row's members
    Strict,
    /// Accept any usable peak shape and join a fragmented elution into one segment
    Permissive,
}

/// An ion recovered for a row that lacks the sample
#[derive(Debug, Clone)]
pub struct GapFill {
    pub sample: usize,
    pub row: usize,
    pub ion: FragmentedIon,
    /// The recalibrated apex time
    pub retention_time: f64,
}

/// The segment of `found` to recover, among those with an apex between `lo` and `hi`.
///
/// The permissive mode joins several such segments into one, otherwise the segment whose
/// apex is nearest `center` is taken.
fn select_segment(
    found: &Arc<Trace>,
    (lo, hi): (f64, f64),
    center: f64,
    (first, last): (ScanIndex, ScanIndex),
    mode: GapFillMode,
) -> Option<(Arc<Trace>, Segment)> {
    let apex_time = |s: &Segment| found.retention_time_at(s.apex) as f64;
    let in_window: Vec<Segment> = found
        .segments()
        .iter()
        .filter(|s| {
            let t = apex_time(*s);
            lo <= t && t <= hi
        })
        .copied()
        .collect();
    if in_window.len() > 1 && mode == GapFillMode::Permissive {
        let mut joined = (**found).clone();
        let segment = joined.join_all_segments_within(first, last)?;
        return Some((Arc::new(joined), segment));
    }
    in_window
        .iter()
        .min_by(|a, b| {
            (apex_time(*a) - center)
                .abs()
                .total_cmp(&(apex_time(*b) - center).abs())
        })
        .map(|segment| (found.clone(), *segment))
}

/// Whether a recovered elution with `shape` is good enough for a row whose members have
/// a median shape score of `typical`
fn accepts(
    mode: GapFillMode,
    shape: &PeakShapeFit,
    typical: Option<f64>,
    params: &GapFillingParams,
) -> bool {
    match mode {
        GapFillMode::Strict => {
            shape.quality.at_least(params.strict_min_quality)
                && typical
                    .map(|typical| shape.score >= typical * params.strict_shape_fraction)
                    .unwrap_or(true)
        }
        GapFillMode::Permissive => shape.quality.at_least(params.permissive_min_quality),
    }
}

/// Search `sample` for the rows of `cluster` it is missing from, within
/// `gap_filling.rt_window_factor` times `error` of each row's time.
pub fn propose_gap_fills(
    sample: &ProcessedSample,
    cluster: &Cluster,
    error: f64,
    mode: GapFillMode,
    params: &ProcessingParams,
    token: &CancellationToken,
) -> Result<Vec<GapFill>, ProcessingError> {
    let builder = sample.builder(params);
    let detector = CorrelationDetector::new(&builder, &sample.ms1_noise, &params.correlation)?;
    let inverse = sample.recalibration.invert();
    let window = (error * params.gap_filling.rt_window_factor).max(params.alignment.min_rt_error);
    let mut proposals = Vec::new();
    for (r, row) in cluster.rows().iter().enumerate() {
        if row.contains_sample(sample.index) || !row.has_msms() {
            continue;
        }
        token.check()?;
        let center = inverse.apply(row.retention_time());
        let (lo, hi) = (center - window, center + window);
        let scans = sample
            .run()
            .scans_between_times(lo.floor() as i64, hi.ceil() as i64);
        let (Some(first), Some(last)) = (scans.first(), scans.last()) else {
            continue;
        };
        let Some(middle) = scans
            .iter()
            .filter(|s| !s.is_msms())
            .min_by(|a, b| {
                (a.retention_time as f64 - center)
                    .abs()
                    .total_cmp(&(b.retention_time as f64 - center).abs())
            })
        else {
            continue;
        };
        let Some(found) = builder.detect_nearest(
            first.index,
            last.index,
            middle.index,
            row.mz(),
            params.alignment.tolerance(),
        )?
        else {
            continue;
        };

        let Some((trace, segment)) =
            select_segment(&found, (lo, hi), center, (first.index, last.index), mode)
        else {
            continue;
        };
        if sample.is_segment_used(trace.key(), &segment) {
            continue;
        }

        let shape = fit_peak_shape(&trace, &segment, &params.peak_shape);
        let accepted = accepts(mode, &shape, row.typical_shape_score(), &params.gap_filling);
        if !accepted {
            trace!(
                "Rejected a {:?} gap fill for row {r} in sample {}",
                shape.quality,
                sample.index
            );
            continue;
        }

        let mut ion = FragmentedIon::gap_filled(trace, segment, row.polarity());
        ion.charge = row.charge();
        ion.peak_shape = Some(shape);
        ion.isotopes = detector.detect_isotopes(&ion.trace, &ion.segment, ion.mz(), ion.charge)?;
        ion.ms1_quality = match ion.isotopes.len() {
            0 => Quality::Bad,
            1 => Quality::Decent,
            _ => Quality::Good,
        };
        let retention_time = sample.recalibrated_time(ion.apex_retention_time());
        proposals.push(GapFill {
            sample: sample.index,
            row: r,
            ion,
            retention_time,
        });
    }
    debug!(
        "Sample {}: {} {mode:?} gap fill proposals",
        sample.index,
        proposals.len()
    );
    Ok(proposals)
}

/// Apply proposals in sample then row order. A proposal is skipped when an earlier one
/// already claimed its segment or the row already has the sample.
///
/// Returns the number of ions added.
pub fn apply_gap_fills(
    samples: &mut [ProcessedSample],
    cluster: &mut Cluster,
    mut proposals: Vec<GapFill>,
) -> Result<usize, AlignmentError> {
    proposals.sort_by_key(|p| (p.sample, p.row));
    let mut added = 0;
    for proposal in proposals {
        let Some(sample) = samples.iter_mut().find(|s| s.index == proposal.sample) else {
            continue;
        };
        let row = cluster
            .rows()
            .get(proposal.row)
            .ok_or(AlignmentError::UnknownRow { row: proposal.row })?;
        if row.contains_sample(proposal.sample)
            || sample.is_segment_used(proposal.ion.trace.key(), &proposal.ion.segment)
        {
            continue;
        }
        let ion = Arc::new(proposal.ion);
        cluster.add_member(proposal.row, proposal.sample, ion.clone(), proposal.retention_time)?;
        sample.gap_filled_ions.push(ion);
        added += 1;
    }
    Ok(added)
}
