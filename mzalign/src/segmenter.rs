//! Assigning fragmentation scans to the elution segments of their precursors.
use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, trace};

use crate::builder::ChromatogramBuilder;
use crate::error::BuildError;
use crate::params::Ms2Params;
use crate::scan::{Scan, ScanIndex, SpectrumStorage};
use crate::trace::{Segment, Trace, TraceKey};

/// The fragmentation scans that belong to one segment of one trace
#[derive(Debug, Clone)]
pub struct SegmentScans {
    pub trace: Arc<Trace>,
    pub segment: Segment,
    pub scans: Vec<ScanIndex>,
}

/// The segment of `trace` a fragmentation scan belongs to: the one whose scan span covers
/// it, otherwise the one with the closest apex if that is within `max_apex_distance`
pub fn segment_for_msms(trace: &Trace, scan: &Scan, max_apex_distance: i64) -> Option<Segment> {
    trace.segment_for_scan(scan.index).or_else(|| {
        trace
            .nearest_segment(scan.retention_time)
            .filter(|s| (trace.retention_time_at(s.apex) - scan.retention_time).abs() <= max_apex_distance)
    })
}

/// Match every fragmentation scan of the builder's run to a precursor trace and group the
/// scans by the segment they fall into. Scans whose precursor has no trace are dropped.
///
/// Groups are returned in the order of their first scan.
pub fn assign_fragmentation_scans<S: SpectrumStorage + ?Sized>(
    builder: &ChromatogramBuilder<'_, S>,
    params: &Ms2Params,
) -> Result<Vec<SegmentScans>, BuildError> {
    let mut groups: BTreeMap<(TraceKey, Segment), SegmentScans> = BTreeMap::new();
    let mut dropped = 0usize;
    for scan in builder.run().msms_scans() {
        let Some(precursor) = scan.precursor.as_ref() else {
            continue;
        };
        let Some(trace) = builder.detect_precursor(scan, precursor)? else {
            trace!("No trace for the precursor {:.4} of scan {}", precursor.mz, scan.index);
            dropped += 1;
            continue;
        };
        let Some(segment) = segment_for_msms(&trace, scan, params.max_apex_distance) else {
            dropped += 1;
            continue;
        };
        groups
            .entry((trace.key(), segment))
            .or_insert_with(|| SegmentScans {
                trace: trace.clone(),
                segment,
                scans: Vec::new(),
            })
            .scans
            .push(scan.index);
    }
    debug!(
        "Assigned fragmentation scans to {} segments, {dropped} scans without a precursor trace",
        groups.len()
    );
    let mut groups: Vec<SegmentScans> = groups.into_values().collect();
    groups.sort_by_key(|g| g.scans.first().copied());
    Ok(groups)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::builder::ChromatogramCache;
    use crate::noise::NoiseModel;
    use crate::params::ProcessingParams;
    use crate::scan::{InMemorySpectrumStorage, LCMSRun, Polarity, Precursor};
    use mzpeaks::{CentroidPeak, PeakSet};

    fn gaussian(x: f64, mu: f64, sigma: f64, height: f64) -> f64 {
        height * (-(x - mu).powi(2) / (2.0 * sigma * sigma)).exp()
    }

    #[test]
    fn test_assign_two_elutions() {
        let mut storage = InMemorySpectrumStorage::new();
        let mut scans = Vec::new();
        let mut index = 0;
        for i in 0..60 {
            let x = i as f64;
            let intensity = gaussian(x, 15.0, 3.0, 1e5) + gaussian(x, 45.0, 3.0, 8e4) + 10.0;
            let peaks = PeakSet::new(vec![CentroidPeak::new(400.0, intensity as f32, 0)]);
            scans.push(Scan::new(index, i * 1000, Polarity::Positive).with_peaks(&peaks));
            storage.insert(index, peaks);
            index += 1;
            if i == 14 || i == 16 || i == 44 {
                let fragments = PeakSet::new(vec![CentroidPeak::new(120.0, 500.0, 0)]);
                scans.push(
                    Scan::new(index, i * 1000 + 500, Polarity::Positive)
                        .with_precursor(Precursor::new(400.0, 1e5, 1), 20.0)
                        .with_peaks(&fragments),
                );
                storage.insert(index, fragments);
                index += 1;
            }
        }
        let run = LCMSRun::new("frag", scans).unwrap();
        let params = ProcessingParams::default();
        let cache = ChromatogramCache::new();
        let noise = NoiseModel::Zero;
        let builder = ChromatogramBuilder::new(&run, &storage, &noise, &params, &cache);
        let groups = assign_fragmentation_scans(&builder, &params.ms2).unwrap();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].scans.len(), 2);
        assert_eq!(groups[1].scans.len(), 1);
        assert!(Arc::ptr_eq(&groups[0].trace, &groups[1].trace));
        assert_ne!(groups[0].segment, groups[1].segment);
    }
}
