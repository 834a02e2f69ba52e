//! Chromatographic traces and the elution segments within them.
use std::fmt::Display;

use crate::error::TraceError;
use crate::scan::{ScanIndex, ScanPoint};

/// The identity of a trace: the seed point it was built from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TraceKey {
    pub scan_index: ScanIndex,
    mz_bits: u64,
}

impl TraceKey {
    pub fn new(scan_index: ScanIndex, mz: f64) -> Self {
        Self {
            scan_index,
            mz_bits: mz.to_bits(),
        }
    }

    pub fn mz(&self) -> f64 {
        f64::from_bits(self.mz_bits)
    }
}

impl From<&ScanPoint> for TraceKey {
    fn from(value: &ScanPoint) -> Self {
        Self::new(value.scan_index, value.mz)
    }
}

impl Display for TraceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.4}@{}", self.mz(), self.scan_index)
    }
}

/// One elution event: indices into the owning trace with `start <= apex <= end`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Segment {
    pub start: usize,
    pub apex: usize,
    pub end: usize,
}

impl Segment {
    pub fn new(start: usize, apex: usize, end: usize) -> Self {
        Self { start, apex, end }
    }

    pub fn len(&self) -> usize {
        self.end - self.start + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn contains(&self, index: usize) -> bool {
        self.start <= index && index <= self.end
    }

    /// Whether the interiors of the two segments intersect. Sharing a boundary point is allowed.
    pub fn overlaps(&self, other: &Segment) -> bool {
        if self == other {
            return true;
        }
        self.start < other.end && other.start < self.end
    }

    fn shifted(&self, offset: usize) -> Self {
        Self::new(self.start - offset, self.apex - offset, self.end - offset)
    }
}

/// Records that a trace correlates with another over `start..=end` of its own indices
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TraceCorrelation {
    pub partner: TraceKey,
    pub coefficient: f64,
    pub start: usize,
    pub end: usize,
}

/// The intensity of one m/z followed over consecutive MS1 scans.
#[derive(Debug, Clone, PartialEq)]
pub struct Trace {
    key: TraceKey,
    points: Vec<ScanPoint>,
    segments: Vec<Segment>,
    correlation: Option<TraceCorrelation>,
}

impl Trace {
    pub fn new(seed: ScanPoint) -> Self {
        Self {
            key: TraceKey::from(&seed),
            points: vec![seed],
            segments: Vec::new(),
            correlation: None,
        }
    }

    pub fn from_points(key: TraceKey, points: Vec<ScanPoint>) -> Result<Self, TraceError> {
        for pair in points.windows(2) {
            if pair[0].scan_index >= pair[1].scan_index {
                return Err(TraceError::UnorderedPoint {
                    scan_index: pair[1].scan_index,
                    boundary: pair[0].scan_index,
                });
            }
        }
        Ok(Self {
            key,
            points,
            segments: Vec::new(),
            correlation: None,
        })
    }

    pub fn key(&self) -> TraceKey {
        self.key
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn points(&self) -> &[ScanPoint] {
        &self.points
    }

    pub fn get(&self, index: usize) -> Option<&ScanPoint> {
        self.points.get(index)
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn correlation(&self) -> Option<&TraceCorrelation> {
        self.correlation.as_ref()
    }

    pub fn intensities(&self) -> Vec<f32> {
        self.points.iter().map(|p| p.intensity).collect()
    }

    pub fn intensity_at(&self, index: usize) -> f32 {
        self.points[index].intensity
    }

    pub fn mz_at(&self, index: usize) -> f64 {
        self.points[index].mz
    }

    pub fn scan_index_at(&self, index: usize) -> ScanIndex {
        self.points[index].scan_index
    }

    pub fn retention_time_at(&self, index: usize) -> i64 {
        self.points[index].retention_time
    }

    /// The position of the point observed in `scan_index`, if any
    pub fn index_of_scan(&self, scan_index: ScanIndex) -> Option<usize> {
        self.points
            .binary_search_by(|p| p.scan_index.cmp(&scan_index))
            .ok()
    }

    pub fn contains_point(&self, point: &ScanPoint) -> bool {
        self.index_of_scan(point.scan_index)
            .map(|i| self.points[i].mz == point.mz)
            .unwrap_or(false)
    }

    pub fn extend_right(&mut self, point: ScanPoint) -> Result<(), TraceError> {
        if let Some(last) = self.points.last() {
            if last.scan_index >= point.scan_index {
                return Err(TraceError::UnorderedPoint {
                    scan_index: point.scan_index,
                    boundary: last.scan_index,
                });
            }
        }
        self.points.push(point);
        Ok(())
    }

    pub fn extend_left(&mut self, point: ScanPoint) -> Result<(), TraceError> {
        if let Some(first) = self.points.first() {
            if first.scan_index <= point.scan_index {
                return Err(TraceError::UnorderedPoint {
                    scan_index: point.scan_index,
                    boundary: first.scan_index,
                });
            }
        }
        self.points.insert(0, point);
        for seg in self.segments.iter_mut() {
            *seg = Segment::new(seg.start + 1, seg.apex + 1, seg.end + 1);
        }
        if let Some(corr) = self.correlation.as_mut() {
            corr.start += 1;
            corr.end += 1;
        }
        Ok(())
    }

    fn position_of(&self, segment: &Segment) -> Result<usize, TraceError> {
        self.segments
            .binary_search(segment)
            .map_err(|_| TraceError::UnknownSegment {
                start: segment.start,
                end: segment.end,
            })
    }

    fn validate(&self, segment: &Segment) -> Result<(), TraceError> {
        if segment.start > segment.apex
            || segment.apex > segment.end
            || segment.end >= self.points.len()
        {
            return Err(TraceError::InvalidSegment {
                start: segment.start,
                apex: segment.apex,
                end: segment.end,
                length: self.points.len(),
            });
        }
        Ok(())
    }

    pub fn add_segment(
        &mut self,
        start: usize,
        apex: usize,
        end: usize,
    ) -> Result<Segment, TraceError> {
        let segment = Segment::new(start, apex, end);
        self.validate(&segment)?;
        if let Some(other) = self.segments.iter().find(|s| s.overlaps(&segment)) {
            return Err(TraceError::OverlappingSegment {
                start,
                end,
                other_start: other.start,
                other_end: other.end,
            });
        }
        let i = self.segments.partition_point(|s| *s < segment);
        self.segments.insert(i, segment);
        Ok(segment)
    }

    /// Split `segment` at `valley` into two segments with their own apices
    pub fn divide_segment(
        &mut self,
        segment: Segment,
        valley: usize,
        left_apex: usize,
        right_apex: usize,
    ) -> Result<(Segment, Segment), TraceError> {
        let i = self.position_of(&segment)?;
        let left = Segment::new(segment.start, left_apex, valley);
        let right = Segment::new(valley, right_apex, segment.end);
        self.validate(&left)?;
        self.validate(&right)?;
        self.segments[i] = left;
        self.segments.insert(i + 1, right);
        Ok((left, right))
    }

    /// Merge two neighboring segments, keeping the more intense apex
    pub fn join_segments(&mut self, left: Segment, right: Segment) -> Result<Segment, TraceError> {
        let i = self.position_of(&left)?;
        let j = self.position_of(&right)?;
        if j != i + 1 {
            return Err(TraceError::NonAdjacentSegments {
                left_end: left.end,
                right_start: right.start,
            });
        }
        let apex = if self.intensity_at(left.apex) >= self.intensity_at(right.apex) {
            left.apex
        } else {
            right.apex
        };
        let joined = Segment::new(left.start, apex, right.end);
        self.segments[i] = joined;
        self.segments.remove(j);
        Ok(joined)
    }

    /// Merge every segment whose apex lies in the scans `first_scan..=last_scan`
    pub fn join_all_segments_within(
        &mut self,
        first_scan: ScanIndex,
        last_scan: ScanIndex,
    ) -> Option<Segment> {
        let selected: Vec<usize> = self
            .segments
            .iter()
            .enumerate()
            .filter(|(_, s)| {
                let scan = self.points[s.apex].scan_index;
                first_scan <= scan && scan <= last_scan
            })
            .map(|(i, _)| i)
            .collect();
        let (first, last) = (*selected.first()?, *selected.last()?);
        let apex = self.segments[first..=last]
            .iter()
            .map(|s| s.apex)
            .max_by(|a, b| self.intensity_at(*a).total_cmp(&self.intensity_at(*b)))?;
        let joined = Segment::new(self.segments[first].start, apex, self.segments[last].end);
        self.segments.drain(first..=last);
        self.segments.insert(first, joined);
        Some(joined)
    }

    /// Drop the points outside the first and last segment, re-indexing the segments.
    ///
    /// Returns the number of points removed from the front.
    pub fn trim_edges(&mut self) -> usize {
        let (Some(first), Some(last)) = (self.segments.first(), self.segments.last()) else {
            return 0;
        };
        let (start, end) = (first.start, last.end);
        self.points.truncate(end + 1);
        self.points.drain(..start);
        for seg in self.segments.iter_mut() {
            *seg = seg.shifted(start);
        }
        if let Some(corr) = self.correlation {
            if corr.start < start || corr.end > end {
                self.correlation = None;
            } else {
                self.correlation = Some(TraceCorrelation {
                    start: corr.start - start,
                    end: corr.end - start,
                    ..corr
                });
            }
        }
        start
    }

    pub fn set_correlation(&mut self, partner: TraceKey, coefficient: f64, start: usize, end: usize) {
        self.correlation = Some(TraceCorrelation {
            partner,
            coefficient,
            start,
            end,
        });
    }

    /// The index range around the apex of `segment` where intensity stays at or above
    /// `fraction` of the apex intensity.
    pub fn segment_fwhm(&self, segment: &Segment, fraction: f32) -> (usize, usize) {
        let threshold = self.intensity_at(segment.apex) * fraction;
        let mut a = segment.apex;
        while a > segment.start && self.intensity_at(a - 1) >= threshold {
            a -= 1;
        }
        let mut b = segment.apex;
        while b < segment.end && self.intensity_at(b + 1) >= threshold {
            b += 1;
        }
        (a, b)
    }

    /// The retention time span of the `fraction` window in milliseconds
    pub fn segment_width(&self, segment: &Segment, fraction: f32) -> i64 {
        let (a, b) = self.segment_fwhm(segment, fraction);
        self.retention_time_at(b) - self.retention_time_at(a)
    }

    pub fn segment_points(&self, segment: &Segment) -> &[ScanPoint] {
        &self.points[segment.start..=segment.end]
    }

    /// The segment spanning the scan `scan_index`, preferring the more intense apex when
    /// the scan is a shared boundary.
    pub fn segment_for_scan(&self, scan_index: ScanIndex) -> Option<Segment> {
        let first = self.points.first()?.scan_index;
        let last = self.points.last()?.scan_index;
        if scan_index < first || scan_index > last {
            return None;
        }
        self.segments
            .iter()
            .filter(|s| {
                let lo = self.points[s.start].scan_index;
                let hi = self.points[s.end].scan_index;
                lo <= scan_index && scan_index <= hi
            })
            .max_by(|a, b| self.intensity_at(a.apex).total_cmp(&self.intensity_at(b.apex)))
            .copied()
    }

    /// The segment whose apex is closest in time to `retention_time`
    pub fn nearest_segment(&self, retention_time: i64) -> Option<Segment> {
        self.segments
            .iter()
            .min_by_key(|s| (self.retention_time_at(s.apex) - retention_time).abs())
            .copied()
    }

    /// Intensity-weighted m/z over `start..=end`
    pub fn weighted_mz(&self, start: usize, end: usize) -> f64 {
        let (mut acc, mut total) = (0.0, 0.0);
        for p in &self.points[start..=end] {
            acc += p.mz * p.intensity as f64;
            total += p.intensity as f64;
        }
        if total > 0.0 {
            acc / total
        } else {
            self.points[(start + end) / 2].mz
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn make_trace(intensities: &[f32]) -> Trace {
        let points = intensities
            .iter()
            .enumerate()
            .map(|(i, v)| ScanPoint::new(i * 2, i as i64 * 1000, 300.0, *v))
            .collect();
        Trace::from_points(TraceKey::new(0, 300.0), points).unwrap()
    }

    #[test]
    fn test_extend_order() {
        let mut trace = Trace::new(ScanPoint::new(10, 5000, 300.0, 10.0));
        trace.extend_right(ScanPoint::new(12, 6000, 300.0, 5.0)).unwrap();
        trace.extend_left(ScanPoint::new(8, 4000, 300.0, 5.0)).unwrap();
        assert_eq!(trace.len(), 3);
        assert_eq!(trace.scan_index_at(0), 8);
        assert!(matches!(
            trace.extend_right(ScanPoint::new(11, 5500, 300.0, 1.0)),
            Err(TraceError::UnorderedPoint { .. })
        ));
        assert!(trace.extend_left(ScanPoint::new(9, 4500, 300.0, 1.0)).is_err());
    }

    #[test]
    fn test_segments_never_overlap() {
        let mut trace = make_trace(&[1.0, 5.0, 10.0, 5.0, 2.0, 6.0, 12.0, 6.0, 1.0]);
        trace.add_segment(0, 2, 4).unwrap();
        trace.add_segment(4, 6, 8).unwrap();
        assert!(matches!(
            trace.add_segment(3, 5, 6),
            Err(TraceError::OverlappingSegment { .. })
        ));
        assert!(matches!(
            trace.add_segment(2, 1, 3),
            Err(TraceError::InvalidSegment { .. })
        ));
        let segs = trace.segments();
        assert!(segs.windows(2).all(|w| w[0].end <= w[1].start));
    }

    #[test]
    fn test_divide_and_join() {
        let mut trace = make_trace(&[1.0, 5.0, 10.0, 5.0, 2.0, 6.0, 12.0, 6.0, 1.0]);
        let whole = trace.add_segment(0, 6, 8).unwrap();
        let (left, right) = trace.divide_segment(whole, 4, 2, 6).unwrap();
        assert_eq!(left, Segment::new(0, 2, 4));
        assert_eq!(right, Segment::new(4, 6, 8));
        assert_eq!(trace.segments().len(), 2);
        let joined = trace.join_segments(left, right).unwrap();
        assert_eq!(joined, Segment::new(0, 6, 8));
        assert_eq!(trace.segments(), &[joined]);
    }

    #[test]
    fn test_trim_edges_reindexes() {
        let mut trace = make_trace(&[1.0, 1.0, 5.0, 10.0, 5.0, 1.0, 1.0]);
        trace.add_segment(2, 3, 4).unwrap();
        let removed = trace.trim_edges();
        assert_eq!(removed, 2);
        assert_eq!(trace.len(), 3);
        assert_eq!(trace.segments(), &[Segment::new(0, 1, 2)]);
        assert_eq!(trace.scan_index_at(0), 4);
    }

    #[test]
    fn test_fwhm_and_lookup() {
        let mut trace = make_trace(&[1.0, 4.0, 8.0, 10.0, 7.0, 3.0, 1.0]);
        let seg = trace.add_segment(0, 3, 6).unwrap();
        assert_eq!(trace.segment_fwhm(&seg, 0.5), (2, 4));
        assert_eq!(trace.segment_for_scan(6), Some(seg));
        assert_eq!(trace.segment_for_scan(100), None);
        assert_eq!(trace.nearest_segment(2900), Some(seg));
    }

    #[test]
    fn test_join_within_scans() {
        let mut trace = make_trace(&[1.0, 5.0, 10.0, 5.0, 2.0, 6.0, 12.0, 6.0, 1.0]);
        trace.add_segment(0, 2, 4).unwrap();
        trace.add_segment(4, 6, 8).unwrap();
        let joined = trace.join_all_segments_within(0, 16).unwrap();
        assert_eq!(joined, Segment::new(0, 6, 8));
        assert_eq!(trace.segments().len(), 1);
    }
}
