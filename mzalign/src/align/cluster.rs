use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::error::AlignmentError;
use crate::ion::{FragmentedIon, IonKey};
use crate::ion_network::AdductAssignment;
use crate::scan::Polarity;
use crate::stats::{median, robust_average};

/// An ion placed in a row, with the recalibrated apex time it was aligned at
#[derive(Debug, Clone)]
pub struct RowMember {
    pub ion: Arc<FragmentedIon>,
    pub retention_time: f64,
}

/// The ions of one compound across samples, at most one per sample
#[derive(Debug, Clone, Default)]
pub struct AlignedFeatures {
    members: BTreeMap<usize, RowMember>,
    mz: f64,
    retention_time: f64,
    /// Set by the adduct network once alignment is complete
    pub ion_types: Option<AdductAssignment>,
}

impl AlignedFeatures {
    pub fn new(sample: usize, ion: Arc<FragmentedIon>, retention_time: f64) -> Self {
        let mut row = Self::default();
        row.members.insert(
            sample,
            RowMember {
                ion,
                retention_time,
            },
        );
        row.update();
        row
    }

    fn update(&mut self) {
        let (mut mz, mut weight, mut rt) = (0.0, 0.0, 0.0);
        for member in self.members.values() {
            let w = (member.ion.apex_intensity() as f64).max(1.0);
            mz += member.ion.mz() * w;
            weight += w;
            rt += member.retention_time;
        }
        if !self.members.is_empty() {
            self.mz = mz / weight;
            self.retention_time = rt / self.members.len() as f64;
        }
    }

    /// Add the ion of a sample not yet in the row
    pub(crate) fn insert(
        &mut self,
        sample: usize,
        ion: Arc<FragmentedIon>,
        retention_time: f64,
    ) -> bool {
        if self.members.contains_key(&sample) {
            return false;
        }
        self.members.insert(
            sample,
            RowMember {
                ion,
                retention_time,
            },
        );
        self.update();
        true
    }

    /// Take over the members of `other`. The rows must not share a sample.
    pub(crate) fn absorb(&mut self, other: AlignedFeatures) {
        for (sample, member) in other.members {
            self.members.entry(sample).or_insert(member);
        }
        self.update();
    }

    pub fn members(&self) -> &BTreeMap<usize, RowMember> {
        &self.members
    }

    pub fn get(&self, sample: usize) -> Option<&RowMember> {
        self.members.get(&sample)
    }

    pub fn contains_sample(&self, sample: usize) -> bool {
        self.members.contains_key(&sample)
    }

    pub fn shares_sample_with(&self, other: &AlignedFeatures) -> bool {
        self.members.keys().any(|s| other.members.contains_key(s))
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// The intensity-weighted m/z of the members
    pub fn mz(&self) -> f64 {
        self.mz
    }

    /// The mean recalibrated apex time of the members
    pub fn retention_time(&self) -> f64 {
        self.retention_time
    }

    pub fn has_msms(&self) -> bool {
        self.members.values().any(|m| m.ion.has_msms())
    }

    pub fn has_isotopes(&self) -> bool {
        self.members.values().any(|m| !m.ion.isotopes.is_empty())
    }

    pub fn polarity(&self) -> Polarity {
        self.members
            .values()
            .map(|m| m.ion.polarity)
            .next()
            .unwrap_or_default()
    }

    pub fn charge(&self) -> i32 {
        self.members
            .values()
            .map(|m| m.ion.charge)
            .next()
            .unwrap_or(1)
    }

    /// The median peak shape score of the members that have one
    pub fn typical_shape_score(&self) -> Option<f64> {
        let mut scores: Vec<f64> = self
            .members
            .values()
            .filter_map(|m| m.ion.peak_shape.map(|s| s.score))
            .collect();
        median(&mut scores)
    }

    /// The member with the most intense apex among those with fragmentation spectra,
    /// falling back to all members
    pub fn representative(&self) -> Option<(usize, &RowMember)> {
        let by_intensity = |a: &(&usize, &RowMember), b: &(&usize, &RowMember)| {
            a.1.ion
                .apex_intensity()
                .total_cmp(&b.1.ion.apex_intensity())
                .then(b.0.cmp(a.0))
        };
        self.members
            .iter()
            .filter(|(_, m)| m.ion.has_msms())
            .max_by(by_intensity)
            .or_else(|| self.members.iter().max_by(by_intensity))
            .map(|(s, m)| (*s, m))
    }

    /// Replace the members' alignment times, e.g. after recalibration
    pub(crate) fn set_retention_times<F: Fn(usize, &FragmentedIon) -> f64>(&mut self, time_of: F) {
        for (sample, member) in self.members.iter_mut() {
            member.retention_time = time_of(*sample, &member.ion);
        }
        self.update();
    }
}

/// The rows produced by one clustering round, with the retention time tolerance they
/// were built with
#[derive(Debug, Clone, Default)]
pub struct Cluster {
    rows: Vec<AlignedFeatures>,
    pub rt_tolerance: f64,
}

impl Cluster {
    pub fn new(rows: Vec<AlignedFeatures>, rt_tolerance: f64) -> Self {
        Self { rows, rt_tolerance }
    }

    pub fn rows(&self) -> &[AlignedFeatures] {
        &self.rows
    }

    pub fn rows_mut(&mut self) -> &mut [AlignedFeatures] {
        &mut self.rows
    }

    pub fn into_rows(self) -> Vec<AlignedFeatures> {
        self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Add `ion` of `sample` to the row at `row`
    pub fn add_member(
        &mut self,
        row: usize,
        sample: usize,
        ion: Arc<FragmentedIon>,
        retention_time: f64,
    ) -> Result<(), AlignmentError> {
        let target = self
            .rows
            .get_mut(row)
            .ok_or(AlignmentError::UnknownRow { row })?;
        if target.insert(sample, ion, retention_time) {
            Ok(())
        } else {
            Err(AlignmentError::SampleAlreadyPresent { row, sample })
        }
    }

    /// Keep the rows for which `keep` returns true, returning how many were dropped
    pub fn retain<F: FnMut(&AlignedFeatures) -> bool>(&mut self, keep: F) -> usize {
        let before = self.rows.len();
        self.rows.retain(keep);
        before - self.rows.len()
    }

    /// Check that no ion is referenced by two rows
    pub fn validate(&self) -> Result<(), AlignmentError> {
        let mut seen: HashMap<(usize, IonKey), usize> = HashMap::new();
        for (i, row) in self.rows.iter().enumerate() {
            for (sample, member) in row.members() {
                if let Some(first) = seen.insert((*sample, member.ion.key()), i) {
                    return Err(AlignmentError::DuplicateMembership {
                        sample: *sample,
                        ion: member.ion.key().to_string(),
                        first,
                        second: i,
                    });
                }
            }
        }
        Ok(())
    }

    /// The robust average absolute deviation of member times from their row's mean, over
    /// rows with at least two members
    pub fn estimate_error(&self) -> Option<f64> {
        let mut deviations: Vec<f64> = self
            .rows
            .iter()
            .filter(|row| row.len() > 1)
            .flat_map(|row| {
                let center = row.retention_time();
                row.members()
                    .values()
                    .map(move |m| (m.retention_time - center).abs())
            })
            .collect();
        robust_average(&mut deviations)
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use crate::scan::ScanPoint;
    use crate::trace::{Trace, TraceKey};

    pub(crate) fn make_ion(mz: f64, apex_time: i64) -> Arc<FragmentedIon> {
        let points = [10.0f32, 60.0, 100.0, 50.0, 5.0]
            .iter()
            .enumerate()
            .map(|(i, v)| ScanPoint::new(i, apex_time + (i as i64 - 2) * 1000, mz, *v))
            .collect();
        let mut trace = Trace::from_points(TraceKey::new(2, mz), points).unwrap();
        let segment = trace.add_segment(0, 2, 4).unwrap();
        Arc::new(FragmentedIon::new(Arc::new(trace), segment, Polarity::Positive))
    }

    #[test]
    fn test_row_consensus() {
        let mut row = AlignedFeatures::new(0, make_ion(300.0, 10_000), 10_000.0);
        assert!(row.insert(1, make_ion(300.001, 12_000), 12_000.0));
        assert!(!row.insert(1, make_ion(300.0, 11_000), 11_000.0));
        assert_eq!(row.len(), 2);
        assert!((row.retention_time() - 11_000.0).abs() < 1e-9);
        assert!((row.mz() - 300.0005).abs() < 1e-6);
    }

    #[test]
    fn test_duplicate_membership() {
        let ion = make_ion(300.0, 10_000);
        let rows = vec![
            AlignedFeatures::new(0, ion.clone(), 10_000.0),
            AlignedFeatures::new(0, ion, 10_000.0),
        ];
        let cluster = Cluster::new(rows, 1000.0);
        assert!(matches!(
            cluster.validate(),
            Err(AlignmentError::DuplicateMembership { first: 0, second: 1, .. })
        ));
    }

    #[test]
    fn test_estimate_error() {
        let mut a = AlignedFeatures::new(0, make_ion(300.0, 10_000), 10_000.0);
        a.insert(1, make_ion(300.0, 12_000), 12_000.0);
        let mut b = AlignedFeatures::new(0, make_ion(400.0, 50_000), 50_000.0);
        b.insert(1, make_ion(400.0, 52_000), 52_000.0);
        let single = AlignedFeatures::new(0, make_ion(500.0, 1_000), 1_000.0);
        let mut cluster = Cluster::new(vec![a, b, single], 8000.0);
        assert_eq!(cluster.estimate_error(), Some(1000.0));
        assert!(cluster.add_member(2, 0, make_ion(500.0, 1_000), 1_000.0).is_err());
        cluster.retain(|row| row.len() > 1);
        assert_eq!(cluster.len(), 2);
    }

    #[test]
    fn test_add_member_to_missing_row() {
        let mut cluster = Cluster::new(
            vec![AlignedFeatures::new(0, make_ion(300.0, 10_000), 10_000.0)],
            1000.0,
        );
        assert_eq!(
            cluster.add_member(3, 1, make_ion(300.0, 10_500), 10_500.0),
            Err(AlignmentError::UnknownRow { row: 3 })
        );
        assert!(cluster.add_member(0, 1, make_ion(300.0, 10_500), 10_500.0).is_ok());
        assert_eq!(cluster.rows()[0].len(), 2);
    }
}
