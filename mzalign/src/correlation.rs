//! Isotope and adduct detection by correlating elution profiles.
use mzpeaks::Tolerance;
use tracing::{debug, warn};

use crate::builder::ChromatogramBuilder;
use crate::error::BuildError;
use crate::ion::{AdductPartner, CorrelatedTrace, FragmentedIon, Quality};
use crate::ion_type::{parse_ion_types, IonType, IonTypeParseError};
use crate::noise::NoiseModel;
use crate::params::CorrelationParams;
use crate::scan::SpectrumStorage;
use crate::stats::pearson;
use crate::trace::{Segment, Trace};

/// The mass difference between consecutive isotope peaks
pub const NEUTRON_SHIFT: f64 = 1.0033548378;

/// The segment of `partner` to compare with `segment` of `parent`: the one spanning the
/// parent apex scan, otherwise the one with the closest apex.
pub fn partner_segment(parent: &Trace, segment: &Segment, partner: &Trace) -> Option<Segment> {
    let apex_scan = parent.scan_index_at(segment.apex);
    partner
        .segment_for_scan(apex_scan)
        .or_else(|| partner.nearest_segment(parent.retention_time_at(segment.apex)))
}

/// Pearson correlation of two segments over the scans both of them cover.
///
/// Returns the coefficient and the number of shared scans, or `None` when fewer than
/// `min_overlap` scans are shared.
pub fn correlate_segments(
    parent: &Trace,
    segment: &Segment,
    partner: &Trace,
    partner_segment: &Segment,
    min_overlap: usize,
) -> Option<(f64, usize)> {
    let mut x = Vec::new();
    let mut y = Vec::new();
    for point in partner.segment_points(partner_segment) {
        if let Some(i) = parent.index_of_scan(point.scan_index) {
            if segment.contains(i) {
                x.push(parent.intensity_at(i) as f64);
                y.push(point.intensity as f64);
            }
        }
    }
    if x.len() < min_overlap.max(2) {
        return None;
    }
    Some((pearson(&x, &y), x.len()))
}

/// Build the isotope pattern of an ion as (m/z, intensity ratio) pairs.
///
/// The first entry is `(ion_mass, 1.0)`. Every isotope contributes its intensity-weighted
/// m/z and the mean ratio of its intensity to the parent's over the half-maximum window of
/// its own segment. The list is cut short at the first isotope that has a point in a scan
/// the parent does not cover.
pub fn to_isotope_spectrum(
    parent: &Trace,
    ion_mass: f64,
    isotopes: &[CorrelatedTrace],
) -> Vec<(f64, f64)> {
    let mut spectrum = vec![(ion_mass, 1.0)];
    for isotope in isotopes {
        let (a, b) = isotope.trace.segment_fwhm(&isotope.segment, 0.5);
        let mut ratio_sum = 0.0;
        let mut n = 0usize;
        let mut weighted_mz = 0.0;
        let mut total = 0.0;
        for point in &isotope.trace.points()[a..=b] {
            let Some(i) = parent.index_of_scan(point.scan_index) else {
                warn!(
                    "Parent trace {} has no point in scan {}, truncating its isotope pattern at {} peaks",
                    parent.key(),
                    point.scan_index,
                    spectrum.len()
                );
                return spectrum;
            };
            let reference = parent.intensity_at(i) as f64;
            if reference > 0.0 {
                ratio_sum += point.intensity as f64 / reference;
                n += 1;
            }
            weighted_mz += point.mz * point.intensity as f64;
            total += point.intensity as f64;
        }
        if n == 0 || total <= 0.0 {
            break;
        }
        spectrum.push((weighted_mz / total, ratio_sum / n as f64));
    }
    spectrum
}

/// Searches the traces around an ion for its isotopes and adduct partners.
pub struct CorrelationDetector<'b, 'a, S: SpectrumStorage + ?Sized> {
    builder: &'b ChromatogramBuilder<'a, S>,
    noise: &'b NoiseModel,
    params: &'b CorrelationParams,
    ion_types: Vec<IonType>,
}

impl<'b, 'a, S: SpectrumStorage + ?Sized> CorrelationDetector<'b, 'a, S> {
    pub fn new(
        builder: &'b ChromatogramBuilder<'a, S>,
        noise: &'b NoiseModel,
        params: &'b CorrelationParams,
    ) -> Result<Self, IonTypeParseError> {
        let ion_types = parse_ion_types(&params.detectable_ion_types)?;
        Ok(Self {
            builder,
            noise,
            params,
            ion_types,
        })
    }

    pub fn ion_types(&self) -> &[IonType] {
        &self.ion_types
    }

    fn search(
        &self,
        parent: &Trace,
        segment: &Segment,
        target_mz: f64,
        slack: f64,
        min_correlation: f64,
    ) -> Result<Option<CorrelatedTrace>, BuildError> {
        let (lo, hi) = self.params.tolerance().bounds(target_mz);
        let tolerance = Tolerance::Da((hi - lo) / 2.0 + slack);
        let first = parent.scan_index_at(segment.start);
        let last = parent.scan_index_at(segment.end);
        let Some(partner) = self
            .builder
            .detect_in_window(first, last, target_mz, tolerance)?
        else {
            return Ok(None);
        };
        if partner.key() == parent.key() {
            return Ok(None);
        }
        let Some(partner_seg) = partner_segment(parent, segment, &partner) else {
            return Ok(None);
        };
        let Some((coefficient, overlap)) = correlate_segments(
            parent,
            segment,
            &partner,
            &partner_seg,
            self.params.min_overlap,
        ) else {
            return Ok(None);
        };
        if coefficient < min_correlation {
            return Ok(None);
        }
        Ok(Some(CorrelatedTrace {
            trace: partner,
            segment: partner_seg,
            coefficient,
            overlap,
        }))
    }

    /// Follow the isotope ladder above `mz` until the first isotope that is missing or does
    /// not correlate
    pub fn detect_isotopes(
        &self,
        parent: &Trace,
        segment: &Segment,
        mz: f64,
        charge: i32,
    ) -> Result<Vec<CorrelatedTrace>, BuildError> {
        let z = charge.unsigned_abs().max(1) as f64;
        let mut isotopes = Vec::new();
        for k in 1..=self.params.max_isotopes {
            let target = mz + k as f64 * NEUTRON_SHIFT / z;
            match self.search(
                parent,
                segment,
                target,
                self.params.isotope_mass_slack,
                self.params.min_isotope_correlation,
            )? {
                Some(isotope) => isotopes.push(isotope),
                None => break,
            }
        }
        Ok(isotopes)
    }

    /// Whether a correlated peak one isotope below `mz` is intense enough that the ion is
    /// better explained as its isotope
    fn is_isotope_peak(
        &self,
        parent: &Trace,
        segment: &Segment,
        mz: f64,
        charge: i32,
    ) -> Result<bool, BuildError> {
        let z = charge.unsigned_abs().max(1) as f64;
        let target = mz - NEUTRON_SHIFT / z;
        let found = self.search(
            parent,
            segment,
            target,
            self.params.isotope_mass_slack,
            self.params.min_isotope_correlation,
        )?;
        Ok(match found {
            Some(lighter) => {
                let ion = parent.intensity_at(segment.apex) as f64;
                ion <= lighter.apex_intensity() as f64 * self.params.monoisotopic_ratio
            }
            None => false,
        })
    }

    /// Search adduct partners under every pair of detectable ion types of the ion's
    /// polarity and charge
    pub fn detect_adducts(
        &self,
        parent: &Trace,
        segment: &Segment,
        mz: f64,
        charge: i32,
    ) -> Result<Vec<AdductPartner>, BuildError> {
        let mut partners = Vec::new();
        let compatible: Vec<&IonType> = self
            .ion_types
            .iter()
            .filter(|t| !t.is_unknown() && t.charge() == charge)
            .collect();
        for assumed in compatible.iter() {
            let neutral = assumed.neutral_mass(mz);
            for other in self
                .ion_types
                .iter()
                .filter(|t| !t.is_unknown() && t.charge().signum() == charge.signum())
            {
                if other == *assumed {
                    continue;
                }
                let target = other.mz(neutral);
                if target <= 0.0 {
                    continue;
                }
                if let Some(partner) = self.search(
                    parent,
                    segment,
                    target,
                    0.0,
                    self.params.min_adduct_correlation,
                )? {
                    let isotopes = self.detect_isotopes(
                        &partner.trace,
                        &partner.segment,
                        partner.mz(),
                        other.charge(),
                    )?;
                    partners.push(AdductPartner {
                        ion_type: (*assumed).clone(),
                        partner_type: other.clone(),
                        partner,
                        isotopes,
                    });
                }
            }
        }
        Ok(partners)
    }

    /// Attach isotopes and adduct partners to `ion` and rate its MS1 evidence.
    ///
    /// Returns `false` when the ion is itself an isotope peak and should be dropped.
    pub fn detect(&self, ion: &mut FragmentedIon) -> Result<bool, BuildError> {
        let trace = ion.trace.clone();
        let segment = ion.segment;
        let mz = ion.mz();
        let charge = if ion.charge == 0 {
            ion.polarity.charge()
        } else {
            ion.charge
        };
        if self.is_isotope_peak(&trace, &segment, mz, charge)? {
            debug!("{} is an isotope peak of a lighter ion", ion.key());
            return Ok(false);
        }
        ion.isotopes = self.detect_isotopes(&trace, &segment, mz, charge)?;
        ion.adducts = self.detect_adducts(&trace, &segment, mz, charge)?;
        let mut possible: Vec<IonType> = ion.adducts.iter().map(|a| a.ion_type.clone()).collect();
        possible.sort();
        possible.dedup();
        ion.possible_types = possible;

        let noise = self
            .noise
            .noise_level(trace.scan_index_at(segment.apex), mz);
        ion.ms1_quality = if (ion.apex_intensity() as f64) < 3.0 * noise {
            Quality::Bad
        } else {
            match ion.isotopes.len() {
                0 => Quality::Bad,
                1 => Quality::Decent,
                _ => Quality::Good,
            }
        };
        Ok(true)
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use super::*;
    use crate::builder::ChromatogramCache;
    use crate::params::ProcessingParams;
    use crate::scan::{InMemorySpectrumStorage, LCMSRun, Polarity, Scan, ScanPoint};
    use crate::trace::TraceKey;
    use mzpeaks::{CentroidPeak, PeakSet};

    fn gaussian(x: f64, mu: f64, sigma: f64, height: f64) -> f64 {
        height * (-(x - mu).powi(2) / (2.0 * sigma * sigma)).exp()
    }

    fn make_trace(mz: f64, scans: std::ops::Range<usize>, height: f64) -> Trace {
        let points = scans
            .map(|i| {
                ScanPoint::new(i, i as i64 * 1000, mz, gaussian(i as f64, 15.0, 3.0, height) as f32 + 1.0)
            })
            .collect::<Vec<_>>();
        let key = TraceKey::from(&points[0]);
        let mut trace = Trace::from_points(key, points).unwrap();
        let n = trace.len();
        let apex = trace.index_of_scan(15).unwrap();
        trace.add_segment(0, apex, n - 1).unwrap();
        trace
    }

    #[test]
    fn test_isotope_ratio() {
        let parent = make_trace(300.0, 0..30, 1e5);
        let isotope = make_trace(301.00335, 5..25, 3e4);
        let seg = parent.segments()[0];
        let iso_seg = partner_segment(&parent, &seg, &isotope).unwrap();
        let (coefficient, overlap) = correlate_segments(&parent, &seg, &isotope, &iso_seg, 4).unwrap();
        assert!(coefficient > 0.99);
        assert_eq!(overlap, 20);
        let correlated = CorrelatedTrace {
            trace: Arc::new(isotope),
            segment: iso_seg,
            coefficient,
            overlap,
        };
        let pattern = to_isotope_spectrum(&parent, 300.0, &[correlated]);
        assert_eq!(pattern.len(), 2);
        assert_eq!(pattern[0], (300.0, 1.0));
        assert!((pattern[1].1 - 0.3).abs() < 0.02, "{pattern:?}");
        assert!((pattern[1].0 - 301.00335).abs() < 1e-6);
    }

    #[test]
    fn test_truncated_when_parent_missing() {
        let parent = make_trace(300.0, 14..17, 1e5);
        let isotope = make_trace(301.00335, 5..25, 3e4);
        let seg = parent.segments()[0];
        let iso_seg = isotope.segments()[0];
        let correlated = CorrelatedTrace {
            trace: Arc::new(isotope),
            segment: iso_seg,
            coefficient: 1.0,
            overlap: 3,
        };
        let pattern = to_isotope_spectrum(&parent, 300.0, &[correlated]);
        assert_eq!(pattern.len(), 1);
    }

    #[test_log::test]
    fn test_detect_isotopes_and_adducts() {
        let proton = chemical_elements::PROTON;
        let neutral = 299.0;
        let protonated = neutral + proton;
        let sodiated: f64 = "[M+Na]+".parse::<IonType>().unwrap().mz(neutral);
        let mut storage = InMemorySpectrumStorage::new();
        let mut scans = Vec::new();
        for i in 0..30 {
            let x = i as f64;
            let mut peaks = vec![
                (protonated, gaussian(x, 15.0, 3.0, 1e5) as f32 + 1.0),
                (protonated + NEUTRON_SHIFT, gaussian(x, 15.0, 3.0, 2e4) as f32 + 1.0),
                (sodiated, gaussian(x, 15.0, 3.0, 5e4) as f32 + 1.0),
                // uncorrelated at the second isotope position
                (protonated + 2.0 * NEUTRON_SHIFT, 1000.0 + (i % 3) as f32 * 500.0),
            ];
            peaks.sort_by(|a, b| a.0.total_cmp(&b.0));
            let peaks = PeakSet::new(
                peaks
                    .into_iter()
                    .enumerate()
                    .map(|(j, (mz, int))| CentroidPeak::new(mz, int, j as u32))
                    .collect(),
            );
            scans.push(Scan::new(i, i as i64 * 1000, Polarity::Positive).with_peaks(&peaks));
            storage.insert(i, peaks);
        }
        let run = LCMSRun::new("adducts", scans).unwrap();
        let params = ProcessingParams::default();
        let cache = ChromatogramCache::new();
        let noise = NoiseModel::Zero;
        let builder = ChromatogramBuilder::new(&run, &storage, &noise, &params, &cache);
        let trace = builder
            .detect_seed(&run.scans()[15], protonated, Tolerance::PPM(10.0))
            .unwrap()
            .unwrap();
        let segment = trace.segments()[0];
        let mut ion = FragmentedIon::new(trace, segment, Polarity::Positive);
        let detector = CorrelationDetector::new(&builder, &noise, &params.correlation).unwrap();
        assert!(detector.detect(&mut ion).unwrap());
        assert_eq!(ion.isotopes.len(), 1);
        assert_eq!(ion.ms1_quality, Quality::Decent);
        let hypotheses: Vec<_> = ion
            .adducts
            .iter()
            .map(|a| (a.ion_type.name().to_string(), a.partner_type.name().to_string()))
            .collect();
        assert!(
            hypotheses.contains(&("[M+H]+".to_string(), "[M+Na]+".to_string())),
            "{hypotheses:?}"
        );
        assert!(ion.possible_types.iter().any(|t| t.name() == "[M+H]+"));
    }
}
