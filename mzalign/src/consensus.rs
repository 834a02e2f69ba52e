//! Output records: one [`Feature`] per sample and ion, one [`ConsensusFeature`] per row.
use itertools::Itertools;
use statrs::distribution::ContinuousCDF;

use crate::align::AlignedFeatures;
use crate::correlation::to_isotope_spectrum;
use crate::ion::{FragmentedIon, Quality};
use crate::ion_type::IonType;
use crate::noise::Ms2NoiseInformation;
use crate::sample::ProcessedSample;
use crate::stats::median;

/// The isotope pattern of an adduct partner, labelled with the partner's type
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AdductPattern {
    pub ion_type: IonType,
    pub isotope_pattern: Vec<(f64, f64)>,
}

/// The observation of a compound in one sample
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Feature {
    pub sample: usize,
    pub sample_name: String,
    pub mz: f64,
    pub intensity: f32,
    pub charge: i32,
    pub ion_type: IonType,
    pub apex_retention_time: i64,
    pub recalibrated_retention_time: f64,
    /// The recalibrated apex time as a fraction of the latest retention time of all samples
    pub normalized_retention_time: f64,
    pub retention_time_start: i64,
    pub retention_time_end: i64,
    /// (m/z, intensity relative to the monoisotopic peak)
    pub isotope_pattern: Vec<(f64, f64)>,
    pub adduct_patterns: Vec<AdductPattern>,
    pub collision_energy: Option<f64>,
    /// The merged fragment peaks as (m/z, intensity)
    pub msms: Option<Vec<(f64, f32)>>,
    pub ms1_quality: Quality,
    pub ms2_quality: Quality,
    pub peak_shape_quality: Quality,
    /// Standard deviations of the width to height ratio from the sample's typical ratio
    pub peak_width_deviation: Option<f64>,
    pub intensity_after_precursor: f64,
    /// Where `intensity_after_precursor` falls in the sample's distribution of it
    pub intensity_after_precursor_quantile: Option<f64>,
    pub chimeric_pollution: f64,
    pub ms2_noise: Ms2NoiseInformation,
    pub gap_filled: bool,
}

pub fn make_feature(sample: &ProcessedSample, ion: &FragmentedIon) -> Feature {
    let mz = ion.mz();
    let (start, end) = ion.retention_time_span();
    let ion_type = ion
        .detected_type
        .clone()
        .unwrap_or_else(|| IonType::unknown(ion.polarity));
    let adduct_patterns = ion
        .adducts
        .iter()
        .map(|a| AdductPattern {
            ion_type: a.partner_type.clone(),
            isotope_pattern: to_isotope_spectrum(&a.partner.trace, a.partner.mz(), &a.isotopes),
        })
        .collect();
    let msms = ion
        .msms_peaks
        .as_ref()
        .map(|peaks| peaks.iter().map(|p| (p.mz, p.intensity)).collect());
    let recalibrated_retention_time = sample.recalibrated_time(ion.apex_retention_time());
    let intensity_after_precursor_quantile = ion
        .msms
        .as_ref()
        .and(sample.intensity_after_precursor.as_ref())
        .map(|dist| dist.cdf(ion.intensity_after_precursor));
    Feature {
        sample: sample.index,
        sample_name: sample.identifier().to_string(),
        mz,
        intensity: ion.apex_intensity(),
        charge: ion.charge,
        ion_type,
        apex_retention_time: ion.apex_retention_time(),
        recalibrated_retention_time,
        normalized_retention_time: sample.normalized_retention_time(recalibrated_retention_time),
        retention_time_start: start,
        retention_time_end: end,
        isotope_pattern: to_isotope_spectrum(&ion.trace, mz, &ion.isotopes),
        adduct_patterns,
        collision_energy: ion.msms.as_ref().map(|m| m.collision_energy()),
        msms,
        ms1_quality: ion.ms1_quality,
        ms2_quality: ion.ms2_quality,
        peak_shape_quality: ion.peak_shape.map(|s| s.quality).unwrap_or_default(),
        peak_width_deviation: sample.peak_widths.deviation(ion),
        intensity_after_precursor: ion.intensity_after_precursor,
        intensity_after_precursor_quantile,
        chimeric_pollution: ion.chimeric_pollution,
        ms2_noise: sample.ms2_noise_information,
        gap_filled: ion.gap_filled,
    }
}

/// One compound aligned across samples
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ConsensusFeature {
    pub index: usize,
    pub mz: f64,
    /// The median recalibrated apex time in milliseconds
    pub retention_time: f64,
    pub intensity: f32,
    pub charge: i32,
    pub isotope_pattern: Vec<(f64, f64)>,
    pub ion_type: Option<IonType>,
    pub possible_ion_types: Vec<IonType>,
    /// The chimeric pollution of the representative ion
    pub chimeric_pollution: f64,
    pub features: Vec<Feature>,
}

impl ConsensusFeature {
    pub fn from_row(index: usize, row: &AlignedFeatures, samples: &[ProcessedSample]) -> Self {
        let mut features: Vec<Feature> = row
            .members()
            .iter()
            .filter_map(|(s, member)| {
                samples
                    .iter()
                    .find(|sample| sample.index == *s)
                    .map(|sample| make_feature(sample, &member.ion))
            })
            .collect();
        let mut times: Vec<f64> = features
            .iter()
            .map(|f| f.recalibrated_retention_time)
            .collect();
        let intensity = features
            .iter()
            .map(|f| f.intensity)
            .fold(0.0f32, f32::max);
        let representative = row.representative().map(|(_, m)| m.ion.clone());
        let isotope_pattern = representative
            .as_ref()
            .map(|ion| to_isotope_spectrum(&ion.trace, ion.mz(), &ion.isotopes))
            .unwrap_or_default();
        let chimeric_pollution = representative
            .as_ref()
            .map(|ion| ion.chimeric_pollution)
            .unwrap_or_default();

        let (ion_type, possible_ion_types) = match &row.ion_types {
            Some(assignment) => (
                assignment.detected.clone(),
                assignment.possible().cloned().collect(),
            ),
            None => {
                let possible: Vec<IonType> = row
                    .members()
                    .values()
                    .flat_map(|m| m.ion.candidate_types())
                    .sorted()
                    .dedup()
                    .collect();
                let detected = representative.as_ref().and_then(|ion| ion.detected_type.clone());
                (detected, possible)
            }
        };

        if let Some(detected) = &ion_type {
            for feature in features.iter_mut() {
                feature.ion_type = detected.clone();
            }
        }

        Self {
            index,
            mz: row.mz(),
            retention_time: median(&mut times).unwrap_or_else(|| row.retention_time()),
            intensity,
            charge: row.charge(),
            isotope_pattern,
            ion_type,
            possible_ion_types,
            chimeric_pollution,
            features,
        }
    }

    pub fn sample_count(&self) -> usize {
        self.features.len()
    }

    pub fn has_msms(&self) -> bool {
        self.features.iter().any(|f| f.msms.is_some())
    }

    pub fn get(&self, sample: usize) -> Option<&Feature> {
        self.features.iter().find(|f| f.sample == sample)
    }
}
