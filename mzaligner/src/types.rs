use mzdata::spectrum::MultiLayerSpectrum;
use mzpeaks::{CentroidPeak, DeconvolutedPeak};

pub type CPeak = CentroidPeak;
pub type DPeak = DeconvolutedPeak;

pub type SpectrumType = MultiLayerSpectrum<CPeak, DPeak>;
