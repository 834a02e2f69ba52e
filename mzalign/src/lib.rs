//! Chromatographic feature extraction and cross-sample alignment for LC-MS/MS runs.
//!
//! A run is described by its [`LCMSRun`](crate::scan::LCMSRun) scan metadata and a
//! [`SpectrumStorage`](crate::scan::SpectrumStorage) providing centroided peak lists on demand.
//! [`LCMSProcessing`](crate::processing::LCMSProcessing) turns a collection of runs into
//! [`ConsensusFeature`](crate::consensus::ConsensusFeature) records:
//!
//! 1. Fragmentation scans are matched to chromatographic traces, which are segmented into
//!    individual elution events.
//! 2. Isotope and adduct partners are detected by trace correlation.
//! 3. Ions are aligned across samples over several rounds, with retention time recalibration
//!    and gap filling in between.
//! 4. Adduct types are assigned by Gibbs sampling over the aligned rows.
pub mod align;
pub mod builder;
pub mod consensus;
pub mod correlation;
pub mod error;
pub mod extrema;
pub mod ion;
pub mod ion_network;
pub mod ion_type;
pub mod noise;
pub mod params;
pub mod peak_shape;
pub mod processing;
pub mod sample;
pub mod scan;
pub mod segmenter;
pub mod spectrum;
pub mod stats;
pub mod trace;

pub use crate::align::{AlignedFeatures, Cluster};
pub use crate::builder::{ChromatogramBuilder, ChromatogramCache};
pub use crate::consensus::{ConsensusFeature, Feature};
pub use crate::error::{AlignmentError, BuildError, ProcessingError, TraceError};
pub use crate::ion::{FragmentedIon, IonKey, Quality};
pub use crate::ion_type::IonType;
pub use crate::params::ProcessingParams;
pub use crate::processing::{AlignmentReport, CancellationToken, LCMSProcessing};
pub use crate::sample::ProcessedSample;
pub use crate::scan::{
    InMemorySpectrumStorage, LCMSRun, Polarity, Precursor, Scan, ScanPoint, SpectrumStorage,
};
pub use crate::trace::{Segment, Trace, TraceKey};
