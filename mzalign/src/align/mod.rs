//! Cross-sample alignment: clustering ions into rows, retention time recalibration and gap
//! filling.
mod aligner;
mod cluster;
mod gap_filling;
pub mod recalibration;

pub use aligner::{cluster_samples, coarse_error, fit_recalibrations, prefilter};
pub use cluster::{AlignedFeatures, Cluster, RowMember};
pub use gap_filling::{apply_gap_fills, propose_gap_fills, GapFill, GapFillMode};
pub use recalibration::{Anchor, Recalibration};
