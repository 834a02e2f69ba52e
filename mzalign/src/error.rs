use thiserror::Error;

use crate::ion_type::IonTypeParseError;
use crate::scan::{ScanIndex, StorageError};

/// A structural defect in a [`Trace`](crate::trace::Trace), or a smoothing filter that
/// could not be applied to one. These are never the result of noisy input and are not
/// repaired.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TraceError {
    #[error("Scan {scan_index} cannot extend a trace bounded by scan {boundary}")]
    UnorderedPoint {
        scan_index: ScanIndex,
        boundary: ScanIndex,
    },
    #[error(
        "Segment {start}-{end} overlaps the existing segment {other_start}-{other_end}"
    )]
    OverlappingSegment {
        start: usize,
        end: usize,
        other_start: usize,
        other_end: usize,
    },
    #[error("Segment {start}-{apex}-{end} is not valid for a trace of {length} points")]
    InvalidSegment {
        start: usize,
        apex: usize,
        end: usize,
        length: usize,
    },
    #[error("Segment {start}-{end} does not belong to this trace")]
    UnknownSegment { start: usize, end: usize },
    #[error("Segments {left_end} and {right_start} are not adjacent")]
    NonAdjacentSegments { left_end: usize, right_start: usize },
    #[error("Failed to smooth with half-width {half_width}: {reason}")]
    Smoothing { half_width: usize, reason: String },
}

/// A failure while building a trace. Both causes are cached with the trace key they
/// occurred for, so the error must be cloneable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BuildError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Trace(#[from] TraceError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AlignmentError {
    #[error("Ion {ion} of sample {sample} is referenced by rows {first} and {second}")]
    DuplicateMembership {
        sample: usize,
        ion: String,
        first: usize,
        second: usize,
    },
    #[error("Row {row} already holds an ion for sample {sample}")]
    SampleAlreadyPresent { row: usize, sample: usize },
    #[error("Row {row} does not exist")]
    UnknownRow { row: usize },
}

#[derive(Debug, Error)]
pub enum ProcessingError {
    #[error("Invalid input data: {0}")]
    InvalidInputData(String),
    #[error("Failed to retrieve a spectrum: {0}")]
    Storage(
        #[from]
        #[source]
        StorageError,
    ),
    #[error("Trace invariant violated: {0}")]
    Trace(
        #[from]
        #[source]
        TraceError,
    ),
    #[error("Alignment invariant violated: {0}")]
    Alignment(
        #[from]
        #[source]
        AlignmentError,
    ),
    #[error("Invalid ion type: {0}")]
    IonType(
        #[from]
        #[source]
        IonTypeParseError,
    ),
    #[error("Failed to create the worker pool: {0}")]
    ThreadPool(
        #[from]
        #[source]
        rayon::ThreadPoolBuildError,
    ),
    #[error("Processing was cancelled")]
    Cancelled,
}

impl From<BuildError> for ProcessingError {
    fn from(value: BuildError) -> Self {
        match value {
            BuildError::Storage(e) => Self::Storage(e),
            BuildError::Trace(e) => Self::Trace(e),
        }
    }
}
