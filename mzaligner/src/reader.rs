use std::fs;
use std::io;
use std::path::Path;

use mzdata::io::{
    infer_format,
    mgf::MGFReaderType,
    mzml::MzMLReaderType,
    MassSpectrometryFormat, RestartableGzDecoder, StreamingSpectrumIterator,
};
use mzdata::prelude::*;
use mzdata::spectrum::{ScanPolarity, SignalContinuity};
use mzpeaks::PeakSet;
use tracing::{debug, info, warn};

use mzalign::scan::IsolationWindow;
use mzalign::{InMemorySpectrumStorage, LCMSRun, Polarity, Precursor, Scan};

use crate::driver::MZAlignerError;
use crate::time_range::TimeRange;
use crate::types::{CPeak, DPeak, SpectrumType};

/// The scans of one input file and their centroided peak lists
pub type LoadedRun = (LCMSRun, InMemorySpectrumStorage);

fn convert_polarity(polarity: ScanPolarity) -> Polarity {
    match polarity {
        ScanPolarity::Positive => Polarity::Positive,
        ScanPolarity::Negative => Polarity::Negative,
        _ => Polarity::Unknown,
    }
}

fn convert_precursor(spectrum: &SpectrumType) -> Option<(Precursor, f64)> {
    let prec = spectrum.precursor()?;
    let mz = prec.mz();
    let mut precursor = Precursor::new(mz, prec.ion().intensity, prec.charge().unwrap_or_default());
    let window = &prec.isolation_window;
    let (lower, upper) = (window.lower_bound as f64, window.upper_bound as f64);
    if lower > 0.0 && upper > lower && lower <= mz && mz <= upper {
        precursor = precursor.with_isolation_window(IsolationWindow::new(mz - lower, upper - mz));
    }
    Some((precursor, prec.activation.energy as f64))
}

/// Convert a stream of spectra into a run, keeping MS1 and MS2 spectra inside `time_range`.
///
/// Profile spectra are kept as scans but flagged as not centroided.
pub fn collect_run<I: Iterator<Item = SpectrumType>>(
    identifier: &str,
    spectra: I,
    time_range: TimeRange,
) -> Result<LoadedRun, MZAlignerError> {
    let mut scans = Vec::new();
    let mut storage = InMemorySpectrumStorage::new();
    for (index, mut spectrum) in spectra.enumerate() {
        let time = spectrum.start_time();
        if time < time_range.start {
            continue;
        }
        if time > time_range.end {
            break;
        }
        let ms_level = spectrum.ms_level();
        if !(1..=2).contains(&ms_level) {
            continue;
        }
        let retention_time = (time * 60_000.0).round() as i64;
        let mut scan = Scan::new(index, retention_time, convert_polarity(spectrum.polarity()));
        if ms_level == 2 {
            let Some((precursor, collision_energy)) = convert_precursor(&spectrum) else {
                warn!("{} has no precursor, skipping it", spectrum.id());
                continue;
            };
            scan = scan.with_precursor(precursor, collision_energy);
        }
        let peaks = match spectrum.signal_continuity() {
            SignalContinuity::Profile => None,
            _ => spectrum.try_build_centroids().ok().cloned(),
        };
        match peaks {
            Some(peaks) => {
                scan = scan.with_peaks(&peaks);
                storage.insert(index, peaks);
            }
            None => {
                debug!("{} is not centroided", spectrum.id());
                scan.centroided = false;
                storage.insert(index, PeakSet::default());
            }
        }
        scans.push(scan);
    }
    let run = LCMSRun::new(identifier, scans)?;
    Ok((run, storage))
}

/// Read an mzML or MGF file, optionally gzip compressed
pub fn read_run(path: &Path, time_range: TimeRange) -> Result<LoadedRun, MZAlignerError> {
    if !path.exists() {
        return Err(MZAlignerError::InputFileMissing(path.display().to_string()));
    }
    let identifier = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string());
    let (ms_format, compressed) = infer_format(path)?;
    debug!("Detected {ms_format:?} from {} (compressed? {compressed})", path.display());
    let loaded = match ms_format {
        MassSpectrometryFormat::MGF => {
            if compressed {
                let fh = RestartableGzDecoder::new(io::BufReader::new(fs::File::open(path)?));
                let reader = StreamingSpectrumIterator::new(
                    MGFReaderType::<_, CPeak, DPeak>::new(fh),
                );
                collect_run(&identifier, reader, time_range)?
            } else {
                let reader = MGFReaderType::<_, CPeak, DPeak>::open_path(path)?;
                collect_run(&identifier, reader, time_range)?
            }
        }
        MassSpectrometryFormat::MzML => {
            if compressed {
                let fh = RestartableGzDecoder::new(io::BufReader::new(fs::File::open(path)?));
                let reader = StreamingSpectrumIterator::new(
                    MzMLReaderType::<_, CPeak, DPeak>::new(fh),
                );
                collect_run(&identifier, reader, time_range)?
            } else {
                let reader = MzMLReaderType::<_, CPeak, DPeak>::open_path(path)?;
                collect_run(&identifier, reader, time_range)?
            }
        }
        _ => {
            return Err(MZAlignerError::FormatUnknownOrNotSupportedError(
                path.display().to_string(),
                ms_format,
            ))
        }
    };
    info!(
        "Read {} scans ({} MS/MS) from {}",
        loaded.0.len(),
        loaded.0.msms_scans().count(),
        path.display()
    );
    Ok(loaded)
}
