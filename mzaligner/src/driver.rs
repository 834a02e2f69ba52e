use std::io::{self, prelude::*};
use std::path::PathBuf;
use std::str::FromStr;
use std::thread;
use std::time::Instant;

use clap::Parser;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use mzdata::io::MassSpectrometryFormat;

use mzalign::{LCMSProcessing, ProcessingError, ProcessingParams};

use crate::reader::{read_run, LoadedRun};
use crate::time_range::TimeRange;
use crate::write::write_output;

/// Read from the working directory when present
pub const DEFAULT_CONFIG_FILE: &str = "mzaligner.toml";
pub const ENV_PREFIX: &str = "MZALIGNER_";

#[derive(Debug, Error)]
pub enum MZAlignerError {
    #[error("An IO error occurred: {0}")]
    IOError(
        #[source]
        #[from]
        io::Error,
    ),
    #[error("The input file {0} does not exist")]
    InputFileMissing(String),
    #[error("The input file format for {0} was either unknown or not supported ({1:?})")]
    FormatUnknownOrNotSupportedError(String, MassSpectrometryFormat),
    #[error("Failed to load the configuration: {0}")]
    ConfigurationError(
        #[source]
        #[from]
        figment::Error,
    ),
    #[error("Failed to render the configuration: {0}")]
    ConfigurationRenderError(
        #[source]
        #[from]
        toml::ser::Error,
    ),
    #[error("Failed to write JSON output: {0}")]
    JSONError(
        #[source]
        #[from]
        serde_json::Error,
    ),
    #[error("Failed to create the thread pool: {0}")]
    ThreadPoolError(
        #[source]
        #[from]
        rayon::ThreadPoolBuildError,
    ),
    #[error(transparent)]
    ProcessingError(#[from] ProcessingError),
    #[error("None of the input files contained usable MS/MS data")]
    NoUsableSamples,
}

/// Extract chromatographic features from LC-MS/MS runs and align them across samples.
///
/// Read one or more mzML or MGF files of centroided spectra and write a table of consensus
/// features, one row per compound, with the per-sample intensities.
#[derive(Parser, Debug, Deserialize, Serialize)]
#[command(author, version)]
#[serde(default)]
pub struct MZAligner {
    /// The paths to read the input spectra from
    #[arg(required_unless_present = "write_config")]
    pub input_files: Vec<PathBuf>,

    /// The path to write the consensus features to, or if '-' is passed, write to STDOUT.
    ///
    /// Paths ending in `.json` are written as JSON, otherwise a tab-separated table is
    /// written.
    #[arg(short = 'o', long = "output-file", default_value = "-")]
    pub output_file: PathBuf,

    /// The path to write a log file to, in addition to STDERR
    #[arg(short = 'l', long = "log-file")]
    pub log_file: Option<PathBuf>,

    /// A TOML configuration file to read processing parameters from.
    ///
    /// Configurations are also read from `mzaligner.toml` in the working directory.
    /// Environment variables prefixed with `MZALIGNER_` will be read too, with `__`
    /// separating nested keys.
    #[arg(long = "config-file")]
    pub config_file: Option<PathBuf>,

    /// The number of threads to use, passing a value < 1 to use the configured number or
    /// all available threads
    #[arg(
        short='t',
        long="threads",
        default_value_t=-1,
    )]
    pub threads: i32,

    /// The time range to read, in minutes, denoted (start?)-(stop?)
    #[arg(
        short='r',
        long="time-range",
        value_parser=TimeRange::from_str,
        value_name="BEGIN-END",
        long_help=r#"The time range to read, in minutes, denoted (start?)-(stop?)

If a start is not specified, reading begins from the start of each run.
If a stop is not specified, reading stops at the end of each run.
"#
    )]
    pub time_range: Option<TimeRange>,

    /// The seed of the random number generator used to assign adduct types
    #[arg(short = 's', long = "seed")]
    pub seed: Option<u64>,

    /// Print the effective processing configuration as TOML and exit
    #[arg(long = "write-config")]
    pub write_config: bool,

    #[arg(skip)]
    pub params: ProcessingParams,
}

impl Default for MZAligner {
    fn default() -> Self {
        Self {
            input_files: Vec::new(),
            output_file: PathBuf::from("-"),
            log_file: None,
            config_file: None,
            threads: -1,
            time_range: None,
            seed: None,
            write_config: false,
            params: ProcessingParams::default(),
        }
    }
}

impl MZAligner {
    /// Layer the processing parameters: the driver's own, then `mzaligner.toml`, then
    /// `--config-file`, then the environment
    pub fn configuration(&self) -> Figment {
        let mut config =
            Figment::from(Serialized::defaults(&self.params)).merge(Toml::file(DEFAULT_CONFIG_FILE));
        if let Some(path) = self.config_file.as_ref() {
            config = config.merge(Toml::file_exact(path));
        }
        config.merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// The configured parameters with command line overrides applied
    pub fn processing_params(&self) -> Result<ProcessingParams, MZAlignerError> {
        let mut params: ProcessingParams = self.configuration().extract()?;
        if self.threads > 0 {
            params.threads = self.threads as usize;
        }
        if let Some(seed) = self.seed {
            params.network.seed = seed;
        }
        Ok(params)
    }

    fn create_threadpool(&self, threads: usize) -> Result<rayon::ThreadPool, MZAlignerError> {
        let num_threads = if threads > 0 {
            threads
        } else {
            thread::available_parallelism()
                .map(usize::from)
                .unwrap_or(1)
        };
        debug!("Using {} cores", num_threads);
        Ok(rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .build()?)
    }

    fn read_inputs(&self, threads: usize) -> Result<Vec<LoadedRun>, MZAlignerError> {
        let time_range = self.time_range.unwrap_or_default();
        self.create_threadpool(threads)?.install(|| {
            self.input_files
                .par_iter()
                .map(|path| read_run(path, time_range))
                .collect()
        })
    }

    pub fn main(&self) -> Result<(), MZAlignerError> {
        let params = self.processing_params()?;
        if self.write_config {
            let rendered = toml::to_string_pretty(&params)?;
            io::stdout().write_all(rendered.as_bytes())?;
            return Ok(());
        }

        info!(
            "mzaligner v{}",
            option_env!("CARGO_PKG_VERSION").unwrap_or("unknown")
        );
        for path in self.input_files.iter() {
            info!("Input: {}", path.display());
        }
        info!("Output: {}", self.output_file.display());

        let start = Instant::now();
        let runs = self.read_inputs(params.threads)?;
        let mut processing = LCMSProcessing::new(params)?;
        for (path, (run, storage)) in self.input_files.iter().zip(runs) {
            match processing.add_sample(run, Box::new(storage)) {
                Ok(index) => debug!("{} is sample {index}", path.display()),
                Err(ProcessingError::InvalidInputData(message)) => {
                    warn!("Skipping {}: {message}", path.display())
                }
                Err(e) => return Err(e.into()),
            }
        }
        if processing.samples().is_empty() {
            return Err(MZAlignerError::NoUsableSamples);
        }

        let features = processing.process()?;
        if let Some(error) = processing.report().final_error() {
            info!("Final retention time error: {:0.1} ms", error);
        }
        let sample_names: Vec<String> = processing
            .samples()
            .iter()
            .map(|s| s.identifier().to_string())
            .collect();
        write_output(&self.output_file, &features, &sample_names)?;
        info!("Elapsed Time: {:0.3?}", start.elapsed());
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_arguments() {
        let args = MZAligner::parse_from([
            "mzaligner", "a.mzML", "b.mgf", "-o", "out.json", "-t", "3", "-s", "7", "-r", "5-20",
        ]);
        assert_eq!(args.input_files.len(), 2);
        assert_eq!(args.output_file, PathBuf::from("out.json"));
        assert_eq!(args.time_range, Some(TimeRange::new(5.0, 20.0)));

        let params = args.processing_params().unwrap();
        assert_eq!(params.threads, 3);
        assert_eq!(params.network.seed, 7);
    }

    #[test]
    fn test_write_config_needs_no_input() {
        let args = MZAligner::try_parse_from(["mzaligner", "--write-config"]).unwrap();
        assert!(args.write_config);
        assert!(args.input_files.is_empty());
        assert!(MZAligner::try_parse_from(["mzaligner"]).is_err());
    }
}
