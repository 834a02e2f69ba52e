use std::fs;
use std::io::{self, prelude::*};
use std::path::Path;

use itertools::Itertools;
use tracing::info;

use mzalign::ConsensusFeature;

use crate::driver::MZAlignerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Tsv,
    Json,
}

impl OutputFormat {
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => Self::Json,
            _ => Self::Tsv,
        }
    }
}

fn format_isotopes(pattern: &[(f64, f64)]) -> String {
    pattern
        .iter()
        .map(|(mz, ratio)| format!("{mz:0.4}:{ratio:0.3}"))
        .join(";")
}

/// Write one line per consensus feature with an intensity column per sample
pub fn write_table<W: Write>(
    mut writer: W,
    features: &[ConsensusFeature],
    sample_names: &[String],
) -> io::Result<()> {
    let mut header = vec![
        "index",
        "mz",
        "retention_time",
        "intensity",
        "charge",
        "ion_type",
        "possible_ion_types",
        "sample_count",
        "isotope_pattern",
        "chimeric_pollution",
    ]
    .into_iter()
    .map(String::from)
    .collect_vec();
    header.extend(sample_names.iter().map(|name| format!("{name}_intensity")));
    writeln!(writer, "{}", header.join("\t"))?;

    for feature in features {
        let ion_type = feature
            .ion_type
            .as_ref()
            .map(|t| t.name().to_string())
            .unwrap_or_default();
        let possible = feature.possible_ion_types.iter().map(|t| t.name()).join(";");
        write!(
            writer,
            "{}\t{:0.5}\t{:0.4}\t{:0.1}\t{}\t{}\t{}\t{}\t{}\t{:0.3}",
            feature.index,
            feature.mz,
            feature.retention_time / 60_000.0,
            feature.intensity,
            feature.charge,
            ion_type,
            possible,
            feature.sample_count(),
            format_isotopes(&feature.isotope_pattern),
            feature.chimeric_pollution,
        )?;
        for i in 0..sample_names.len() {
            match feature.get(i) {
                Some(f) => write!(writer, "\t{:0.1}", f.intensity)?,
                None => write!(writer, "\t")?,
            }
        }
        writeln!(writer)?;
    }
    Ok(())
}

/// Write `features` to `path`, or to STDOUT as a table when `path` is `-`
pub fn write_output(
    path: &Path,
    features: &[ConsensusFeature],
    sample_names: &[String],
) -> Result<(), MZAlignerError> {
    if path == Path::new("-") {
        let stdout = io::stdout();
        write_table(stdout.lock(), features, sample_names)?;
        return Ok(());
    }
    let handle = io::BufWriter::new(fs::File::create(path)?);
    match OutputFormat::from_path(path) {
        OutputFormat::Json => {
            serde_json::to_writer_pretty(handle, features)?;
        }
        OutputFormat::Tsv => {
            write_table(handle, features, sample_names)?;
        }
    }
    info!("Wrote {} features to {}", features.len(), path.display());
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_output_format() {
        assert_eq!(OutputFormat::from_path(Path::new("out.json")), OutputFormat::Json);
        assert_eq!(OutputFormat::from_path(Path::new("out.JSON")), OutputFormat::Json);
        assert_eq!(OutputFormat::from_path(Path::new("out.tsv")), OutputFormat::Tsv);
        assert_eq!(OutputFormat::from_path(Path::new("out")), OutputFormat::Tsv);
    }

    #[test]
    fn test_empty_table() -> io::Result<()> {
        let mut buffer = Vec::new();
        write_table(&mut buffer, &[], &["a".to_string(), "b".to_string()])?;
        let text = String::from_utf8(buffer).unwrap();
        assert_eq!(text.lines().count(), 1);
        assert!(text
            .trim_end()
            .ends_with("isotope_pattern\tchimeric_pollution\ta_intensity\tb_intensity"));
        Ok(())
    }
}
