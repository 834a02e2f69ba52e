mod common;

use mzalign::{LCMSProcessing, ProcessingError, ProcessingParams};

use common::{compounds, make_run, ISOTOPE_RATIO};

fn params() -> ProcessingParams {
    ProcessingParams {
        threads: 2,
        ..Default::default()
    }
}

#[test_log::test]
#[test_log(default_log_filter = "debug")]
fn test_offset_drift_is_recalibrated() -> Result<(), ProcessingError> {
    let compounds = compounds(50);
    let mut processing = LCMSProcessing::new(params())?;
    for (name, offset) in [("early", 0), ("late", 5000)] {
        let (run, storage) = make_run(name, &compounds, offset, true);
        processing.add_sample(run, Box::new(storage))?;
    }
    let features = processing.process()?;

    let report = processing.report();
    let coarse = report.get("coarse").unwrap().error;
    assert!((coarse - 5000.0).abs() < 1.0, "{coarse}");
    let round2 = report.get("round2").unwrap().error;
    let recalibrated = report.get("recalibration").unwrap().error;
    assert!(
        recalibrated < round2,
        "{recalibrated} should be below {round2}"
    );
    assert!(report.final_error().unwrap() < round2);

    assert_eq!(features.len(), compounds.len());
    for feature in features.iter() {
        assert_eq!(feature.sample_count(), 2);
        assert!(feature.has_msms());
        let early = feature.get(0).unwrap();
        let late = feature.get(1).unwrap();
        assert_eq!(late.apex_retention_time - early.apex_retention_time, 5000);
        assert!(
            (late.recalibrated_retention_time - early.recalibrated_retention_time).abs() < 1.0
        );
    }
    Ok(())
}

#[test_log::test]
fn test_isotope_pattern_reported() -> Result<(), ProcessingError> {
    let compounds = compounds(8);
    let mut processing = LCMSProcessing::new(params())?;
    for (name, offset) in [("a", 0), ("b", 1000)] {
        let (run, storage) = make_run(name, &compounds, offset, true);
        processing.add_sample(run, Box::new(storage))?;
    }
    let features = processing.process()?;
    assert!(!features.is_empty());
    for feature in features.iter() {
        let pattern = &feature.isotope_pattern;
        assert!(pattern.len() >= 2, "{pattern:?}");
        assert!((pattern[0].1 - 1.0).abs() < 1e-6);
        let ratio = pattern[1].1;
        assert!(
            (ratio - ISOTOPE_RATIO as f64).abs() < 0.02,
            "isotope ratio {ratio} for {}",
            feature.mz
        );
    }
    Ok(())
}

#[test_log::test]
fn test_ms1_only_run_rejected() -> Result<(), ProcessingError> {
    let compounds = compounds(4);
    let mut processing = LCMSProcessing::new(params())?;
    let (run, storage) = make_run("survey", &compounds, 0, false);
    let result = processing.add_sample(run, Box::new(storage));
    assert!(matches!(result, Err(ProcessingError::InvalidInputData(_))));
    assert!(processing.samples().is_empty());
    Ok(())
}

#[test_log::test]
fn test_repeated_runs_agree() -> Result<(), ProcessingError> {
    let compounds = compounds(10);
    let mut outputs = Vec::new();
    for _ in 0..2 {
        let mut processing = LCMSProcessing::new(params())?;
        for (name, offset) in [("a", 0), ("b", 2000), ("c", -1000)] {
            let (run, storage) = make_run(name, &compounds, offset + 2000, true);
            processing.add_sample(run, Box::new(storage))?;
        }
        let features = processing.process()?;
        let summary: Vec<(f64, usize, Option<String>)> = features
            .iter()
            .map(|f| {
                (
                    f.mz,
                    f.sample_count(),
                    f.ion_type.as_ref().map(|t| t.name().to_string()),
                )
            })
            .collect();
        outputs.push(summary);
    }
    assert_eq!(outputs[0], outputs[1]);
    assert_eq!(outputs[0].len(), compounds.len());
    Ok(())
}
