#![allow(dead_code)]
use mzalign::{InMemorySpectrumStorage, LCMSRun, Polarity, Precursor, Scan};
use mzpeaks::{CentroidPeak, PeakSet};

pub const NEUTRON: f64 = 1.0033548378;
pub const SCAN_INTERVAL: i64 = 500;
pub const ELUTION_WIDTH: f64 = 2000.0;
pub const ISOTOPE_RATIO: f32 = 0.3;

/// A compound eluting at `apex` milliseconds with a +1 isotope
#[derive(Debug, Clone, Copy)]
pub struct Compound {
    pub mz: f64,
    pub apex: i64,
    pub height: f64,
}

pub fn compounds(n: usize) -> Vec<Compound> {
    (0..n)
        .map(|k| Compound {
            mz: 150.0 + 13.37 * k as f64,
            apex: 20_000 + 3000 * k as i64,
            height: 1e5 * (1.0 + (k % 4) as f64 * 0.5),
        })
        .collect()
}

fn profile(c: &Compound, t: i64, offset: i64) -> Option<f64> {
    let dt = (t - c.apex - offset) as f64;
    if dt.abs() > 5.0 * ELUTION_WIDTH {
        return None;
    }
    Some(50.0 + c.height * (-dt * dt / (2.0 * ELUTION_WIDTH * ELUTION_WIDTH)).exp())
}

fn fragments(c: &Compound) -> Vec<CentroidPeak> {
    let intensities = [200.0f32, 500.0, 1000.0, 3000.0, 5000.0, 8000.0, 10000.0];
    let mut peaks: Vec<_> = intensities
        .iter()
        .enumerate()
        .map(|(i, v)| CentroidPeak::new(c.mz * (0.2 + 0.07 * i as f64), *v, 0))
        .collect();
    for j in 0..10 {
        peaks.push(CentroidPeak::new(20.0 + j as f64 * 0.77, 20.0 + j as f32, 0));
    }
    peaks
}

fn ms1_peaks(compounds: &[Compound], scan: usize, t: i64, offset: i64) -> Vec<CentroidPeak> {
    let mut peaks = Vec::new();
    for c in compounds {
        if let Some(intensity) = profile(c, t, offset) {
            peaks.push(CentroidPeak::new(c.mz, intensity as f32, 0));
            peaks.push(CentroidPeak::new(
                c.mz + NEUTRON,
                intensity as f32 * ISOTOPE_RATIO,
                0,
            ));
        }
    }
    let reserved: Vec<f64> = compounds
        .iter()
        .flat_map(|c| [c.mz, c.mz + NEUTRON, c.mz - NEUTRON])
        .collect();
    let top = compounds.iter().map(|c| c.mz).fold(0.0, f64::max);
    let last_bin = (top / 100.0) as usize + 1;
    for bin in 1..=last_bin {
        for j in 0..10 {
            let mz = bin as f64 * 100.0 + 3.3 + j as f64 * 9.7 + (scan % 5) as f64 * 0.11;
            if reserved.iter().any(|r| (r - mz).abs() < 0.05) {
                continue;
            }
            let intensity = 20.0 + ((scan * 7 + j * 13) % 20) as f32;
            peaks.push(CentroidPeak::new(mz, intensity, 0));
        }
    }
    peaks
}

/// Build a run over `compounds`, shifted by `offset` milliseconds, with two fragmentation
/// scans per compound around its apex unless `with_msms` is false.
pub fn make_run(
    name: &str,
    compounds: &[Compound],
    offset: i64,
    with_msms: bool,
) -> (LCMSRun, InMemorySpectrumStorage) {
    let end = compounds.iter().map(|c| c.apex).max().unwrap_or_default() + offset + 25_000;
    let mut events: Vec<(i64, Option<&Compound>)> = (0..=(end / SCAN_INTERVAL))
        .map(|i| (i * SCAN_INTERVAL, None))
        .collect();
    if with_msms {
        for c in compounds {
            events.push((c.apex + offset + 250, Some(c)));
            events.push((c.apex + offset + 1250, Some(c)));
        }
    }
    events.sort_by_key(|(t, _)| *t);

    let mut storage = InMemorySpectrumStorage::new();
    let mut scans = Vec::with_capacity(events.len());
    for (index, (t, event)) in events.into_iter().enumerate() {
        let (scan, peaks) = match event {
            None => {
                let peaks = PeakSet::new(ms1_peaks(compounds, index, t, offset));
                (Scan::new(index, t, Polarity::Positive).with_peaks(&peaks), peaks)
            }
            Some(c) => {
                let peaks = PeakSet::new(fragments(c));
                let scan = Scan::new(index, t, Polarity::Positive)
                    .with_precursor(Precursor::new(c.mz, c.height as f32, 1), 25.0)
                    .with_peaks(&peaks);
                (scan, peaks)
            }
        };
        storage.insert(index, peaks);
        scans.push(scan);
    }
    (LCMSRun::new(name, scans).unwrap(), storage)
}
