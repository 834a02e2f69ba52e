//! Small order statistics shared by the noise, segmentation and alignment stages.
use std::cmp::Ordering;

use num_traits::Float;

#[inline]
pub fn isclose<T: Float>(x: T, y: T, tol: T) -> bool {
    (x - y).abs() <= tol
}

fn sort_floats<T: Float>(values: &mut [T]) {
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
}

/// The value at rank `floor(n * q)` of the sorted values.
pub fn quantile<T: Float>(values: &mut [T], q: f64) -> Option<T> {
    if values.is_empty() {
        return None;
    }
    sort_floats(values);
    let i = ((values.len() as f64) * q).floor() as usize;
    Some(values[i.min(values.len() - 1)])
}

pub fn median<T: Float>(values: &mut [T]) -> Option<T> {
    if values.is_empty() {
        return None;
    }
    sort_floats(values);
    let n = values.len();
    if n % 2 == 1 {
        Some(values[n / 2])
    } else {
        let two = T::one() + T::one();
        Some((values[n / 2 - 1] + values[n / 2]) / two)
    }
}

/// The mean of the inter-quartile range, or the plain mean for fewer than four values.
pub fn robust_average(values: &mut [f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    sort_floats(values);
    let n = values.len();
    let (lo, hi) = if n < 4 { (0, n) } else { (n / 4, n - n / 4) };
    let window = &values[lo..hi];
    Some(window.iter().sum::<f64>() / window.len() as f64)
}

/// Pearson's correlation coefficient, zero when either side has no variance.
pub fn pearson(x: &[f64], y: &[f64]) -> f64 {
    let n = x.len().min(y.len());
    if n < 2 {
        return 0.0;
    }
    let mx = x[..n].iter().sum::<f64>() / n as f64;
    let my = y[..n].iter().sum::<f64>() / n as f64;
    let mut sxy = 0.0;
    let mut sxx = 0.0;
    let mut syy = 0.0;
    for (a, b) in x.iter().zip(y.iter()) {
        let dx = a - mx;
        let dy = b - my;
        sxy += dx * dy;
        sxx += dx * dx;
        syy += dy * dy;
    }
    if sxx <= 0.0 || syy <= 0.0 {
        return 0.0;
    }
    sxy / (sxx.sqrt() * syy.sqrt())
}
