//! Two-sided two-sample Kolmogorov-Smirnov test.

/// Largest `n * m` for which the p-value is computed exactly.
pub const EXACT_LIMIT: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KsResult {
    pub statistic: f64,
    pub p_value: f64,
}

/// Maximum distance between the two empirical CDFs.
pub fn ks_statistic(a: &[f64], b: &[f64]) -> f64 {
    let mut a: Vec<f64> = a.to_vec();
    let mut b: Vec<f64> = b.to_vec();
    a.sort_by(f64::total_cmp);
    b.sort_by(f64::total_cmp);
    let (n, m) = (a.len() as f64, b.len() as f64);

    let (mut i, mut j) = (0usize, 0usize);
    let mut d: f64 = 0.0;
    while i < a.len() && j < b.len() {
        let x = a[i].min(b[j]);
        while i < a.len() && a[i] <= x {
            i += 1;
        }
        while j < b.len() && b[j] <= x {
            j += 1;
        }
        d = d.max((i as f64 / n - j as f64 / m).abs());
    }
    d
}

/// `P(D >= d)` by counting lattice paths that stay strictly inside the band.
fn exact_p_value(d: f64, n: usize, m: usize) -> f64 {
    let (nf, mf) = (n as f64, m as f64);
    let inside = |i: usize, j: usize| (i as f64 / nf - j as f64 / mf).abs() + 1e-9 < d;

    // paths[j] holds paths to (i, j) divided by C(i + j, i), updated row by row
    let mut paths = vec![0.0f64; m + 1];
    paths[0] = 1.0;
    for j in 1..=m {
        paths[j] = if inside(0, j) { paths[j - 1] } else { 0.0 };
    }
    for i in 1..=n {
        paths[0] = if inside(i, 0) { paths[0] } else { 0.0 };
        for j in 1..=m {
            if inside(i, j) {
                let total = (i + j) as f64;
                paths[j] = paths[j] * (i as f64 / total) + paths[j - 1] * (j as f64 / total);
            } else {
                paths[j] = 0.0;
            }
        }
    }
    (1.0 - paths[m]).clamp(0.0, 1.0)
}

/// Kolmogorov limiting distribution `Q(λ) = 2 Σ (-1)^(k-1) exp(-2 k² λ²)`.
fn asymptotic_p_value(d: f64, n: usize, m: usize) -> f64 {
    let en = ((n * m) as f64 / (n + m) as f64).sqrt();
    let lambda = d * en;
    if lambda < 1e-3 {
        return 1.0;
    }
    let mut sum = 0.0;
    for k in 1..=100 {
        let k = k as f64;
        let term = (-2.0 * k * k * lambda * lambda).exp();
        sum += if k as u32 % 2 == 1 { term } else { -term };
        if term < 1e-12 {
            break;
        }
    }
    (2.0 * sum).clamp(0.0, 1.0)
}

/// `None` when either sample is empty.
pub fn ks_2samp(a: &[f64], b: &[f64]) -> Option<KsResult> {
    if a.is_empty() || b.is_empty() {
        return None;
    }
    let statistic = ks_statistic(a, b);
    let (n, m) = (a.len(), b.len());
    let p_value = if statistic == 0.0 {
        1.0
    } else if n * m <= EXACT_LIMIT {
        exact_p_value(statistic, n, m)
    } else {
        asymptotic_p_value(statistic, n, m)
    };
    Some(KsResult { statistic, p_value })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statistic_of_disjoint_and_equal_samples() {
        assert_eq!(ks_statistic(&[1.0, 2.0, 3.0], &[4.0, 5.0]), 1.0);
        assert_eq!(ks_statistic(&[1.0, 2.0], &[2.0, 1.0]), 0.0);
        assert!((ks_statistic(&[1.0, 2.0, 3.0, 4.0], &[3.0, 4.0, 5.0, 6.0]) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn exact_p_values_match_path_counting() {
        // fully separated samples of 3: only 2 of C(6,3) = 20 paths reach D = 1
        let r = ks_2samp(&[1.0, 2.0, 3.0], &[4.0, 5.0, 6.0]).unwrap();
        assert_eq!(r.statistic, 1.0);
        assert!((r.p_value - 0.1).abs() < 1e-12);

        let same = ks_2samp(&[0.1, 0.2, 0.3], &[0.3, 0.2, 0.1]).unwrap();
        assert_eq!(same.p_value, 1.0);
    }

    #[test]
    fn single_observations() {
        // one path of two reaches D = 1
        let r = ks_2samp(&[0.0], &[1.0]).unwrap();
        assert_eq!(r.statistic, 1.0);
        assert!((r.p_value - 1.0).abs() < 1e-12);
    }

    #[test]
    fn large_samples_use_the_limit_distribution() {
        // integer-valued samples keep the 100 shared values exactly tied
        let a: Vec<f64> = (0..200).map(f64::from).collect();
        let b: Vec<f64> = (100..300).map(f64::from).collect();
        let r = ks_2samp(&a, &b).unwrap();
        assert!((r.statistic - 0.5).abs() < 1e-12);
        assert!(r.p_value < 1e-10);

        let c: Vec<f64> = (0..200).map(|i| f64::from(i) + 0.5).collect();
        let close = ks_2samp(&a, &c).unwrap();
        assert!(close.p_value > 0.99);
    }

    #[test]
    fn empty_samples_have_no_result() {
        assert!(ks_2samp(&[], &[1.0]).is_none());
    }
}
