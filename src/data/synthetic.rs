//! Seeded synthetic datasets.

use ndarray::Array2;
use rand::distributions::{Distribution, Uniform};
use rand::rngs::StdRng;
use rand::SeedableRng;

use super::Dataset;
use crate::core::{PnnError, PnnResult};

/// Two-class points in the unit square separated by the line `x₀ + x₁ = 1`.
///
/// Points closer than `margin` to the line are redrawn, so the classes are
/// separable with a gap. Points above the line are class 1.
pub fn linearly_separable(n: usize, margin: f64, seed: u64) -> PnnResult<Dataset> {
    if !(0.0..0.5).contains(&margin) {
        return Err(PnnError::InvalidConfig(format!(
            "margin must lie in [0, 0.5), got {margin}"
        )));
    }
    let mut rng = StdRng::seed_from_u64(seed);
    let unit = Uniform::new(0.0, 1.0);

    let mut inputs = Array2::zeros((n, 2));
    let mut labels = Vec::with_capacity(n);
    for i in 0..n {
        let (x0, x1) = loop {
            let x0: f64 = unit.sample(&mut rng);
            let x1: f64 = unit.sample(&mut rng);
            if (x0 + x1 - 1.0).abs() >= margin {
                break (x0, x1);
            }
        };
        inputs[[i, 0]] = x0;
        inputs[[i, 1]] = x1;
        labels.push(usize::from(x0 + x1 > 1.0));
    }
    Dataset::with_classes(inputs, labels, 2)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_points_respect_margin() {
        let ds = linearly_separable(200, 0.1, 1).expect("dataset");
        assert_eq!(ds.len(), 200);
        assert_eq!(ds.n_classes(), 2);
        for (row, &label) in ds.inputs().rows().into_iter().zip(ds.labels()) {
            let s = row[0] + row[1] - 1.0;
            assert!(s.abs() >= 0.1);
            assert_eq!(label == 1, s > 0.0);
        }
    }

    #[test]
    fn test_same_seed_same_data() {
        let a = linearly_separable(20, 0.05, 9).expect("dataset");
        let b = linearly_separable(20, 0.05, 9).expect("dataset");
        assert_eq!(a, b);
    }

    #[test]
    fn test_bad_margin_is_rejected() {
        assert!(linearly_separable(10, 0.7, 0).is_err());
    }
}
