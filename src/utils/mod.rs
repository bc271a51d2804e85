//! Math utilities and array conversion helpers.

use ndarray::Array2;

use crate::core::{PnnError, PnnResult};

/// Logistic squashing function into (0, 1).
#[inline]
pub fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

/// Index of the largest entry in each row.
pub fn argmax_rows(x: &Array2<f64>) -> Vec<usize> {
    x.rows()
        .into_iter()
        .map(|row| {
            row.iter()
                .enumerate()
                .fold((0, f64::NEG_INFINITY), |(bi, bv), (i, &v)| {
                    if v > bv {
                        (i, v)
                    } else {
                        (bi, bv)
                    }
                })
                .0
        })
        .collect()
}

/// Convert an Array2 to `Vec<Vec<f64>>` for serialization.
pub fn array2_to_vecs(arr: &Array2<f64>) -> Vec<Vec<f64>> {
    arr.rows().into_iter().map(|row| row.to_vec()).collect()
}

/// Convert `Vec<Vec<f64>>` back to an Array2.
pub fn vecs_to_array2(vecs: &[Vec<f64>]) -> PnnResult<Array2<f64>> {
    if vecs.is_empty() {
        return Ok(Array2::zeros((0, 0)));
    }
    let nrows = vecs.len();
    let ncols = vecs[0].len();
    if vecs.iter().any(|r| r.len() != ncols) {
        return Err(PnnError::ShapeMismatch(
            "ragged rows in serialized matrix".to_string(),
        ));
    }
    let flat: Vec<f64> = vecs.iter().flat_map(|r| r.iter().copied()).collect();
    Array2::from_shape_vec((nrows, ncols), flat)
        .map_err(|e| PnnError::ShapeMismatch(format!("failed to reconstruct matrix: {e}")))
}

/// A `(1, n)` row matrix from a slice.
pub fn row(values: &[f64]) -> Array2<f64> {
    Array2::from_shape_fn((1, values.len()), |(_, j)| values[j])
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_sigmoid() {
        assert_eq!(sigmoid(0.0), 0.5);
        assert!(sigmoid(10.0) > 0.99);
        assert!(sigmoid(-10.0) < 0.01);
    }

    #[test]
    fn test_argmax_rows() {
        let x = array![[0.1, 0.9], [0.7, -0.2], [0.0, 0.0]];
        assert_eq!(argmax_rows(&x), vec![1, 0, 0]);
    }

    #[test]
    fn test_matrix_vec_round_trip() {
        let m = array![[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]];
        let back = vecs_to_array2(&array2_to_vecs(&m)).expect("rectangular");
        assert_eq!(back, m);
        assert!(vecs_to_array2(&[vec![1.0], vec![1.0, 2.0]]).is_err());
    }
}
