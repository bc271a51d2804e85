//! Dataset loading, normalization, splitting and batching.
//!
//! ## Submodules
//!
//! - [`synthetic`]: Seeded toy datasets for tests and smoke runs

pub mod synthetic;

use ndarray::{Array2, ArrayViewMut1, Axis};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::path::Path;

use crate::core::{PnnError, PnnResult};

/// Inputs and labels of one mini-batch.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    /// `(batch, n_features)`
    pub inputs: Array2<f64>,
    pub labels: Vec<usize>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// Anything that yields batches in a stable order.
pub trait DataSource {
    fn batches(&self) -> Box<dyn Iterator<Item = Batch> + '_>;

    /// Total number of samples over all batches.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A labelled classification dataset.
#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    inputs: Array2<f64>,
    labels: Vec<usize>,
    n_classes: usize,
}

/// Disjoint train/valid/test partitions of a dataset.
#[derive(Debug, Clone)]
pub struct Split {
    pub train: Dataset,
    pub valid: Dataset,
    pub test: Dataset,
}

impl Dataset {
    /// Create a dataset; the class count is `max(label) + 1`.
    pub fn new(inputs: Array2<f64>, labels: Vec<usize>) -> PnnResult<Self> {
        let n_classes = labels.iter().max().map_or(0, |&m| m + 1);
        Self::with_classes(inputs, labels, n_classes)
    }

    /// Create a dataset with an explicit class count.
    pub fn with_classes(inputs: Array2<f64>, labels: Vec<usize>, n_classes: usize) -> PnnResult<Self> {
        if inputs.nrows() != labels.len() {
            return Err(PnnError::ShapeMismatch(format!(
                "{} input rows but {} labels",
                inputs.nrows(),
                labels.len()
            )));
        }
        if let Some(&bad) = labels.iter().find(|&&l| l >= n_classes) {
            return Err(PnnError::Data(format!(
                "label {bad} out of range for {n_classes} classes"
            )));
        }
        Ok(Self {
            inputs,
            labels,
            n_classes,
        })
    }

    /// Load a headerless CSV file: feature columns first, class label last.
    pub fn from_csv(path: &Path) -> PnnResult<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .trim(csv::Trim::All)
            .from_path(path)?;

        let mut flat = Vec::new();
        let mut labels = Vec::new();
        let mut width = None;
        for (line, record) in reader.records().enumerate() {
            let record = record?;
            if record.len() < 2 {
                return Err(PnnError::Data(format!(
                    "{}: row {} needs at least one feature and a label",
                    path.display(),
                    line + 1
                )));
            }
            let n_features = record.len() - 1;
            let expected = *width.get_or_insert(n_features);
            if expected != n_features {
                return Err(PnnError::Data(format!(
                    "{}: row {} has {n_features} features, expected {expected}",
                    path.display(),
                    line + 1
                )));
            }
            for field in record.iter().take(n_features) {
                flat.push(parse_field(field, path, line)?);
            }
            labels.push(parse_label(&record[n_features], path, line)?);
        }

        let width = width.unwrap_or(0);
        let inputs = Array2::from_shape_vec((labels.len(), width), flat)
            .map_err(|e| PnnError::ShapeMismatch(e.to_string()))?;
        Self::new(inputs, labels)
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn n_features(&self) -> usize {
        self.inputs.ncols()
    }

    pub fn n_classes(&self) -> usize {
        self.n_classes
    }

    pub fn inputs(&self) -> &Array2<f64> {
        &self.inputs
    }

    pub fn labels(&self) -> &[usize] {
        &self.labels
    }

    /// Rescale every feature column to `[0, 1]`. Constant columns become 0.
    pub fn normalize(&mut self) {
        for column in self.inputs.axis_iter_mut(Axis(1)) {
            normalize(column, 0.0, 1.0);
        }
    }

    /// The rows at `indices`, keeping the class count.
    pub fn subset(&self, indices: &[usize]) -> Dataset {
        Dataset {
            inputs: self.inputs.select(Axis(0), indices),
            labels: indices.iter().map(|&i| self.labels[i]).collect(),
            n_classes: self.n_classes,
        }
    }

    /// Shuffle with `seed` and cut into train/valid/test by the given fractions.
    /// The test split receives the remainder.
    pub fn split(&self, train_fraction: f64, valid_fraction: f64, seed: u64) -> PnnResult<Split> {
        if train_fraction <= 0.0 || valid_fraction < 0.0 || train_fraction + valid_fraction > 1.0 {
            return Err(PnnError::InvalidConfig(format!(
                "invalid split fractions {train_fraction} / {valid_fraction}"
            )));
        }
        let mut indices: Vec<usize> = (0..self.len()).collect();
        indices.shuffle(&mut StdRng::seed_from_u64(seed));

        let n_train = (self.len() as f64 * train_fraction).round() as usize;
        let n_valid = ((self.len() as f64 * valid_fraction).round() as usize).min(self.len() - n_train);
        let (train, rest) = indices.split_at(n_train);
        let (valid, test) = rest.split_at(n_valid);
        Ok(Split {
            train: self.subset(train),
            valid: self.subset(valid),
            test: self.subset(test),
        })
    }

    /// Batches of `batch_size` rows in dataset order; 0 yields one full batch.
    pub fn loader(&self, batch_size: usize) -> DataLoader<'_> {
        DataLoader {
            dataset: self,
            batch_size,
        }
    }
}

/// Sequential mini-batch view over a [`Dataset`].
#[derive(Debug, Clone, Copy)]
pub struct DataLoader<'a> {
    dataset: &'a Dataset,
    batch_size: usize,
}

impl DataSource for DataLoader<'_> {
    fn batches(&self) -> Box<dyn Iterator<Item = Batch> + '_> {
        let n = self.dataset.len();
        let size = if self.batch_size == 0 { n.max(1) } else { self.batch_size };
        Box::new((0..n).step_by(size).map(move |start| {
            let end = (start + size).min(n);
            Batch {
                inputs: self.dataset.inputs.slice(ndarray::s![start..end, ..]).to_owned(),
                labels: self.dataset.labels[start..end].to_vec(),
            }
        }))
    }

    fn len(&self) -> usize {
        self.dataset.len()
    }
}

/// Rescale values linearly onto `[min, max]`. Constant data maps to `min`.
pub fn normalize(mut data: ArrayViewMut1<'_, f64>, min: f64, max: f64) {
    let data_min = data.iter().fold(f64::INFINITY, |a, &b| a.min(b));
    let data_max = data.iter().fold(f64::NEG_INFINITY, |a, &b| a.max(b));
    let range = data_max - data_min;

    if !range.is_finite() || range == 0.0 {
        data.fill(min);
        return;
    }

    for v in data.iter_mut() {
        *v = min + ((*v - data_min) / range) * (max - min);
    }
}

fn parse_field(field: &str, path: &Path, line: usize) -> PnnResult<f64> {
    field.parse::<f64>().map_err(|e| {
        PnnError::Data(format!(
            "{}: row {}: bad feature {field:?}: {e}",
            path.display(),
            line + 1
        ))
    })
}

fn parse_label(field: &str, path: &Path, line: usize) -> PnnResult<usize> {
    let value = parse_field(field, path, line)?;
    if value < 0.0 || value.fract() != 0.0 {
        return Err(PnnError::Data(format!(
            "{}: row {}: label {field:?} is not a class index",
            path.display(),
            line + 1
        )));
    }
    Ok(value as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use std::io::Write;

    #[test]
    fn test_normalize() {
        let mut data = array![0.0, 1.0, 2.0, 3.0, 4.0];
        normalize(data.view_mut(), -1.0, 1.0);

        assert!((data[0] - (-1.0)).abs() < 1e-12);
        assert!((data[4] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_dataset_normalize_handles_constant_column() {
        let mut ds = Dataset::new(array![[1.0, 5.0], [3.0, 5.0], [2.0, 5.0]], vec![0, 1, 0]).expect("ds");
        ds.normalize();
        assert_eq!(ds.inputs().column(0).to_vec(), vec![0.0, 1.0, 0.5]);
        assert_eq!(ds.inputs().column(1).to_vec(), vec![0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_csv_loading() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(file, "0.5, 1.0, 0").expect("write");
        writeln!(file, "0.25,2.0,2").expect("write");
        let ds = Dataset::from_csv(file.path()).expect("load");
        assert_eq!(ds.len(), 2);
        assert_eq!(ds.n_features(), 2);
        assert_eq!(ds.n_classes(), 3);
        assert_eq!(ds.labels(), &[0, 2]);
    }

    #[test]
    fn test_csv_rejects_fractional_label() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(file, "0.5,1.0,0.5").expect("write");
        assert!(matches!(Dataset::from_csv(file.path()), Err(PnnError::Data(_))));
    }

    #[test]
    fn test_split_is_disjoint_and_seeded() {
        let inputs = Array2::from_shape_fn((10, 1), |(i, _)| i as f64);
        let ds = Dataset::new(inputs, (0..10).map(|i| i % 2).collect()).expect("ds");
        let a = ds.split(0.6, 0.2, 4).expect("split");
        let b = ds.split(0.6, 0.2, 4).expect("split");
        assert_eq!((a.train.len(), a.valid.len(), a.test.len()), (6, 2, 2));
        assert_eq!(a.train.inputs(), b.train.inputs());

        let mut seen: Vec<f64> = [&a.train, &a.valid, &a.test]
            .iter()
            .flat_map(|d| d.inputs().iter().copied().collect::<Vec<_>>())
            .collect();
        seen.sort_by(|x, y| x.total_cmp(y));
        assert_eq!(seen, (0..10).map(|i| i as f64).collect::<Vec<_>>());
    }

    #[test]
    fn test_loader_batches_cover_dataset_in_order() {
        let inputs = Array2::from_shape_fn((5, 2), |(i, j)| (i * 2 + j) as f64);
        let ds = Dataset::new(inputs, vec![0, 1, 0, 1, 1]).expect("ds");
        let sizes: Vec<usize> = ds.loader(2).batches().map(|b| b.len()).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
        let full: Vec<Batch> = ds.loader(0).batches().collect();
        assert_eq!(full.len(), 1);
        assert_eq!(full[0].labels, ds.labels());
    }
}
