//! Reverse-mode automatic differentiation over `Array2<f64>`.
//!
//! Every forward computation is recorded on a [`Tape`] as a linear list of
//! nodes. [`Tape::backward`] replays the list in reverse and accumulates the
//! vector-Jacobian products into per-node gradients.
//!
//! Scalars are 1×1 arrays. Binary element-wise operations broadcast a
//! `(1, n)`, `(m, 1)` or `(1, 1)` operand against the other one, and their
//! backward pass sums the gradient back down to the operand's shape.
//!
//! Trainable state lives in [`Parameter`] handles. A parameter is registered
//! on a tape at most once, so a handle shared by several layers collects the
//! gradient of every use in one place.

use ndarray::{s, Array2, Axis};
use std::cell::{Ref, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use crate::core::{PnnError, PnnResult};

/// A named, shared, mutable tensor optimised by gradient descent.
///
/// Cloning the handle aliases the same storage: every clone observes updates
/// made through any other clone.
#[derive(Clone)]
pub struct Parameter {
    inner: Rc<ParameterInner>,
}

struct ParameterInner {
    name: String,
    value: RefCell<Array2<f64>>,
}

impl Parameter {
    pub fn new(name: impl Into<String>, value: Array2<f64>) -> Self {
        Self {
            inner: Rc::new(ParameterInner {
                name: name.into(),
                value: RefCell::new(value),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Borrow the current value.
    pub fn value(&self) -> Ref<'_, Array2<f64>> {
        self.inner.value.borrow()
    }

    pub fn shape(&self) -> (usize, usize) {
        self.inner.value.borrow().dim()
    }

    /// Replace the value. The new value must keep the parameter's shape.
    pub fn set(&self, value: Array2<f64>) -> PnnResult<()> {
        let expected = self.shape();
        if value.dim() != expected {
            return Err(PnnError::ShapeMismatch(format!(
                "parameter {} expects {:?}, got {:?}",
                self.name(),
                expected,
                value.dim()
            )));
        }
        *self.inner.value.borrow_mut() = value;
        Ok(())
    }

    /// Mutate the value in place.
    pub fn update<F: FnOnce(&mut Array2<f64>)>(&self, f: F) {
        f(&mut self.inner.value.borrow_mut());
    }

    /// True when both handles point at the same storage.
    pub fn ptr_eq(&self, other: &Parameter) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Identity of the shared storage. Stable while any handle is alive.
    fn key(&self) -> usize {
        Rc::as_ptr(&self.inner) as usize
    }
}

impl fmt::Debug for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Parameter")
            .field("name", &self.inner.name)
            .field("shape", &self.shape())
            .finish()
    }
}

/// Handle to a node on a [`Tape`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Var(usize);

/// A recorded operation. Inputs are earlier nodes on the same tape.
#[derive(Debug, Clone)]
enum Op {
    Leaf,
    Add(Var, Var),
    Sub(Var, Var),
    Mul(Var, Var),
    Div(Var, Var),
    Scale(Var, f64),
    AddScalar(Var),
    MatMul(Var, Var),
    Transpose(Var),
    Tanh(Var),
    Sigmoid(Var),
    Abs(Var),
    Relu(Var),
    Square(Var),
    /// Column sums, output `(1, n)`.
    SumCols(Var),
    /// Row sums, output `(m, 1)`.
    SumRows(Var),
    /// Column extrema, output `(1, n)`; holds the selected row per column.
    ExtremumCols(Var, Vec<usize>),
    /// Row maxima, output `(m, 1)`; holds the selected column per row.
    MaxRows(Var, Vec<usize>),
    Sum(Var),
    Mean(Var),
    SliceRows(Var, usize),
    Column(Var, usize),
    ConcatCols(Vec<Var>),
    /// Mean softmax cross-entropy; holds the softmax probabilities.
    CrossEntropy(Var, Array2<f64>, Vec<usize>),
    /// Forward value is a detached hard value; the gradient goes to the soft input.
    StraightThrough(Var),
}

#[derive(Debug)]
struct Node {
    value: Array2<f64>,
    op: Op,
}

/// Wengert tape recording one forward computation.
#[derive(Debug, Default)]
pub struct Tape {
    nodes: Vec<Node>,
    /// Keyed by storage, so equally named parameters stay distinct.
    params: HashMap<usize, (Var, Parameter)>,
    detached: bool,
}

impl Tape {
    /// A tape that records the graph for [`Tape::backward`].
    pub fn new() -> Self {
        Self::default()
    }

    /// A tape that only computes values. Used for evaluation passes.
    pub fn detached() -> Self {
        Self {
            detached: true,
            ..Self::default()
        }
    }

    pub fn is_detached(&self) -> bool {
        self.detached
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn push(&mut self, value: Array2<f64>, op: Op) -> Var {
        let op = if self.detached { Op::Leaf } else { op };
        self.nodes.push(Node { value, op });
        Var(self.nodes.len() - 1)
    }

    pub fn value(&self, v: Var) -> &Array2<f64> {
        &self.nodes[v.0].value
    }

    /// Value of a 1×1 node.
    pub fn scalar(&self, v: Var) -> f64 {
        self.nodes[v.0].value[[0, 0]]
    }

    pub fn shape(&self, v: Var) -> (usize, usize) {
        self.nodes[v.0].value.dim()
    }

    /// A constant input; gradients are computed but never reported.
    pub fn constant(&mut self, value: Array2<f64>) -> Var {
        self.push(value, Op::Leaf)
    }

    pub fn scalar_constant(&mut self, value: f64) -> Var {
        self.constant(Array2::from_elem((1, 1), value))
    }

    /// Register a parameter, snapshotting its current value.
    ///
    /// Repeated registration of the same handle (or a clone of it) returns
    /// the first node.
    pub fn param(&mut self, p: &Parameter) -> Var {
        if let Some((v, _)) = self.params.get(&p.key()) {
            return *v;
        }
        let v = self.push(p.value().clone(), Op::Leaf);
        self.params.insert(p.key(), (v, p.clone()));
        v
    }

    pub fn add(&mut self, a: Var, b: Var) -> Var {
        let value = self.value(a) + self.value(b);
        self.push(value, Op::Add(a, b))
    }

    pub fn sub(&mut self, a: Var, b: Var) -> Var {
        let value = self.value(a) - self.value(b);
        self.push(value, Op::Sub(a, b))
    }

    pub fn mul(&mut self, a: Var, b: Var) -> Var {
        let value = self.value(a) * self.value(b);
        self.push(value, Op::Mul(a, b))
    }

    pub fn div(&mut self, a: Var, b: Var) -> Var {
        let value = self.value(a) / self.value(b);
        self.push(value, Op::Div(a, b))
    }

    pub fn scale(&mut self, a: Var, k: f64) -> Var {
        let value = self.value(a) * k;
        self.push(value, Op::Scale(a, k))
    }

    pub fn neg(&mut self, a: Var) -> Var {
        self.scale(a, -1.0)
    }

    pub fn add_scalar(&mut self, a: Var, k: f64) -> Var {
        let value = self.value(a) + k;
        self.push(value, Op::AddScalar(a))
    }

    pub fn matmul(&mut self, a: Var, b: Var) -> Var {
        let value = self.value(a).dot(self.value(b));
        self.push(value, Op::MatMul(a, b))
    }

    pub fn transpose(&mut self, a: Var) -> Var {
        let value = self.value(a).t().to_owned();
        self.push(value, Op::Transpose(a))
    }

    pub fn tanh(&mut self, a: Var) -> Var {
        let value = self.value(a).mapv(f64::tanh);
        self.push(value, Op::Tanh(a))
    }

    pub fn sigmoid(&mut self, a: Var) -> Var {
        let value = self.value(a).mapv(crate::utils::sigmoid);
        self.push(value, Op::Sigmoid(a))
    }

    /// Element-wise `|a|`. Zero is differentiated as a non-negative value.
    pub fn abs(&mut self, a: Var) -> Var {
        let value = self.value(a).mapv(f64::abs);
        self.push(value, Op::Abs(a))
    }

    pub fn relu(&mut self, a: Var) -> Var {
        let value = self.value(a).mapv(|x| x.max(0.0));
        self.push(value, Op::Relu(a))
    }

    pub fn square(&mut self, a: Var) -> Var {
        let value = self.value(a).mapv(|x| x * x);
        self.push(value, Op::Square(a))
    }

    pub fn sum_cols(&mut self, a: Var) -> Var {
        let value = self.value(a).sum_axis(Axis(0)).insert_axis(Axis(0));
        self.push(value, Op::SumCols(a))
    }

    pub fn sum_rows(&mut self, a: Var) -> Var {
        let value = self.value(a).sum_axis(Axis(1)).insert_axis(Axis(1));
        self.push(value, Op::SumRows(a))
    }

    /// Column-wise maximum, `(m, n) -> (1, n)`.
    pub fn max_cols(&mut self, a: Var) -> Var {
        self.extremum_cols(a, |candidate, best| candidate > best)
    }

    /// Column-wise minimum, `(m, n) -> (1, n)`.
    pub fn min_cols(&mut self, a: Var) -> Var {
        self.extremum_cols(a, |candidate, best| candidate < best)
    }

    fn extremum_cols(&mut self, a: Var, better: fn(f64, f64) -> bool) -> Var {
        let x = self.value(a);
        let (rows, cols) = x.dim();
        let mut arg = vec![0usize; cols];
        let mut value = Array2::zeros((1, cols));
        for j in 0..cols {
            let mut best = 0;
            for i in 1..rows {
                if better(x[[i, j]], x[[best, j]]) {
                    best = i;
                }
            }
            arg[j] = best;
            value[[0, j]] = if rows > 0 { x[[best, j]] } else { 0.0 };
        }
        self.push(value, Op::ExtremumCols(a, arg))
    }

    /// Row-wise maximum, `(m, n) -> (m, 1)`.
    pub fn max_rows(&mut self, a: Var) -> Var {
        let x = self.value(a);
        let (rows, cols) = x.dim();
        let mut arg = vec![0usize; rows];
        let mut value = Array2::zeros((rows, 1));
        for i in 0..rows {
            let mut best = 0;
            for j in 1..cols {
                if x[[i, j]] > x[[i, best]] {
                    best = j;
                }
            }
            arg[i] = best;
            value[[i, 0]] = if cols > 0 { x[[i, best]] } else { 0.0 };
        }
        self.push(value, Op::MaxRows(a, arg))
    }

    pub fn sum(&mut self, a: Var) -> Var {
        let value = Array2::from_elem((1, 1), self.value(a).sum());
        self.push(value, Op::Sum(a))
    }

    pub fn mean(&mut self, a: Var) -> Var {
        let x = self.value(a);
        let n = x.len().max(1) as f64;
        let value = Array2::from_elem((1, 1), x.sum() / n);
        self.push(value, Op::Mean(a))
    }

    /// Rows `start..end`.
    pub fn slice_rows(&mut self, a: Var, start: usize, end: usize) -> Var {
        let value = self.value(a).slice(s![start..end, ..]).to_owned();
        self.push(value, Op::SliceRows(a, start))
    }

    /// Column `k` as an `(m, 1)` node.
    pub fn column(&mut self, a: Var, k: usize) -> Var {
        let value = self.value(a).slice(s![.., k..k + 1]).to_owned();
        self.push(value, Op::Column(a, k))
    }

    /// Horizontal concatenation; all parts must share the row count.
    pub fn concat_cols(&mut self, parts: &[Var]) -> PnnResult<Var> {
        let value = {
            let views: Vec<_> = parts.iter().map(|v| self.value(*v).view()).collect();
            ndarray::concatenate(Axis(1), &views)
                .map_err(|e| PnnError::ShapeMismatch(format!("column concatenation: {e}")))?
        };
        Ok(self.push(value, Op::ConcatCols(parts.to_vec())))
    }

    /// Mean softmax cross-entropy of `logits` (batch, classes) against class indices.
    pub fn cross_entropy(&mut self, logits: Var, labels: &[usize]) -> PnnResult<Var> {
        let x = self.value(logits);
        let (rows, cols) = x.dim();
        if rows != labels.len() {
            return Err(PnnError::ShapeMismatch(format!(
                "{} logits rows for {} labels",
                rows,
                labels.len()
            )));
        }
        if let Some(bad) = labels.iter().find(|&&y| y >= cols) {
            return Err(PnnError::ShapeMismatch(format!(
                "label {bad} out of range for {cols} classes"
            )));
        }
        let mut probs = Array2::zeros((rows, cols));
        let mut total = 0.0;
        for (i, &y) in labels.iter().enumerate() {
            let row = x.row(i);
            let max = row.fold(f64::NEG_INFINITY, |m, &v| m.max(v));
            let lse = max + row.mapv(|v| (v - max).exp()).sum().ln();
            for j in 0..cols {
                probs[[i, j]] = (row[j] - lse).exp();
            }
            total += lse - row[y];
        }
        let value = Array2::from_elem((1, 1), total / rows.max(1) as f64);
        Ok(self.push(value, Op::CrossEntropy(logits, probs, labels.to_vec())))
    }

    /// Emit `hard` as the forward value while routing the gradient to `soft`.
    pub fn straight_through(&mut self, hard: Array2<f64>, soft: Var) -> PnnResult<Var> {
        if hard.dim() != self.shape(soft) {
            return Err(PnnError::ShapeMismatch(format!(
                "straight-through hard {:?} vs soft {:?}",
                hard.dim(),
                self.shape(soft)
            )));
        }
        Ok(self.push(hard, Op::StraightThrough(soft)))
    }

    /// Back-propagate from `root`, seeding its gradient with ones.
    pub fn backward(&self, root: Var) -> PnnResult<Gradients> {
        if self.detached {
            return Err(PnnError::Autodiff(
                "backward called on a detached tape".to_string(),
            ));
        }
        let mut grads: Vec<Option<Array2<f64>>> = vec![None; self.nodes.len()];
        grads[root.0] = Some(Array2::ones(self.nodes[root.0].value.dim()));

        for i in (0..=root.0).rev() {
            let g = match grads[i].take() {
                Some(g) => g,
                None => continue,
            };
            let node = &self.nodes[i];
            match &node.op {
                Op::Leaf => {}
                Op::Add(a, b) => {
                    self.accumulate(&mut grads, *a, &g);
                    self.accumulate(&mut grads, *b, &g);
                }
                Op::Sub(a, b) => {
                    self.accumulate(&mut grads, *a, &g);
                    self.accumulate(&mut grads, *b, &(-&g));
                }
                Op::Mul(a, b) => {
                    let ga = &g * self.value(*b);
                    let gb = &g * self.value(*a);
                    self.accumulate(&mut grads, *a, &ga);
                    self.accumulate(&mut grads, *b, &gb);
                }
                Op::Div(a, b) => {
                    let bv = self.value(*b);
                    let ga = &g / bv;
                    let gb = -(&g * &node.value) / bv;
                    self.accumulate(&mut grads, *a, &ga);
                    self.accumulate(&mut grads, *b, &gb);
                }
                Op::Scale(a, k) => self.accumulate(&mut grads, *a, &(&g * *k)),
                Op::AddScalar(a) => self.accumulate(&mut grads, *a, &g),
                Op::MatMul(a, b) => {
                    let ga = g.dot(&self.value(*b).t());
                    let gb = self.value(*a).t().dot(&g);
                    self.accumulate(&mut grads, *a, &ga);
                    self.accumulate(&mut grads, *b, &gb);
                }
                Op::Transpose(a) => self.accumulate(&mut grads, *a, &g.t().to_owned()),
                Op::Tanh(a) => {
                    let d = node.value.mapv(|y| 1.0 - y * y);
                    self.accumulate(&mut grads, *a, &(&g * &d));
                }
                Op::Sigmoid(a) => {
                    let d = node.value.mapv(|y| y * (1.0 - y));
                    self.accumulate(&mut grads, *a, &(&g * &d));
                }
                Op::Abs(a) => {
                    let d = self.value(*a).mapv(|x| if x < 0.0 { -1.0 } else { 1.0 });
                    self.accumulate(&mut grads, *a, &(&g * &d));
                }
                Op::Relu(a) => {
                    let d = self.value(*a).mapv(|x| if x > 0.0 { 1.0 } else { 0.0 });
                    self.accumulate(&mut grads, *a, &(&g * &d));
                }
                Op::Square(a) => {
                    let ga = &g * &(self.value(*a) * 2.0);
                    self.accumulate(&mut grads, *a, &ga);
                }
                Op::SumCols(a) | Op::SumRows(a) => {
                    let ga = broadcast_to(&g, self.shape(*a));
                    self.accumulate(&mut grads, *a, &ga);
                }
                Op::ExtremumCols(a, arg) => {
                    let mut ga = Array2::zeros(self.shape(*a));
                    for (j, &i) in arg.iter().enumerate() {
                        ga[[i, j]] += g[[0, j]];
                    }
                    self.accumulate(&mut grads, *a, &ga);
                }
                Op::MaxRows(a, arg) => {
                    let mut ga = Array2::zeros(self.shape(*a));
                    for (i, &j) in arg.iter().enumerate() {
                        ga[[i, j]] += g[[i, 0]];
                    }
                    self.accumulate(&mut grads, *a, &ga);
                }
                Op::Sum(a) => {
                    let ga = Array2::from_elem(self.shape(*a), g[[0, 0]]);
                    self.accumulate(&mut grads, *a, &ga);
                }
                Op::Mean(a) => {
                    let shape = self.shape(*a);
                    let n = (shape.0 * shape.1).max(1) as f64;
                    let ga = Array2::from_elem(shape, g[[0, 0]] / n);
                    self.accumulate(&mut grads, *a, &ga);
                }
                Op::SliceRows(a, start) => {
                    let mut ga = Array2::zeros(self.shape(*a));
                    let end = start + g.nrows();
                    ga.slice_mut(s![*start..end, ..]).assign(&g);
                    self.accumulate(&mut grads, *a, &ga);
                }
                Op::Column(a, k) => {
                    let mut ga = Array2::zeros(self.shape(*a));
                    ga.slice_mut(s![.., *k..*k + 1]).assign(&g);
                    self.accumulate(&mut grads, *a, &ga);
                }
                Op::ConcatCols(parts) => {
                    let mut offset = 0;
                    for part in parts {
                        let width = self.shape(*part).1;
                        let gp = g.slice(s![.., offset..offset + width]).to_owned();
                        self.accumulate(&mut grads, *part, &gp);
                        offset += width;
                    }
                }
                Op::CrossEntropy(logits, probs, labels) => {
                    let n = labels.len().max(1) as f64;
                    let mut ga = probs.clone();
                    for (i, &y) in labels.iter().enumerate() {
                        ga[[i, y]] -= 1.0;
                    }
                    ga.mapv_inplace(|v| v * g[[0, 0]] / n);
                    self.accumulate(&mut grads, *logits, &ga);
                }
                Op::StraightThrough(soft) => self.accumulate(&mut grads, *soft, &g),
            }
            grads[i] = Some(g);
        }

        let params = self
            .params
            .iter()
            .map(|(&key, (v, p))| {
                let g = grads[v.0]
                    .clone()
                    .unwrap_or_else(|| Array2::zeros(self.shape(*v)));
                (key, (p.clone(), g))
            })
            .collect();
        Ok(Gradients { nodes: grads, params })
    }

    fn accumulate(&self, grads: &mut [Option<Array2<f64>>], target: Var, g: &Array2<f64>) {
        let g = reduce_to(g, self.shape(target));
        match &mut grads[target.0] {
            Some(existing) => *existing += &g,
            slot @ None => *slot = Some(g),
        }
    }
}

/// Sum a broadcast gradient back down to `shape`.
fn reduce_to(g: &Array2<f64>, shape: (usize, usize)) -> Array2<f64> {
    let mut out = g.clone();
    if out.nrows() != shape.0 {
        out = out.sum_axis(Axis(0)).insert_axis(Axis(0));
    }
    if out.ncols() != shape.1 {
        out = out.sum_axis(Axis(1)).insert_axis(Axis(1));
    }
    out
}

fn broadcast_to(g: &Array2<f64>, shape: (usize, usize)) -> Array2<f64> {
    let (gr, gc) = g.dim();
    Array2::from_shape_fn(shape, |(i, j)| {
        g[[if gr == 1 { 0 } else { i }, if gc == 1 { 0 } else { j }]]
    })
}

/// Result of a backward pass.
#[derive(Debug)]
pub struct Gradients {
    nodes: Vec<Option<Array2<f64>>>,
    params: HashMap<usize, (Parameter, Array2<f64>)>,
}

impl Gradients {
    /// Gradient with respect to a registered parameter.
    pub fn get(&self, p: &Parameter) -> Option<&Array2<f64>> {
        self.params.get(&p.key()).map(|(_, g)| g)
    }

    /// Gradient with respect to any node reached by the backward pass.
    pub fn wrt(&self, v: Var) -> Option<&Array2<f64>> {
        self.nodes.get(v.0).and_then(|g| g.as_ref())
    }

    /// True when every parameter gradient is finite.
    pub fn all_finite(&self) -> bool {
        self.params
            .values()
            .all(|(_, g)| g.iter().all(|v| v.is_finite()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.params.values().map(|(p, _)| p.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    /// Central finite difference of `f` with respect to entry (i, j) of `x`.
    fn numeric_grad<F: Fn(&Array2<f64>) -> f64>(f: F, x: &Array2<f64>, i: usize, j: usize) -> f64 {
        let h = 1e-6;
        let mut plus = x.clone();
        plus[[i, j]] += h;
        let mut minus = x.clone();
        minus[[i, j]] -= h;
        (f(&plus) - f(&minus)) / (2.0 * h)
    }

    #[test]
    fn test_matmul_tanh_gradient_matches_finite_difference() {
        let w0 = array![[0.3, -0.2], [0.5, 0.1], [-0.4, 0.7]];
        let x = array![[1.0, -0.5, 0.25], [0.2, 0.3, -0.1]];

        let f = |w: &Array2<f64>| {
            let mut tape = Tape::new();
            let xv = tape.constant(x.clone());
            let wv = tape.constant(w.clone());
            let z = tape.matmul(xv, wv);
            let a = tape.tanh(z);
            let s = tape.sum(a);
            tape.scalar(s)
        };

        let p = Parameter::new("w", w0.clone());
        let mut tape = Tape::new();
        let xv = tape.constant(x.clone());
        let wv = tape.param(&p);
        let z = tape.matmul(xv, wv);
        let a = tape.tanh(z);
        let s = tape.sum(a);
        let grads = tape.backward(s).expect("backward");
        let g = grads.get(&p).expect("gradient for w");

        for i in 0..3 {
            for j in 0..2 {
                assert_abs_diff_eq!(g[[i, j]], numeric_grad(f, &w0, i, j), epsilon = 1e-6);
            }
        }
    }

    #[test]
    fn test_broadcast_division_gradient() {
        let t0 = array![[0.5, -1.0], [2.0, 0.25], [-0.75, 1.5]];
        let f = |t: &Array2<f64>| {
            let mut tape = Tape::new();
            let tv = tape.constant(t.clone());
            let a = tape.abs(tv);
            let cs = tape.sum_cols(a);
            let denom = tape.add_scalar(cs, 1e-10);
            let w = tape.div(a, denom);
            let sq = tape.square(w);
            let s = tape.sum(sq);
            tape.scalar(s)
        };

        let p = Parameter::new("t", t0.clone());
        let mut tape = Tape::new();
        let tv = tape.param(&p);
        let a = tape.abs(tv);
        let cs = tape.sum_cols(a);
        let denom = tape.add_scalar(cs, 1e-10);
        let w = tape.div(a, denom);
        let sq = tape.square(w);
        let s = tape.sum(sq);
        let grads = tape.backward(s).expect("backward");
        let g = grads.get(&p).expect("gradient");

        for i in 0..3 {
            for j in 0..2 {
                assert_abs_diff_eq!(g[[i, j]], numeric_grad(f, &t0, i, j), epsilon = 1e-5);
            }
        }
    }

    #[test]
    fn test_cross_entropy_gradient_sums_to_zero_per_row() {
        let mut tape = Tape::new();
        let p = Parameter::new("logits", array![[1.0, 2.0, 0.5], [0.1, -0.3, 0.2]]);
        let l = tape.param(&p);
        let loss = tape.cross_entropy(l, &[1, 0]).expect("labels valid");
        assert!(tape.scalar(loss) > 0.0);
        let grads = tape.backward(loss).expect("backward");
        let g = grads.get(&p).expect("gradient");
        for row in g.rows() {
            assert_abs_diff_eq!(row.sum(), 0.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_cross_entropy_rejects_bad_labels() {
        let mut tape = Tape::new();
        let l = tape.constant(Array2::zeros((2, 2)));
        assert!(tape.cross_entropy(l, &[0, 2]).is_err());
        assert!(tape.cross_entropy(l, &[0]).is_err());
    }

    #[test]
    fn test_straight_through_keeps_hard_value_and_soft_gradient() {
        let p = Parameter::new("soft", array![[0.3, 0.6]]);
        let mut tape = Tape::new();
        let soft = tape.param(&p);
        let sig = tape.sigmoid(soft);
        let st = tape.straight_through(array![[1.0, 1.0]], sig).expect("same shape");
        let total = tape.sum(st);
        assert_eq!(tape.scalar(total), 2.0);

        let grads = tape.backward(total).expect("backward");
        let g = grads.get(&p).expect("gradient");
        for (j, x) in [0.3f64, 0.6].iter().enumerate() {
            let s = crate::utils::sigmoid(*x);
            assert_abs_diff_eq!(g[[0, j]], s * (1.0 - s), epsilon = 1e-12);
        }
    }

    #[test]
    fn test_shared_parameter_accumulates_across_uses() {
        let p = Parameter::new("k", array![[2.0]]);
        let mut tape = Tape::new();
        let a = tape.param(&p);
        let b = tape.param(&p);
        assert_eq!(a, b);
        let prod = tape.mul(a, b);
        let grads = tape.backward(prod).expect("backward");
        assert_abs_diff_eq!(grads.get(&p).expect("gradient")[[0, 0]], 4.0, epsilon = 1e-12);
    }

    #[test]
    fn test_equally_named_parameters_stay_distinct() {
        let p = Parameter::new("w", array![[2.0]]);
        let q = Parameter::new("w", array![[5.0]]);
        let mut tape = Tape::new();
        let a = tape.param(&p);
        let b = tape.param(&q);
        assert_ne!(a, b);
        assert_eq!(tape.scalar(b), 5.0);
        assert_eq!(tape.param(&q.clone()), b);

        let prod = tape.mul(a, b);
        let grads = tape.backward(prod).expect("backward");
        assert_abs_diff_eq!(grads.get(&p).expect("gradient")[[0, 0]], 5.0, epsilon = 1e-12);
        assert_abs_diff_eq!(grads.get(&q).expect("gradient")[[0, 0]], 2.0, epsilon = 1e-12);
        assert_eq!(grads.names().filter(|&n| n == "w").count(), 2);
    }

    #[test]
    fn test_extrema_route_gradient_to_selected_entry() {
        let p = Parameter::new("m", array![[1.0, 5.0], [3.0, 2.0]]);
        let mut tape = Tape::new();
        let m = tape.param(&p);
        let mx = tape.max_cols(m);
        let mn = tape.min_cols(m);
        assert_eq!(tape.value(mx), &array![[3.0, 5.0]]);
        assert_eq!(tape.value(mn), &array![[1.0, 2.0]]);
        let both = tape.add(mx, mn);
        let s = tape.sum(both);
        let grads = tape.backward(s).expect("backward");
        assert_eq!(grads.get(&p).expect("gradient"), &array![[1.0, 1.0], [1.0, 1.0]]);

        let mut tape = Tape::new();
        let m = tape.param(&p);
        let mr = tape.max_rows(m);
        assert_eq!(tape.value(mr), &array![[5.0], [3.0]]);
        let s = tape.sum(mr);
        let grads = tape.backward(s).expect("backward");
        assert_eq!(grads.get(&p).expect("gradient"), &array![[0.0, 1.0], [1.0, 0.0]]);
    }

    #[test]
    fn test_detached_tape_refuses_backward() {
        let mut tape = Tape::detached();
        let a = tape.scalar_constant(1.0);
        let b = tape.tanh(a);
        assert!(tape.backward(b).is_err());
        assert_abs_diff_eq!(tape.scalar(b), 1.0f64.tanh(), epsilon = 1e-15);
    }

    #[test]
    fn test_parameter_set_rejects_shape_change() {
        let p = Parameter::new("p", Array2::zeros((2, 2)));
        assert!(p.set(Array2::zeros((3, 2))).is_err());
        assert!(p.set(Array2::ones((2, 2))).is_ok());
        assert_eq!(p.value()[[1, 1]], 1.0);
    }
}
