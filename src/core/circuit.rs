//! Learnable printed nonlinear circuits.
//!
//! A circuit holds unconstrained design parameters `ρ`. Every query runs the
//! full chain again:
//!
//! ```text
//! RT  = sigmoid(ρ) · (x_max − x_min) + x_min          physical design point
//! ext = [RT, ratio features]                          extended features
//! η   = f_coef((ext − x_min) / (x_max − x_min)) · (y_max − y_min) + y_min
//! a(z) = η₀ + η₁ · tanh((z − η₂) · η₃)                 (negated for the inverter)
//! ```
//!
//! Nothing is cached because `ρ` changes between optimizer steps.

use ndarray::Array2;
use std::rc::Rc;

use super::surrogate::{CircuitKind, SurrogatePackage, NUM_COEFFICIENTS};
use super::{PnnError, PnnResult};
use crate::autodiff::{Parameter, Tape, Var};
use crate::utils::row;

/// One printed nonlinear circuit design, shared by every layer that uses it.
#[derive(Debug)]
pub struct NonlinearCircuit {
    kind: CircuitKind,
    design: Parameter,
    package: Rc<SurrogatePackage>,
}

impl NonlinearCircuit {
    /// Create a circuit from a validated package and initial unconstrained design values.
    pub fn new(package: Rc<SurrogatePackage>, initial: &[f64]) -> PnnResult<Self> {
        let kind = package.kind;
        if initial.len() != kind.design_len() {
            return Err(PnnError::InvalidConfig(format!(
                "{} circuit has {} design parameters, got {}",
                kind.name(),
                kind.design_len(),
                initial.len()
            )));
        }
        package.validate()?;
        let design = Parameter::new(format!("{}.design", kind.name()), row(initial));
        Ok(Self {
            kind,
            design,
            package,
        })
    }

    pub fn kind(&self) -> CircuitKind {
        self.kind
    }

    pub fn design(&self) -> &Parameter {
        &self.design
    }

    pub fn package(&self) -> &SurrogatePackage {
        &self.package
    }

    /// Physical design values, `(1, design_len)`.
    pub fn design_point(&self, tape: &mut Tape) -> Var {
        let d = self.kind.design_len();
        let lo = &self.package.x_min[..d];
        let span: Vec<f64> = self.package.x_max[..d]
            .iter()
            .zip(lo)
            .map(|(hi, lo)| hi - lo)
            .collect();

        let raw = tape.param(&self.design);
        let squashed = tape.sigmoid(raw);
        let span = tape.constant(row(&span));
        let lo = tape.constant(row(lo));
        let scaled = tape.mul(squashed, span);
        tape.add(scaled, lo)
    }

    /// Normalized extended features, `(1, feature_len)`.
    pub fn features(&self, tape: &mut Tape) -> PnnResult<Var> {
        let rt = self.design_point(tape);
        let mut parts = vec![rt];
        for &(num, den) in self.kind.ratio_pairs() {
            let n = tape.column(rt, num);
            let d = tape.column(rt, den);
            parts.push(tape.div(n, d));
        }
        let extended = tape.concat_cols(&parts)?;

        let span: Vec<f64> = self
            .package
            .x_max
            .iter()
            .zip(&self.package.x_min)
            .map(|(hi, lo)| hi - lo)
            .collect();
        let lo = tape.constant(row(&self.package.x_min));
        let span = tape.constant(row(&span));
        let shifted = tape.sub(extended, lo);
        Ok(tape.div(shifted, span))
    }

    /// Transfer-function coefficients `(offset, gain, threshold, slope)`, `(1, 4)`.
    pub fn coefficients(&self, tape: &mut Tape) -> PnnResult<Var> {
        let x = self.features(tape)?;
        let normalized = self.package.coefficient_estimator.forward(tape, x);
        Ok(denormalize(tape, normalized, &self.package.y_min, &self.package.y_max))
    }

    /// Mean power of the current design point, `(1, 1)`.
    pub fn power(&self, tape: &mut Tape) -> PnnResult<Var> {
        let x = self.features(tape)?;
        let normalized = self.package.power_estimator.forward(tape, x);
        let power = denormalize(
            tape,
            normalized,
            &self.package.power_y_min,
            &self.package.power_y_max,
        );
        Ok(tape.mean(power))
    }

    /// Apply the circuit's transfer function element-wise to `z`.
    pub fn forward(&self, tape: &mut Tape, z: Var) -> PnnResult<Var> {
        let eta = self.coefficients(tape)?;
        let offset = tape.column(eta, 0);
        let gain = tape.column(eta, 1);
        let threshold = tape.column(eta, 2);
        let slope = tape.column(eta, 3);

        let shifted = tape.sub(z, threshold);
        let scaled = tape.mul(shifted, slope);
        let t = tape.tanh(scaled);
        let g = tape.mul(t, gain);
        let a = tape.add(g, offset);
        Ok(match self.kind {
            CircuitKind::Activation => a,
            CircuitKind::Negation => tape.neg(a),
        })
    }

    /// Current coefficients as plain numbers.
    pub fn coefficient_values(&self) -> PnnResult<[f64; NUM_COEFFICIENTS]> {
        let mut tape = Tape::detached();
        let eta = self.coefficients(&mut tape)?;
        let v = tape.value(eta);
        Ok([v[[0, 0]], v[[0, 1]], v[[0, 2]], v[[0, 3]]])
    }

    /// Current mean power as a plain number.
    pub fn power_value(&self) -> PnnResult<f64> {
        let mut tape = Tape::detached();
        let p = self.power(&mut tape)?;
        Ok(tape.scalar(p))
    }

    /// Evaluate the transfer function on plain values.
    pub fn transfer(&self, z: &Array2<f64>) -> PnnResult<Array2<f64>> {
        let mut tape = Tape::detached();
        let zv = tape.constant(z.clone());
        let a = self.forward(&mut tape, zv)?;
        Ok(tape.value(a).clone())
    }
}

fn denormalize(tape: &mut Tape, normalized: Var, lo: &[f64], hi: &[f64]) -> Var {
    let span: Vec<f64> = hi.iter().zip(lo).map(|(h, l)| h - l).collect();
    let span = tape.constant(row(&span));
    let lo = tape.constant(row(lo));
    let scaled = tape.mul(normalized, span);
    tape.add(scaled, lo)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn circuit(kind: CircuitKind) -> NonlinearCircuit {
        let package = Rc::new(SurrogatePackage::nominal(kind));
        NonlinearCircuit::new(package, &vec![0.0; kind.design_len()]).expect("valid circuit")
    }

    #[test]
    fn test_design_point_stays_inside_calibration_range() {
        let c = circuit(CircuitKind::Activation);
        c.design()
            .set(row(&[-20.0, 20.0, 0.0, 3.0, -3.0, 0.5]))
            .expect("shape");
        let mut tape = Tape::detached();
        let rt = c.design_point(&mut tape);
        for (j, v) in tape.value(rt).iter().enumerate() {
            assert!(*v >= c.package().x_min[j] && *v <= c.package().x_max[j]);
        }
    }

    #[test]
    fn test_negation_transfer_is_decreasing() {
        let act = circuit(CircuitKind::Activation);
        let neg = circuit(CircuitKind::Negation);
        let z = array![[-1.0, 0.0, 0.5]];
        let a = act.transfer(&z).expect("act");
        let n = neg.transfer(&z).expect("neg");
        assert!(a[[0, 0]] < a[[0, 2]]);
        assert!(n[[0, 0]] > n[[0, 2]]);
    }

    #[test]
    fn test_nominal_transfer_is_tanh_like() {
        let c = circuit(CircuitKind::Activation);
        let eta = c.coefficient_values().expect("coefficients");
        assert!(eta[0].abs() <= 0.1);
        assert!(eta[1] >= 0.8 && eta[1] <= 1.2);
        assert!(eta[2].abs() <= 0.1);
        assert!(eta[3] >= 0.8 && eta[3] <= 1.2);
    }

    #[test]
    fn test_power_reflects_current_parameters() {
        let c = circuit(CircuitKind::Negation);
        let before = c.power_value().expect("power");
        c.design().update(|d| d[[0, 0]] += 3.0);
        let after = c.power_value().expect("power");
        assert!(before > 0.0);
        assert!((before - after).abs() > 0.0);
    }

    #[test]
    fn test_power_gradient_matches_finite_difference() {
        let c = circuit(CircuitKind::Activation);
        let mut tape = Tape::new();
        let p = c.power(&mut tape).expect("power");
        let grads = tape.backward(p).expect("backward");
        let g = grads.get(c.design()).expect("design gradient").clone();

        let h = 1e-5;
        for j in 0..CircuitKind::Activation.design_len() {
            c.design().update(|d| d[[0, j]] += h);
            let plus = c.power_value().expect("power");
            c.design().update(|d| d[[0, j]] -= 2.0 * h);
            let minus = c.power_value().expect("power");
            c.design().update(|d| d[[0, j]] += h);
            let numeric = (plus - minus) / (2.0 * h);
            assert_abs_diff_eq!(g[[0, j]], numeric, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_wrong_design_length_is_rejected() {
        let package = Rc::new(SurrogatePackage::nominal(CircuitKind::Negation));
        assert!(NonlinearCircuit::new(package, &[0.0; 6]).is_err());
    }
}
