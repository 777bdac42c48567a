use std::collections::HashMap;
use std::fmt::Write;

use nalgebra::{DMatrix, DVector};
use thiserror::Error;

use crate::factor::{Factor, Symbol, Values};

#[derive(Debug, Error)]
pub enum SmootherError {
    #[error("linear system could not be solved")]
    SingularSystem,
    #[error("non-finite update step")]
    NonFiniteStep,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Factorization {
    Qr,
    Cholesky,
}

#[derive(Copy, Clone, Debug)]
pub struct SmootherParameters {
    /// Minimum delta component before the linearization point is refreshed.
    pub relinearize_threshold: f64,
    /// Only consider relinearizing every this many update calls.
    pub relinearize_skip: u32,
    pub factorization: Factorization,
}

impl Default for SmootherParameters {
    fn default() -> Self {
        Self {
            relinearize_threshold: 0.05,
            relinearize_skip: 1,
            factorization: Factorization::Qr,
        }
    }
}

/// Incremental nonlinear smoother over pose and plane variables. Factors
/// accumulate over the whole trajectory; every `update` runs one
/// Gauss-Newton round around the current linearization point, which is
/// refreshed lazily under the relinearization parameters. The current
/// solution is the linearization point retracted by the last linear delta.
pub struct IncrementalSmoother {
    parameters: SmootherParameters,
    factors: Vec<Factor>,
    lin_point: Values,
    ordering: Vec<Symbol>,
    delta: DVector<f64>,
    update_count: u32,
}

impl IncrementalSmoother {
    pub fn new(parameters: SmootherParameters) -> Self {
        Self {
            parameters,
            factors: Vec::new(),
            lin_point: Values::new(),
            ordering: Vec::new(),
            delta: DVector::zeros(0),
            update_count: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.factors.is_empty()
    }

    pub fn factor_count(&self) -> usize {
        self.factors.len()
    }

    /// Submits new factors and initial guesses, then runs one optimization
    /// round. New variables enter the graph at their supplied guess.
    pub fn update(
        &mut self,
        new_factors: Vec<Factor>,
        new_values: Values,
    ) -> Result<(), SmootherError> {
        self.update_count += 1;
        self.factors.extend(new_factors);

        if !new_values.is_empty() {
            // growing the variable set shifts all block offsets, so fold the
            // pending delta into the linearization point first
            self.fold_delta();
            self.lin_point.merge(new_values);
            self.ordering = self.lin_point.ordering();
            self.delta = DVector::zeros(self.lin_point.dimension());
        } else if self.update_count % self.parameters.relinearize_skip.max(1) == 0
            && self.max_delta() > self.parameters.relinearize_threshold
        {
            self.fold_delta();
        }

        if self.factors.is_empty() || self.lin_point.is_empty() {
            return Ok(());
        }
        self.solve()
    }

    /// Re-runs a round on the already submitted data.
    pub fn refine(&mut self) -> Result<(), SmootherError> {
        self.update(Vec::new(), Values::new())
    }

    pub fn best_estimate(&self) -> Values {
        if self.delta.len() == 0 {
            return self.lin_point.clone();
        }
        self.lin_point.retract_all(&self.ordering, &self.delta)
    }

    /// Textual snapshot of the factor graph: variables as ellipses, factors
    /// as point-shaped hyperedge nodes.
    pub fn dot_graph(&self) -> String {
        let mut dot = String::from("graph factor_graph {\n");
        for symbol in &self.ordering {
            let shape = match symbol {
                Symbol::Pose(_) => "ellipse",
                Symbol::Plane(_) => "box",
            };
            let _ = writeln!(dot, "  {symbol} [shape={shape}];");
        }
        for (i, factor) in self.factors.iter().enumerate() {
            let _ = writeln!(dot, "  f{i} [shape=point, xlabel=\"{}\"];", factor.name());
            for key in factor.keys() {
                let _ = writeln!(dot, "  f{i} -- {key};");
            }
        }
        dot.push_str("}\n");
        dot
    }

    fn max_delta(&self) -> f64 {
        if self.delta.len() == 0 {
            0.0
        } else {
            self.delta.amax()
        }
    }

    fn fold_delta(&mut self) {
        if self.max_delta() > 0.0 {
            self.lin_point = self.lin_point.retract_all(&self.ordering, &self.delta);
            self.delta = DVector::zeros(self.lin_point.dimension());
        }
    }

    fn solve(&mut self) -> Result<(), SmootherError> {
        let mut offsets = HashMap::new();
        let mut offset = 0;
        for symbol in &self.ordering {
            offsets.insert(*symbol, offset);
            offset += symbol.dim();
        }

        let n = self.lin_point.dimension();
        let mut hessian = DMatrix::zeros(n, n);
        let mut gradient = DVector::zeros(n);

        for factor in &self.factors {
            let keys = factor.keys();
            let (jacobians, error) = factor.linearize(&self.lin_point);

            for (a, ja) in keys.iter().zip(&jacobians) {
                let oa = offsets[a];
                let jat = ja.transpose();

                let g_block = &jat * &error;
                let mut view = gradient.rows_mut(oa, a.dim());
                view += g_block;

                for (b, jb) in keys.iter().zip(&jacobians) {
                    let ob = offsets[b];
                    let h_block = &jat * jb;
                    let mut view = hessian.view_mut((oa, ob), (a.dim(), b.dim()));
                    view += h_block;
                }
            }
        }

        let rhs = -gradient;
        let solution = match self.parameters.factorization {
            Factorization::Qr => hessian.clone().qr().solve(&rhs),
            Factorization::Cholesky => hessian.clone().cholesky().map(|c| c.solve(&rhs)),
        };
        let delta = match solution {
            Some(delta) => delta,
            None => lstsq::lstsq(&hessian, &rhs, 1e-12)
                .map(|r| r.solution)
                .map_err(|_| SmootherError::SingularSystem)?,
        };

        if delta.iter().any(|v| !v.is_finite()) {
            return Err(SmootherError::NonFiniteStep);
        }
        self.delta = delta;
        Ok(())
    }
}
