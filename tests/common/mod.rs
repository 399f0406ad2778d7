//! Caller-side models shared by the integration tests.
//!
//! `Rod` is a 1-D steady heat conduction problem on [0, 1]: `n` linear
//! elements, node 0 held at T = 0, unit heat load spread over the free
//! nodes.  Element conductivity is
//!
//!     k_e = k_min + (1 − k_min) ρ_e,     ρ_e = sigmoid(θ_e)
//!
//! and the design variables are the unbounded θ.  The cost is the thermal
//! compliance c = fᵀT with K(ρ) T = f; it is self-adjoint, so
//!
//!     dc/dθ_e = −(1 − k_min) ρ_e (1 − ρ_e) (T_{e+1} − T_e)² / h
//!
//! `constraint_volume` = mean(ρ) − volume_fraction.

#![allow(dead_code)]

use optfx::{BlockGradients, Problem};
use sprs::{FillInReduction, SymmetryCheck, TriMat};
use sprs_ldl::Ldl;

pub const K_MIN: f64 = 1e-3;

#[derive(Debug, thiserror::Error)]
pub enum RodError {
    #[error("stiffness factorization failed: {0}")]
    Factorization(String),
    #[error("{0} requested before any forward solve")]
    NoState(&'static str),
    #[error("unknown functional {0}")]
    UnknownFunctional(String),
    #[error("solver diverged on forward solve #{0}")]
    Diverged(usize),
}

pub fn sigmoid(t: f64) -> f64 {
    1.0 / (1.0 + (-t).exp())
}

pub fn logit(p: f64) -> f64 {
    (p / (1.0 - p)).ln()
}

struct State {
    rho: Vec<f64>,
    /// Nodal temperatures, node 0 included.
    temps: Vec<f64>,
    compliance: f64,
}

pub struct Rod {
    pub elements: usize,
    pub volume_fraction: f64,
    /// Expose `constraint_volume` to the driver.
    pub with_volume: bool,
    /// Fail every forward solve after this many.
    pub fail_after: Option<usize>,
    pub forwards: usize,
    pub backwards: usize,
    state: Option<State>,
}

impl Rod {
    pub fn new(elements: usize, volume_fraction: f64) -> Self {
        Self {
            elements,
            volume_fraction,
            with_volume: true,
            fail_after: None,
            forwards: 0,
            backwards: 0,
            state: None,
        }
    }

    pub fn unconstrained(elements: usize) -> Self {
        Self {
            with_volume: false,
            ..Self::new(elements, 0.5)
        }
    }

    /// θ giving a uniform density equal to the volume fraction.
    pub fn uniform_design(&self) -> Vec<f64> {
        vec![logit(self.volume_fraction); self.elements]
    }

    fn h(&self) -> f64 {
        1.0 / self.elements as f64
    }

    fn state(&self, what: &'static str) -> Result<&State, RodError> {
        self.state.as_ref().ok_or(RodError::NoState(what))
    }

    /// Compliance for densities `rho`, without touching the solver state.
    pub fn compliance_of(&self, rho: &[f64]) -> Result<f64, RodError> {
        Ok(self.solve(rho)?.1)
    }

    fn solve(&self, rho: &[f64]) -> Result<(Vec<f64>, f64), RodError> {
        let n = self.elements;
        let h = self.h();
        let mut k = TriMat::new((n, n));
        for (e, &r) in rho.iter().enumerate() {
            let s = (K_MIN + (1.0 - K_MIN) * r) / h;
            // element e joins nodes e and e + 1; node 0 is fixed
            if e > 0 {
                k.add_triplet(e - 1, e - 1, s);
                k.add_triplet(e - 1, e, -s);
                k.add_triplet(e, e - 1, -s);
            }
            k.add_triplet(e, e, s);
        }
        let k = k.to_csc::<usize>();
        let ldl = Ldl::new()
            .fill_in_reduction(FillInReduction::ReverseCuthillMcKee)
            .check_symmetry(SymmetryCheck::DontCheckSymmetry)
            .numeric(k.view())
            .map_err(|e| RodError::Factorization(format!("{e:?}")))?;

        let load = vec![h; n];
        let free = ldl.solve(load.as_slice());
        let compliance = load.iter().zip(&free).map(|(f, t)| f * t).sum();

        let mut temps = Vec::with_capacity(n + 1);
        temps.push(0.0);
        temps.extend(free);
        Ok((temps, compliance))
    }
}

impl Problem for Rod {
    type Block = Vec<f64>;
    type Weighting = f64;
    type Error = RodError;

    fn forward(&mut self, blocks: &[Vec<f64>]) -> Result<f64, RodError> {
        self.forwards += 1;
        if self.fail_after.is_some_and(|limit| self.forwards > limit) {
            return Err(RodError::Diverged(self.forwards));
        }
        let rho: Vec<f64> = blocks[0].iter().copied().map(sigmoid).collect();
        let (temps, compliance) = self.solve(&rho)?;
        self.state = Some(State { rho, temps, compliance });
        Ok(compliance)
    }

    fn backward(&mut self) -> Result<BlockGradients, RodError> {
        self.backwards += 1;
        let h = self.h();
        let s = self.state("backward")?;
        let grad = s
            .rho
            .iter()
            .enumerate()
            .map(|(e, &r)| {
                let dt = s.temps[e + 1] - s.temps[e];
                -(1.0 - K_MIN) * r * (1.0 - r) * dt * dt / h
            })
            .collect();
        Ok(vec![grad])
    }

    fn functionals(&self) -> Vec<String> {
        let mut names = vec!["compliance".to_string()];
        if self.with_volume {
            names.push("constraint_volume".to_string());
        }
        names
    }

    fn evaluate(&mut self, name: &str) -> Result<f64, RodError> {
        let s = self.state("evaluate")?;
        match name {
            "compliance" => Ok(s.compliance),
            "constraint_volume" => {
                let mean = s.rho.iter().sum::<f64>() / s.rho.len() as f64;
                Ok(mean - self.volume_fraction)
            }
            other => Err(RodError::UnknownFunctional(other.to_string())),
        }
    }

    fn backward_constraint(&mut self, name: &str, weighting: &f64) -> Result<BlockGradients, RodError> {
        if name != "constraint_volume" {
            return Err(RodError::UnknownFunctional(name.to_string()));
        }
        let s = self.state("constraint gradient")?;
        let n = s.rho.len() as f64;
        Ok(vec![s.rho.iter().map(|r| weighting * r * (1.0 - r) / n).collect()])
    }
}
