//! Optimizer configuration: algorithm, options and free-form parameters.
//!
//! Options go through an explicit table of recognized names
//! ([`option_names`]); anything else is rejected when the configuration is
//! parsed, before the optimizer runs.  Parameters are arbitrary
//! `name -> f64` pairs passed to the backend untouched.
//!
//! `OptimizerConfig` deserializes from JSON (or any serde format):
//!
//! ```json
//! {
//!   "algorithm": "LD_MMA",
//!   "options": { "set_maxeval": 200, "ftol_rel": 1e-6, "lower_bounds": 0.0 },
//!   "params": { "inner_maxeval": 10 },
//!   "constraint_tolerance": 1e-8
//! }
//! ```

use crate::error::{OptfxError, Result};
use crate::registry::DEFAULT_CONSTRAINT_TOLERANCE;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

// ─────────────────────────────────────────────────────────────
//  Algorithms
// ─────────────────────────────────────────────────────────────

/// Which crate runs the optimization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Pure-Rust L-BFGS (+ augmented Lagrangian) via `argmin`.
    Argmin,
    /// NLopt, behind the `nlopt` feature.
    Nlopt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(try_from = "String")]
pub enum Algorithm {
    /// argmin L-BFGS; constraints via augmented Lagrangian.
    Lbfgs,
    /// Method of moving asymptotes (NLopt `LD_MMA`).
    #[default]
    LdMma,
    /// Conservative convex separable quadratic approximations.
    LdCcsaq,
    LdSlsqp,
    /// NLopt's own L-BFGS, unconstrained only.
    LdLbfgs,
    /// Derivative-free; `backward` is never called.
    LnCobyla,
}

impl Algorithm {
    pub const ALL: [Algorithm; 6] = [
        Algorithm::Lbfgs,
        Algorithm::LdMma,
        Algorithm::LdCcsaq,
        Algorithm::LdSlsqp,
        Algorithm::LdLbfgs,
        Algorithm::LnCobyla,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Lbfgs => "LBFGS",
            Self::LdMma => "LD_MMA",
            Self::LdCcsaq => "LD_CCSAQ",
            Self::LdSlsqp => "LD_SLSQP",
            Self::LdLbfgs => "LD_LBFGS",
            Self::LnCobyla => "LN_COBYLA",
        }
    }

    pub fn backend(self) -> BackendKind {
        match self {
            Self::Lbfgs => BackendKind::Argmin,
            _ => BackendKind::Nlopt,
        }
    }

    /// Whether the algorithm asks for gradients.
    pub fn uses_gradient(self) -> bool {
        !matches!(self, Self::LnCobyla)
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Algorithm {
    type Err = OptfxError;

    fn from_str(s: &str) -> Result<Self> {
        let key = s.trim().to_ascii_uppercase();
        let key = key.strip_prefix("NLOPT_").unwrap_or(&key);
        Self::ALL
            .into_iter()
            .find(|a| a.name() == key)
            .ok_or_else(|| OptfxError::UnknownAlgorithm(s.to_string()))
    }
}

impl TryFrom<String> for Algorithm {
    type Error = OptfxError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

// ─────────────────────────────────────────────────────────────
//  Option values
// ─────────────────────────────────────────────────────────────

/// Raw option value as given by the caller.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum OptionValue {
    Number(f64),
    Vector(Vec<f64>),
}

impl From<f64> for OptionValue {
    fn from(v: f64) -> Self {
        Self::Number(v)
    }
}

impl From<u32> for OptionValue {
    fn from(v: u32) -> Self {
        Self::Number(f64::from(v))
    }
}

impl From<Vec<f64>> for OptionValue {
    fn from(v: Vec<f64>) -> Self {
        Self::Vector(v)
    }
}

/// A per-variable setting given either once for all variables or per entry.
#[derive(Debug, Clone, PartialEq)]
pub enum PerVariable {
    Uniform(f64),
    Each(Vec<f64>),
}

impl PerVariable {
    /// Expand to one value per variable.
    pub fn expand(&self, size: usize) -> Vec<f64> {
        match self {
            Self::Uniform(v) => vec![*v; size],
            Self::Each(v) => v.clone(),
        }
    }
}

type ValueResult<T> = std::result::Result<T, String>;

impl OptionValue {
    fn number(&self) -> ValueResult<f64> {
        match self {
            Self::Number(v) if v.is_nan() => Err("value is NaN".into()),
            Self::Number(v) => Ok(*v),
            Self::Vector(_) => Err("expected a number, got a vector".into()),
        }
    }

    fn non_negative(&self) -> ValueResult<f64> {
        let v = self.number()?;
        if v < 0.0 {
            return Err(format!("expected a non-negative value, got {v}"));
        }
        Ok(v)
    }

    fn count(&self) -> ValueResult<u32> {
        let v = self.non_negative()?;
        if v.fract() != 0.0 || v > f64::from(u32::MAX) {
            return Err(format!("expected a whole count, got {v}"));
        }
        Ok(v as u32)
    }

    fn per_variable(&self) -> ValueResult<PerVariable> {
        match self {
            Self::Number(v) if v.is_nan() => Err("value is NaN".into()),
            Self::Number(v) => Ok(PerVariable::Uniform(*v)),
            Self::Vector(v) if v.iter().any(|x| x.is_nan()) => Err("vector contains NaN".into()),
            Self::Vector(v) => Ok(PerVariable::Each(v.clone())),
        }
    }
}

// ─────────────────────────────────────────────────────────────
//  Recognized options
// ─────────────────────────────────────────────────────────────

/// Typed, validated optimizer options.  `None` means "backend default".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OptimizerOptions {
    /// Stop when the objective drops below this value.
    pub stopval: Option<f64>,
    pub ftol_rel: Option<f64>,
    pub ftol_abs: Option<f64>,
    pub xtol_rel: Option<f64>,
    pub xtol_abs: Option<f64>,
    /// Evaluation budget (argmin: iteration budget).
    pub maxeval: Option<u32>,
    /// Wall-clock budget in seconds.
    pub maxtime: Option<f64>,
    pub lower_bounds: Option<PerVariable>,
    pub upper_bounds: Option<PerVariable>,
    pub initial_step: Option<PerVariable>,
}

type Setter = fn(&mut OptimizerOptions, &OptionValue) -> ValueResult<()>;

fn set_stopval(o: &mut OptimizerOptions, v: &OptionValue) -> ValueResult<()> {
    o.stopval = Some(v.number()?);
    Ok(())
}

fn set_ftol_rel(o: &mut OptimizerOptions, v: &OptionValue) -> ValueResult<()> {
    o.ftol_rel = Some(v.non_negative()?);
    Ok(())
}

fn set_ftol_abs(o: &mut OptimizerOptions, v: &OptionValue) -> ValueResult<()> {
    o.ftol_abs = Some(v.non_negative()?);
    Ok(())
}

fn set_xtol_rel(o: &mut OptimizerOptions, v: &OptionValue) -> ValueResult<()> {
    o.xtol_rel = Some(v.non_negative()?);
    Ok(())
}

fn set_xtol_abs(o: &mut OptimizerOptions, v: &OptionValue) -> ValueResult<()> {
    o.xtol_abs = Some(v.non_negative()?);
    Ok(())
}

fn set_maxeval(o: &mut OptimizerOptions, v: &OptionValue) -> ValueResult<()> {
    o.maxeval = Some(v.count()?);
    Ok(())
}

fn set_maxtime(o: &mut OptimizerOptions, v: &OptionValue) -> ValueResult<()> {
    o.maxtime = Some(v.non_negative()?);
    Ok(())
}

fn set_lower_bounds(o: &mut OptimizerOptions, v: &OptionValue) -> ValueResult<()> {
    o.lower_bounds = Some(v.per_variable()?);
    Ok(())
}

fn set_upper_bounds(o: &mut OptimizerOptions, v: &OptionValue) -> ValueResult<()> {
    o.upper_bounds = Some(v.per_variable()?);
    Ok(())
}

fn set_initial_step(o: &mut OptimizerOptions, v: &OptionValue) -> ValueResult<()> {
    o.initial_step = Some(v.per_variable()?);
    Ok(())
}

const SETTERS: &[(&str, Setter)] = &[
    ("stopval", set_stopval),
    ("ftol_rel", set_ftol_rel),
    ("ftol_abs", set_ftol_abs),
    ("xtol_rel", set_xtol_rel),
    ("xtol_abs", set_xtol_abs),
    ("maxeval", set_maxeval),
    ("maxtime", set_maxtime),
    ("lower_bounds", set_lower_bounds),
    ("upper_bounds", set_upper_bounds),
    ("initial_step", set_initial_step),
];

/// Option names accepted by [`OptimizerOptions::set`] (also as `set_<name>`).
pub fn option_names() -> impl Iterator<Item = &'static str> {
    SETTERS.iter().map(|(name, _)| *name)
}

impl OptimizerOptions {
    /// Apply one option by name.  `set_maxeval` and `maxeval` are the same key.
    pub fn set(&mut self, name: &str, value: &OptionValue) -> Result<()> {
        let key = name.strip_prefix("set_").unwrap_or(name);
        let (_, setter) = SETTERS
            .iter()
            .find(|(n, _)| *n == key)
            .ok_or_else(|| OptfxError::UnknownOption(name.to_string()))?;
        setter(self, value).map_err(|reason| OptfxError::InvalidOption {
            name: name.to_string(),
            reason,
        })
    }

    /// Parse a whole option map; the first bad entry fails.
    pub fn from_map(options: &BTreeMap<String, OptionValue>) -> Result<Self> {
        let mut parsed = Self::default();
        for (name, value) in options {
            parsed.set(name, value)?;
        }
        Ok(parsed)
    }

    /// Check that per-variable vectors have one entry per design variable.
    pub fn check_size(&self, size: usize) -> Result<()> {
        let fields = [
            ("lower_bounds", &self.lower_bounds),
            ("upper_bounds", &self.upper_bounds),
            ("initial_step", &self.initial_step),
        ];
        for (name, field) in fields {
            if let Some(PerVariable::Each(v)) = field {
                if v.len() != size {
                    return Err(OptfxError::InvalidOption {
                        name: name.to_string(),
                        reason: format!("expected {size} entries, got {}", v.len()),
                    });
                }
            }
        }
        Ok(())
    }

    /// Names of the options that are set.
    pub fn names_set(&self) -> Vec<&'static str> {
        [
            ("stopval", self.stopval.is_some()),
            ("ftol_rel", self.ftol_rel.is_some()),
            ("ftol_abs", self.ftol_abs.is_some()),
            ("xtol_rel", self.xtol_rel.is_some()),
            ("xtol_abs", self.xtol_abs.is_some()),
            ("maxeval", self.maxeval.is_some()),
            ("maxtime", self.maxtime.is_some()),
            ("lower_bounds", self.lower_bounds.is_some()),
            ("upper_bounds", self.upper_bounds.is_some()),
            ("initial_step", self.initial_step.is_some()),
        ]
        .into_iter()
        .filter_map(|(name, set)| set.then_some(name))
        .collect()
    }
}

// ─────────────────────────────────────────────────────────────
//  OptimizerConfig
// ─────────────────────────────────────────────────────────────

/// Everything `optimize` needs besides the problem and the initial design.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OptimizerConfig {
    pub algorithm: Algorithm,
    /// Recognized optimizer options, see [`option_names`].
    pub options: BTreeMap<String, OptionValue>,
    /// Free-form backend parameters.
    pub params: BTreeMap<String, f64>,
    /// Tolerance for every discovered inequality constraint.
    pub constraint_tolerance: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            algorithm: Algorithm::default(),
            options: BTreeMap::new(),
            params: BTreeMap::new(),
            constraint_tolerance: DEFAULT_CONSTRAINT_TOLERANCE,
        }
    }
}

impl OptimizerConfig {
    pub fn new(algorithm: Algorithm) -> Self {
        Self {
            algorithm,
            ..Self::default()
        }
    }

    pub fn with_option(mut self, name: impl Into<String>, value: impl Into<OptionValue>) -> Self {
        self.options.insert(name.into(), value.into());
        self
    }

    pub fn with_param(mut self, name: impl Into<String>, value: f64) -> Self {
        self.params.insert(name.into(), value);
        self
    }

    pub fn with_constraint_tolerance(mut self, tolerance: f64) -> Self {
        self.constraint_tolerance = tolerance;
        self
    }

    /// Parse and validate the option map.
    pub fn parsed_options(&self) -> Result<OptimizerOptions> {
        OptimizerOptions::from_map(&self.options)
    }
}
