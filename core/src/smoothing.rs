//! Forward-only online smoothing of additive functionals.
//!
//! For an additive functional
//!
//! $$ \varphi_t(x_{0:t}) = \sum_{s=0}^{t} \psi_s(x_{s-1}, x_s) $$
//!
//! both smoothers keep one running value $S_t^n$ per particle and estimate
//! $E[\varphi_t \mid y_{0:t}]$ by $\sum_n W_t^n S_t^n$.
//!
//! ## Exact, $O(N^2)$
//!
//! $$ S_t^n = \sum_m \frac{W_{t-1}^m p_t(x_t^n \mid x_{t-1}^m)}{\sum_{m'} W_{t-1}^{m'} p_t(x_t^n \mid x_{t-1}^{m'})} \left( S_{t-1}^m + \psi_t(x_{t-1}^m, x_t^n) \right) $$
//!
//! The backward weights are recomputed from the whole previous ensemble at
//! every step and never look at the ancestry, so the estimator does not suffer
//! from path degeneracy. It needs the transition density.
//!
//! ## Naive, $O(N)$
//!
//! $$ S_t^n = S_{t-1}^{a_t^n} + \psi_t(x_{t-1}^{a_t^n}, x_t^n) $$
//!
//! This only follows the genealogy. It is cheap, but as lineages coalesce the
//! per-particle values become copies of one another and the variance of the
//! estimate blows up with `t`.

use std::fmt::{self, Display};
use std::str::FromStr;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SmcError};
use crate::model::{StateSpaceModel, TransitionDensity};
use crate::particle::log_sum_exp;

/// Which online smoother a run uses.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
pub enum SmoothingStrategy {
    /// Full backward reweighting over all particle pairs.
    #[default]
    Exact,
    /// Ancestry-based recursion.
    Naive,
}

impl Display for SmoothingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SmoothingStrategy::Exact => f.write_str("exact"),
            SmoothingStrategy::Naive => f.write_str("naive"),
        }
    }
}

impl FromStr for SmoothingStrategy {
    type Err = SmcError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "exact" | "on2" => Ok(SmoothingStrategy::Exact),
            "naive" => Ok(SmoothingStrategy::Naive),
            other => Err(SmcError::config(format!(
                "unknown smoothing strategy '{other}'"
            ))),
        }
    }
}

/// Everything a smoother may look at when moving from step `t - 1` to `t`.
///
/// `prev_states` and `prev_log_weights` describe the filtering ensemble of
/// step `t - 1` *before* resampling. `ancestors[n]` is the index in that
/// ensemble of the parent of particle `n` (the identity when no resampling
/// took place), and `states` are the propagated particles of step `t`.
#[derive(Clone, Copy, Debug)]
pub struct Transition<'a, S> {
    pub t: usize,
    pub prev_states: &'a [S],
    pub prev_log_weights: &'a [f64],
    pub ancestors: &'a [usize],
    pub states: &'a [S],
}

/// A forward-only estimator of the smoothing expectation of an additive functional.
pub trait OnlineSmoother<M: StateSpaceModel> {
    fn strategy(&self) -> SmoothingStrategy;

    /// Set $S_0^n = \psi_0(x_0^n)$.
    fn initialize(&mut self, model: &M, states: &[M::State]) -> Result<()>;

    /// Advance the accumulators from step `t - 1` to step `t`.
    fn update(&mut self, model: &M, transition: &Transition<'_, M::State>) -> Result<()>;

    /// Current per-particle values $S_t^n$.
    fn accumulators(&self) -> &[f64];

    /// $\sum_n W_t^n S_t^n$ for normalized `weights`.
    fn estimate(&self, weights: &[f64]) -> f64 {
        self.accumulators()
            .iter()
            .zip(weights)
            .map(|(s, w)| s * w)
            .sum()
    }
}

fn checked_increment<M: StateSpaceModel>(
    model: &M,
    t: usize,
    prev: Option<&M::State>,
    state: &M::State,
) -> Result<f64> {
    let value = model.increment(t, prev, state);
    if value.is_finite() {
        Ok(value)
    } else {
        Err(SmcError::contract(t, format!("additive increment is {value}")))
    }
}

fn initial_accumulators<M: StateSpaceModel>(model: &M, states: &[M::State]) -> Result<Vec<f64>> {
    states
        .iter()
        .map(|x| checked_increment(model, 0, None, x))
        .collect()
}

/// $O(N)$ smoother following the ancestor links.
#[derive(Clone, Debug, Default)]
pub struct NaiveSmoother {
    values: Vec<f64>,
}

impl NaiveSmoother {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<M: StateSpaceModel> OnlineSmoother<M> for NaiveSmoother {
    fn strategy(&self) -> SmoothingStrategy {
        SmoothingStrategy::Naive
    }

    fn initialize(&mut self, model: &M, states: &[M::State]) -> Result<()> {
        self.values = initial_accumulators(model, states)?;
        Ok(())
    }

    fn update(&mut self, model: &M, transition: &Transition<'_, M::State>) -> Result<()> {
        let t = transition.t;
        self.values = transition
            .ancestors
            .iter()
            .zip(transition.states)
            .map(|(&a, x)| {
                let psi = checked_increment(model, t, Some(&transition.prev_states[a]), x)?;
                Ok(self.values[a] + psi)
            })
            .collect::<Result<Vec<f64>>>()?;
        Ok(())
    }

    fn accumulators(&self) -> &[f64] {
        &self.values
    }
}

/// $O(N^2)$ smoother reweighting every pair of consecutive particles.
#[derive(Clone, Debug, Default)]
pub struct ExactSmoother {
    values: Vec<f64>,
    parallel: bool,
}

impl ExactSmoother {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spread the per-particle updates over the rayon thread pool. Results are
    /// identical to the sequential loop.
    pub fn parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    fn update_one<M: TransitionDensity>(
        &self,
        model: &M,
        transition: &Transition<'_, M::State>,
        x: &M::State,
    ) -> Result<f64> {
        let t = transition.t;
        let mut log_backward = Vec::with_capacity(transition.prev_states.len());
        for (xp, lw) in transition
            .prev_states
            .iter()
            .zip(transition.prev_log_weights)
        {
            let log_density = model.transition_logdensity(t, xp, x);
            if log_density.is_nan() || log_density == f64::INFINITY {
                return Err(SmcError::contract(
                    t,
                    format!("transition log-density is {log_density}"),
                ));
            }
            log_backward.push(lw + log_density);
        }
        let lse = log_sum_exp(&log_backward);
        if !lse.is_finite() {
            return Err(SmcError::contract(
                t,
                "particle is unreachable from every predecessor under the transition density",
            ));
        }
        let mut value = 0.0;
        for ((xp, s), lb) in transition
            .prev_states
            .iter()
            .zip(&self.values)
            .zip(&log_backward)
        {
            let weight = (lb - lse).exp();
            if weight > 0.0 {
                value += weight * (s + checked_increment(model, t, Some(xp), x)?);
            }
        }
        Ok(value)
    }
}

impl<M: TransitionDensity> OnlineSmoother<M> for ExactSmoother {
    fn strategy(&self) -> SmoothingStrategy {
        SmoothingStrategy::Exact
    }

    fn initialize(&mut self, model: &M, states: &[M::State]) -> Result<()> {
        self.values = initial_accumulators(model, states)?;
        Ok(())
    }

    fn update(&mut self, model: &M, transition: &Transition<'_, M::State>) -> Result<()> {
        let values = if self.parallel {
            transition
                .states
                .par_iter()
                .map(|x| self.update_one(model, transition, x))
                .collect::<Result<Vec<f64>>>()?
        } else {
            transition
                .states
                .iter()
                .map(|x| self.update_one(model, transition, x))
                .collect::<Result<Vec<f64>>>()?
        };
        self.values = values;
        Ok(())
    }

    fn accumulators(&self) -> &[f64] {
        &self.values
    }
}

/// Either smoother, chosen at runtime.
#[derive(Clone, Debug)]
pub enum Smoother {
    Exact(ExactSmoother),
    Naive(NaiveSmoother),
}

impl Smoother {
    pub fn new(strategy: SmoothingStrategy, parallel: bool) -> Self {
        match strategy {
            SmoothingStrategy::Exact => Smoother::Exact(ExactSmoother::new().parallel(parallel)),
            SmoothingStrategy::Naive => Smoother::Naive(NaiveSmoother::new()),
        }
    }
}

impl<M: TransitionDensity> OnlineSmoother<M> for Smoother {
    fn strategy(&self) -> SmoothingStrategy {
        match self {
            Smoother::Exact(_) => SmoothingStrategy::Exact,
            Smoother::Naive(_) => SmoothingStrategy::Naive,
        }
    }

    fn initialize(&mut self, model: &M, states: &[M::State]) -> Result<()> {
        match self {
            Smoother::Exact(s) => OnlineSmoother::<M>::initialize(s, model, states),
            Smoother::Naive(s) => OnlineSmoother::<M>::initialize(s, model, states),
        }
    }

    fn update(&mut self, model: &M, transition: &Transition<'_, M::State>) -> Result<()> {
        match self {
            Smoother::Exact(s) => OnlineSmoother::<M>::update(s, model, transition),
            Smoother::Naive(s) => OnlineSmoother::<M>::update(s, model, transition),
        }
    }

    fn accumulators(&self) -> &[f64] {
        match self {
            Smoother::Exact(s) => &s.values,
            Smoother::Naive(s) => &s.values,
        }
    }
}
