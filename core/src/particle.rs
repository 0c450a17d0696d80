//! Weighted particle population and resampling schemes.
//!
//! The [`ParticleSystem`] stores particles structure-of-arrays style: one
//! vector of states, one of log-weights and a cache of normalized weights.
//! Weights are only ever manipulated in the log domain and normalized through
//! [`log_sum_exp`], so Poisson likelihoods on exponentiated states (which span
//! hundreds of orders of magnitude) neither underflow nor overflow.
//!
//! Resampling returns the drawn ancestor indices so that callers can keep the
//! genealogy and the online smoothers in sync with the population.

use rand::Rng;
use std::fmt::{self, Debug, Display};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SmcError};
use crate::model::StateSpaceModel;

/// Resampling scheme used to turn a weighted population into an unweighted one.
///
/// All schemes are unbiased: the expected number of offspring of particle `n`
/// is `N * W[n]`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
pub enum ParticleResamplingStrategy {
    /// One uniform offset shared by N evenly spaced positions.
    #[default]
    Systematic,
    /// One uniform draw inside each of the N strata `[k/N, (k+1)/N)`.
    Stratified,
    /// N i.i.d. draws from the weight distribution.
    Multinomial,
    /// `floor(N * W[n])` deterministic copies, remainder drawn systematically.
    Residual,
}

impl ParticleResamplingStrategy {
    /// Draw `num_samples` ancestor indices from normalized `weights`.
    pub fn resample<R: Rng + ?Sized>(
        &self,
        weights: &[f64],
        num_samples: usize,
        rng: &mut R,
    ) -> Vec<usize> {
        match self {
            ParticleResamplingStrategy::Systematic => {
                systematic_resample(weights, num_samples, rng)
            }
            ParticleResamplingStrategy::Stratified => {
                stratified_resample(weights, num_samples, rng)
            }
            ParticleResamplingStrategy::Multinomial => {
                multinomial_resample(weights, num_samples, rng)
            }
            ParticleResamplingStrategy::Residual => residual_resample(weights, num_samples, rng),
        }
    }
}

impl Display for ParticleResamplingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ParticleResamplingStrategy::Systematic => "systematic",
            ParticleResamplingStrategy::Stratified => "stratified",
            ParticleResamplingStrategy::Multinomial => "multinomial",
            ParticleResamplingStrategy::Residual => "residual",
        };
        f.write_str(name)
    }
}

impl FromStr for ParticleResamplingStrategy {
    type Err = SmcError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "systematic" => Ok(ParticleResamplingStrategy::Systematic),
            "stratified" => Ok(ParticleResamplingStrategy::Stratified),
            "multinomial" => Ok(ParticleResamplingStrategy::Multinomial),
            "residual" => Ok(ParticleResamplingStrategy::Residual),
            other => Err(SmcError::config(format!(
                "unknown resampling scheme '{other}'"
            ))),
        }
    }
}

/// `log(sum(exp(values)))` without overflow or underflow.
///
/// Returns `-inf` for an empty slice or when every entry is `-inf`.
pub fn log_sum_exp(values: &[f64]) -> f64 {
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return max;
    }
    let sum: f64 = values.iter().map(|v| (v - max).exp()).sum();
    max + sum.ln()
}

/// Exponentiate and normalize log-weights. Returns the normalized weights and
/// the log of their original sum.
pub fn exp_and_normalize(log_weights: &[f64]) -> (Vec<f64>, f64) {
    let lse = log_sum_exp(log_weights);
    let weights = log_weights.iter().map(|lw| (lw - lse).exp()).collect();
    (weights, lse)
}

/// Walk the cumulative weights once for a sorted sequence of positions in `[0, 1)`.
fn inverse_cdf(sorted_positions: impl Iterator<Item = f64>, weights: &[f64]) -> Vec<usize> {
    // Rounding may leave the cumulative sum slightly below 1; never step onto a
    // trailing zero-weight particle because of it.
    let last = weights.iter().rposition(|&w| w > 0.0).unwrap_or(0);
    let mut indices = Vec::with_capacity(weights.len());
    let mut j = 0;
    let mut cumsum = weights.first().copied().unwrap_or(0.0);
    for u in sorted_positions {
        while j < last && u >= cumsum {
            j += 1;
            cumsum += weights[j];
        }
        indices.push(j);
    }
    indices
}

/// Systematic resampling: positions `(U + k) / N` with a single `U ~ U[0, 1)`.
pub fn systematic_resample<R: Rng + ?Sized>(
    weights: &[f64],
    num_samples: usize,
    rng: &mut R,
) -> Vec<usize> {
    let u: f64 = rng.random();
    let m = num_samples as f64;
    inverse_cdf((0..num_samples).map(|k| (u + k as f64) / m), weights)
}

/// Stratified resampling: positions `(U_k + k) / N` with independent `U_k`.
pub fn stratified_resample<R: Rng + ?Sized>(
    weights: &[f64],
    num_samples: usize,
    rng: &mut R,
) -> Vec<usize> {
    let m = num_samples as f64;
    let positions: Vec<f64> = (0..num_samples)
        .map(|k| (rng.random::<f64>() + k as f64) / m)
        .collect();
    inverse_cdf(positions.into_iter(), weights)
}

/// Multinomial resampling through sorted uniforms.
pub fn multinomial_resample<R: Rng + ?Sized>(
    weights: &[f64],
    num_samples: usize,
    rng: &mut R,
) -> Vec<usize> {
    let mut positions: Vec<f64> = (0..num_samples).map(|_| rng.random::<f64>()).collect();
    positions.sort_by(|a, b| a.total_cmp(b));
    inverse_cdf(positions.into_iter(), weights)
}

/// Residual resampling: deterministic `floor(N * W[n])` copies, the remaining
/// slots drawn systematically from the normalized residual weights.
pub fn residual_resample<R: Rng + ?Sized>(
    weights: &[f64],
    num_samples: usize,
    rng: &mut R,
) -> Vec<usize> {
    let m = num_samples as f64;
    let mut indices = Vec::with_capacity(num_samples);
    let mut residual: Vec<f64> = Vec::with_capacity(weights.len());
    for (i, &w) in weights.iter().enumerate() {
        let copies = (w * m).floor();
        for _ in 0..copies as usize {
            indices.push(i);
        }
        residual.push(w * m - copies);
    }
    indices.truncate(num_samples);
    let remaining = num_samples - indices.len();
    if remaining > 0 {
        let sum_residual: f64 = residual.iter().sum();
        if sum_residual > 0.0 {
            residual.iter_mut().for_each(|r| *r /= sum_residual);
        } else {
            residual = weights.to_vec();
        }
        indices.extend(systematic_resample(&residual, remaining, rng));
    }
    indices
}

/// A population of `N` weighted particles at one time step.
#[derive(Clone)]
pub struct ParticleSystem<S> {
    states: Vec<S>,
    log_weights: Vec<f64>,
    weights: Vec<f64>,
}

impl<S> Debug for ParticleSystem<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let min_weight = self.weights.iter().copied().fold(f64::INFINITY, f64::min);
        let max_weight = self.weights.iter().copied().fold(0.0, f64::max);
        f.debug_struct("ParticleSystem")
            .field("num_particles", &self.states.len())
            .field("effective_particles", &self.effective_sample_size())
            .field(
                "weight_range",
                &format_args!("[{:.4e}, {:.4e}]", min_weight, max_weight),
            )
            .finish()
    }
}

impl<S> ParticleSystem<S> {
    /// Wrap existing states into a uniformly weighted population.
    pub fn from_states(states: Vec<S>) -> Result<Self> {
        if states.is_empty() {
            return Err(SmcError::config("a particle system needs at least one particle"));
        }
        let n = states.len();
        Ok(ParticleSystem {
            states,
            log_weights: vec![0.0; n],
            weights: vec![1.0 / n as f64; n],
        })
    }

    pub fn num_particles(&self) -> usize {
        self.states.len()
    }

    pub fn states(&self) -> &[S] {
        &self.states
    }

    /// Log-weights, normalized after every reweighting (zero after a reset).
    pub fn log_weights(&self) -> &[f64] {
        &self.log_weights
    }

    /// Normalized weights; always sum to one.
    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    /// `1 / sum(W[n]^2)`, between 1 and N.
    pub fn effective_sample_size(&self) -> f64 {
        let sum_of_squares: f64 = self.weights.iter().map(|w| w * w).sum();
        if sum_of_squares > 0.0 {
            1.0 / sum_of_squares
        } else {
            0.0
        }
    }
}

impl<S: Clone> ParticleSystem<S> {
    /// Draw `num_particles` states from the model's initial distribution, with
    /// uniform weights.
    pub fn initialize<M, R>(model: &M, num_particles: usize, rng: &mut R) -> Result<Self>
    where
        M: StateSpaceModel<State = S>,
        R: Rng + ?Sized,
    {
        let states = (0..num_particles)
            .map(|_| model.sample_initial(rng))
            .collect();
        Self::from_states(states)
    }

    /// Move every particle through the transition kernel.
    pub fn propagate<M, R>(&mut self, t: usize, model: &M, rng: &mut R)
    where
        M: StateSpaceModel<State = S>,
        R: Rng + ?Sized,
    {
        for state in self.states.iter_mut() {
            *state = model.sample_transition(t, state, rng);
        }
    }

    /// Multiply every weight by the observation likelihood of its particle.
    ///
    /// Returns the log-likelihood increment `log(sum_n W[n] * g_t(y_t | x_n))`.
    pub fn reweight<M>(&mut self, t: usize, model: &M, observation: &M::Observation) -> Result<f64>
    where
        M: StateSpaceModel<State = S>,
    {
        let previous_lse = log_sum_exp(&self.log_weights);
        for (state, log_weight) in self.states.iter().zip(self.log_weights.iter_mut()) {
            let log_likelihood = model.observation_loglikelihood(t, state, observation);
            if log_likelihood.is_nan() || log_likelihood == f64::INFINITY {
                return Err(SmcError::contract(
                    t,
                    format!("observation log-likelihood is {log_likelihood}"),
                ));
            }
            *log_weight += log_likelihood;
        }
        let lse = self.normalize(t)?;
        Ok(lse - previous_lse)
    }

    /// Propagate, then reweight against `observation`.
    pub fn propagate_and_weight<M, R>(
        &mut self,
        t: usize,
        model: &M,
        observation: &M::Observation,
        rng: &mut R,
    ) -> Result<f64>
    where
        M: StateSpaceModel<State = S>,
        R: Rng + ?Sized,
    {
        self.propagate(t, model, rng);
        self.reweight(t, model, observation)
    }

    /// Replace the population by `N` copies drawn from the current weights and
    /// reset the weights to uniform. Returns the ancestor of every new particle.
    pub fn resample<R: Rng + ?Sized>(
        &mut self,
        strategy: ParticleResamplingStrategy,
        rng: &mut R,
    ) -> Vec<usize> {
        let n = self.states.len();
        let ancestors = strategy.resample(&self.weights, n, rng);
        self.states = ancestors.iter().map(|&a| self.states[a].clone()).collect();
        self.log_weights.iter_mut().for_each(|lw| *lw = 0.0);
        self.weights.iter_mut().for_each(|w| *w = 1.0 / n as f64);
        ancestors
    }

    fn normalize(&mut self, t: usize) -> Result<f64> {
        let lse = log_sum_exp(&self.log_weights);
        if !lse.is_finite() {
            return Err(SmcError::contract(
                t,
                "every particle has zero likelihood; weights cannot be normalized",
            ));
        }
        for (log_weight, weight) in self.log_weights.iter_mut().zip(self.weights.iter_mut()) {
            *log_weight -= lse;
            *weight = log_weight.exp();
        }
        Ok(lse)
    }
}
