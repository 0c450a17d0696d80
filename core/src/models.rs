//! Reference state-space models.
//!
//! Two scalar models ship with the crate:
//!
//! - [`DiscreteCox`]: a latent Gaussian AR(1) log-intensity observed through
//!   Poisson counts,
//!   $$ X_t - \mu = \phi (X_{t-1} - \mu) + \sigma U_t, \quad Y_t \mid X_t \sim \mathrm{Poisson}(e^{X_t}). $$
//!   Its additive increment is the score of the model with respect to
//!   $\sigma^2$, so $\phi_t$ is the full-data score whose smoothing
//!   expectation is the gradient of the log-likelihood.
//! - [`LinearGaussian`]: the AR(1) model observed with Gaussian noise. Its
//!   smoothing distribution is available in closed form through a Kalman
//!   filter and Rauch-Tung-Striebel smoother, which makes it the ground truth
//!   for checking the particle smoothers.
//!
//! Both implement [`TransitionDensity`] and can simulate datasets.

use std::fmt::{self, Display};

use rand::Rng;
use rand_distr::{Distribution, Poisson, StandardNormal};
use serde::{Deserialize, Serialize};
use statrs::distribution::{Continuous, Normal};
use statrs::function::gamma::ln_gamma;

use crate::error::{Result, SmcError};
use crate::model::{StateSpaceModel, TransitionDensity};

/// NaN for a NaN mean, which the filter reports as a contract violation.
fn normal_logpdf(x: f64, mean: f64, std_dev: f64) -> f64 {
    Normal::new(mean, std_dev).map_or(f64::NAN, |normal| normal.ln_pdf(x))
}

fn check_ar1(phi: f64, sigma: f64) -> Result<()> {
    if !(phi.abs() < 1.0) {
        return Err(SmcError::config(format!(
            "autoregressive coefficient must satisfy |phi| < 1, got {phi}"
        )));
    }
    if !(sigma > 0.0 && sigma.is_finite()) {
        return Err(SmcError::config(format!(
            "noise standard deviation must be positive, got {sigma}"
        )));
    }
    Ok(())
}

/// Discrete Cox process: Gaussian AR(1) log-intensity, Poisson counts.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct DiscreteCox {
    pub mu: f64,
    pub phi: f64,
    pub sigma: f64,
}

impl Default for DiscreteCox {
    fn default() -> Self {
        DiscreteCox {
            mu: 0.0,
            phi: 0.9,
            sigma: 0.5,
        }
    }
}

impl Display for DiscreteCox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "DiscreteCox(mu={}, phi={}, sigma={})",
            self.mu, self.phi, self.sigma
        )
    }
}

impl DiscreteCox {
    pub fn new(mu: f64, phi: f64, sigma: f64) -> Result<Self> {
        check_ar1(phi, sigma)?;
        Ok(DiscreteCox { mu, phi, sigma })
    }

    /// Standard deviation of the stationary distribution, used for $X_0$.
    pub fn stationary_std(&self) -> f64 {
        self.sigma / (1.0 - self.phi * self.phi).sqrt()
    }

    /// Simulate `horizon` latent states and Poisson counts.
    pub fn simulate<R: Rng + ?Sized>(
        &self,
        horizon: usize,
        rng: &mut R,
    ) -> Result<(Vec<f64>, Vec<u64>)> {
        let mut states = Vec::with_capacity(horizon);
        let mut counts = Vec::with_capacity(horizon);
        for t in 0..horizon {
            let x = match states.last() {
                None => self.sample_initial(rng),
                Some(prev) => self.sample_transition(t, prev, rng),
            };
            let intensity = x.exp();
            let count = if intensity > 0.0 {
                let poisson = Poisson::new(intensity)
                    .map_err(|e| SmcError::contract(t, format!("invalid Poisson rate: {e}")))?;
                poisson.sample(rng) as u64
            } else {
                0
            };
            states.push(x);
            counts.push(count);
        }
        Ok((states, counts))
    }
}

impl StateSpaceModel for DiscreteCox {
    type State = f64;
    type Observation = u64;

    fn sample_initial<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        let z: f64 = rng.sample(StandardNormal);
        self.mu + self.stationary_std() * z
    }

    fn sample_transition<R: Rng + ?Sized>(&self, _t: usize, prev: &f64, rng: &mut R) -> f64 {
        let z: f64 = rng.sample(StandardNormal);
        self.mu + self.phi * (prev - self.mu) + self.sigma * z
    }

    fn observation_loglikelihood(&self, _t: usize, state: &f64, observation: &u64) -> f64 {
        let y = *observation as f64;
        y * state - state.exp() - ln_gamma(y + 1.0)
    }

    fn increment(&self, _t: usize, prev: Option<&f64>, state: &f64) -> f64 {
        let sigma2 = self.sigma * self.sigma;
        let sigma4 = sigma2 * sigma2;
        match prev {
            None => {
                -0.5 / sigma2
                    + 0.5 * (1.0 - self.phi * self.phi) / sigma4 * (state - self.mu).powi(2)
            }
            Some(xp) => {
                -0.5 / sigma2
                    + 0.5 / sigma4 * ((state - self.mu) - self.phi * (xp - self.mu)).powi(2)
            }
        }
    }
}

impl TransitionDensity for DiscreteCox {
    fn transition_logdensity(&self, _t: usize, prev: &f64, state: &f64) -> f64 {
        normal_logpdf(*state, self.mu + self.phi * (prev - self.mu), self.sigma)
    }
}

/// Scalar linear-Gaussian model:
/// $X_t = \rho X_{t-1} + \sigma_X U_t$, $Y_t = X_t + \sigma_Y V_t$.
///
/// The additive functional is the sum of the states, $\psi_t(x_{t-1}, x_t) = x_t$.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct LinearGaussian {
    pub rho: f64,
    pub sigma_x: f64,
    pub sigma_y: f64,
    /// Standard deviation of $X_0$ (mean zero).
    pub sigma_0: f64,
}

impl Default for LinearGaussian {
    fn default() -> Self {
        LinearGaussian {
            rho: 0.9,
            sigma_x: 1.0,
            sigma_y: 0.2,
            sigma_0: 1.0 / (1.0f64 - 0.81).sqrt(),
        }
    }
}

/// Kalman filter output for one time step.
#[derive(Clone, Copy, Debug)]
struct KalmanStep {
    predicted_mean: f64,
    predicted_var: f64,
    filtered_mean: f64,
    filtered_var: f64,
}

impl LinearGaussian {
    /// Stationary initial distribution.
    pub fn new(rho: f64, sigma_x: f64, sigma_y: f64) -> Result<Self> {
        check_ar1(rho, sigma_x)?;
        if !(sigma_y > 0.0 && sigma_y.is_finite()) {
            return Err(SmcError::config(format!(
                "observation noise must be positive, got {sigma_y}"
            )));
        }
        Ok(LinearGaussian {
            rho,
            sigma_x,
            sigma_y,
            sigma_0: sigma_x / (1.0 - rho * rho).sqrt(),
        })
    }

    pub fn with_initial_std(mut self, sigma_0: f64) -> Self {
        self.sigma_0 = sigma_0;
        self
    }

    /// Simulate `horizon` latent states and observations.
    pub fn simulate<R: Rng + ?Sized>(&self, horizon: usize, rng: &mut R) -> (Vec<f64>, Vec<f64>) {
        let mut states: Vec<f64> = Vec::with_capacity(horizon);
        let mut observations = Vec::with_capacity(horizon);
        for t in 0..horizon {
            let x = match states.last() {
                None => self.sample_initial(rng),
                Some(prev) => self.sample_transition(t, prev, rng),
            };
            let noise: f64 = rng.sample(StandardNormal);
            states.push(x);
            observations.push(x + self.sigma_y * noise);
        }
        (states, observations)
    }

    fn kalman_filter(&self, data: &[f64]) -> Vec<KalmanStep> {
        let mut steps: Vec<KalmanStep> = Vec::with_capacity(data.len());
        let observation_var = self.sigma_y * self.sigma_y;
        for y in data {
            let (predicted_mean, predicted_var) = match steps.last() {
                None => (0.0, self.sigma_0 * self.sigma_0),
                Some(prev) => (
                    self.rho * prev.filtered_mean,
                    self.rho * self.rho * prev.filtered_var + self.sigma_x * self.sigma_x,
                ),
            };
            let gain = predicted_var / (predicted_var + observation_var);
            steps.push(KalmanStep {
                predicted_mean,
                predicted_var,
                filtered_mean: predicted_mean + gain * (y - predicted_mean),
                filtered_var: (1.0 - gain) * predicted_var,
            });
        }
        steps
    }

    /// $E[X_t \mid y_{0:T-1}]$ for every `t`, via the Rauch-Tung-Striebel recursion.
    pub fn smoothed_means(&self, data: &[f64]) -> Vec<f64> {
        let steps = self.kalman_filter(data);
        let mut smoothed: Vec<f64> = steps.iter().map(|s| s.filtered_mean).collect();
        for t in (0..steps.len().saturating_sub(1)).rev() {
            let next = &steps[t + 1];
            let gain = steps[t].filtered_var * self.rho / next.predicted_var;
            smoothed[t] = steps[t].filtered_mean + gain * (smoothed[t + 1] - next.predicted_mean);
        }
        smoothed
    }

    /// Exact smoothing expectation of $\sum_t X_t$ given all of `data`.
    pub fn smoothed_additive_expectation(&self, data: &[f64]) -> f64 {
        self.smoothed_means(data).iter().sum()
    }

    /// Exact log-likelihood $\log p(y_{0:T-1})$.
    pub fn log_likelihood(&self, data: &[f64]) -> f64 {
        let observation_var = self.sigma_y * self.sigma_y;
        self.kalman_filter(data)
            .iter()
            .zip(data)
            .map(|(step, y)| {
                normal_logpdf(
                    *y,
                    step.predicted_mean,
                    (step.predicted_var + observation_var).sqrt(),
                )
            })
            .sum()
    }
}

impl StateSpaceModel for LinearGaussian {
    type State = f64;
    type Observation = f64;

    fn sample_initial<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        let z: f64 = rng.sample(StandardNormal);
        self.sigma_0 * z
    }

    fn sample_transition<R: Rng + ?Sized>(&self, _t: usize, prev: &f64, rng: &mut R) -> f64 {
        let z: f64 = rng.sample(StandardNormal);
        self.rho * prev + self.sigma_x * z
    }

    fn observation_loglikelihood(&self, _t: usize, state: &f64, observation: &f64) -> f64 {
        normal_logpdf(*observation, *state, self.sigma_y)
    }

    fn increment(&self, _t: usize, _prev: Option<&f64>, state: &f64) -> f64 {
        *state
    }
}

impl TransitionDensity for LinearGaussian {
    fn transition_logdensity(&self, _t: usize, prev: &f64, state: &f64) -> f64 {
        normal_logpdf(*state, self.rho * prev, self.sigma_x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn invalid_parameters_are_rejected() {
        assert!(DiscreteCox::new(0.0, 1.0, 0.5).is_err());
        assert!(DiscreteCox::new(0.0, 0.5, 0.0).is_err());
        assert!(LinearGaussian::new(0.5, 1.0, -1.0).is_err());
        assert!(LinearGaussian::new(f64::NAN, 1.0, 1.0).is_err());
    }

    #[test]
    fn default_linear_gaussian_is_stationary() {
        let model = LinearGaussian::default();
        let built = LinearGaussian::new(0.9, 1.0, 0.2).unwrap();
        assert_approx_eq!(model.sigma_0, built.sigma_0, 1e-12);
    }

    #[test]
    fn poisson_loglikelihood_matches_pmf() {
        let model = DiscreteCox::default();
        // log P(Y = 3 | lambda = e^0.5)
        let lambda = 0.5f64.exp();
        let expected = (lambda.powi(3) * (-lambda).exp() / 6.0).ln();
        assert_approx_eq!(model.observation_loglikelihood(0, &0.5, &3), expected, 1e-10);
    }

    #[test]
    fn poisson_loglikelihood_handles_large_counts() {
        let model = DiscreteCox::default();
        let count = 500_000_000u64;
        let y = count as f64;
        let state = y.ln();
        // Stirling series for ln(y!)
        let ln_factorial = y * y.ln() - y + 0.5 * (2.0 * std::f64::consts::PI * y).ln() + 1.0 / (12.0 * y);
        let expected = y * state - state.exp() - ln_factorial;
        let value = model.observation_loglikelihood(0, &state, &count);
        assert!(value.is_finite());
        assert_approx_eq!(value, expected, 1e-3);
    }

    #[test]
    fn gaussian_density_with_nan_mean_is_nan() {
        let model = LinearGaussian::default();
        assert!(model.transition_logdensity(1, &f64::NAN, &0.0).is_nan());
    }

    #[test]
    fn cox_score_increment() {
        let model = DiscreteCox::default();
        // sigma^2 = 0.25: -2 + 8 * (x - phi * xp)^2
        assert_approx_eq!(model.increment(1, Some(&1.0), &0.9), -2.0, 1e-12);
        assert_approx_eq!(model.increment(1, Some(&0.0), &0.5), 0.0, 1e-12);
        // t = 0 uses the stationary variance: -2 + 8 * 0.19 * x^2
        assert_approx_eq!(model.increment(0, None, &1.0), -2.0 + 1.52, 1e-12);
    }

    #[test]
    fn transition_density_integrates_to_one() {
        let model = DiscreteCox::default();
        let step = 1e-3;
        let total: f64 = (-8000..8000)
            .map(|i| model.transition_logdensity(1, &0.3, &(i as f64 * step)).exp() * step)
            .sum();
        assert_approx_eq!(total, 1.0, 1e-6);
    }

    #[test]
    fn simulation_has_requested_length() {
        let mut rng = StdRng::seed_from_u64(8);
        let (states, counts) = DiscreteCox::default().simulate(250, &mut rng).unwrap();
        assert_eq!(states.len(), 250);
        assert_eq!(counts.len(), 250);
        let (states, observations) = LinearGaussian::default().simulate(30, &mut rng);
        assert_eq!(states.len(), 30);
        assert_eq!(observations.len(), 30);
    }

    #[test]
    fn rts_single_observation_matches_conjugate_update() {
        let model = LinearGaussian::new(0.5, 1.0, 1.0).unwrap().with_initial_std(1.0);
        // Prior N(0, 1), likelihood N(y; x, 1): posterior mean y / 2.
        let means = model.smoothed_means(&[2.0]);
        assert_approx_eq!(means[0], 1.0, 1e-12);
    }

    #[test]
    fn rts_two_steps_matches_direct_computation() {
        let model = LinearGaussian::new(0.5, 1.0, 1.0).unwrap().with_initial_std(1.0);
        let data = [1.0, 3.0];
        // Joint prior of (X0, X1): var X0 = 1, cov = 0.5, var X1 = 1.25.
        // Posterior mean = S (S + I)^{-1} y with S the prior covariance.
        let (a, b, d) = (1.0, 0.5, 1.25);
        let (p, q, s) = (a + 1.0, b, d + 1.0);
        let det = p * s - q * q;
        let inv = [[s / det, -q / det], [-q / det, p / det]];
        let w = [
            inv[0][0] * data[0] + inv[0][1] * data[1],
            inv[1][0] * data[0] + inv[1][1] * data[1],
        ];
        let expected = [a * w[0] + b * w[1], b * w[0] + d * w[1]];
        let means = model.smoothed_means(&data);
        assert_approx_eq!(means[0], expected[0], 1e-12);
        assert_approx_eq!(means[1], expected[1], 1e-12);
        assert_approx_eq!(
            model.smoothed_additive_expectation(&data),
            expected[0] + expected[1],
            1e-12
        );
    }

    #[test]
    fn kalman_log_likelihood_single_step() {
        let model = LinearGaussian::new(0.5, 1.0, 1.0).unwrap().with_initial_std(1.0);
        // Marginal of Y0 is N(0, 2).
        let expected = normal_logpdf(0.7, 0.0, 2f64.sqrt());
        assert_approx_eq!(model.log_likelihood(&[0.7]), expected, 1e-12);
    }
}
