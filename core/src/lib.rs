//! Sequential Monte Carlo filtering and online smoothing of additive functionals
//!
//! This crate runs a bootstrap particle filter over a hidden-Markov (state-space) model and, alongside it,
//! computes online estimates of smoothing expectations of additive functionals. It is built to compare two
//! online smoothers: an exact forward-summation smoother whose per-step cost is quadratic in the number of
//! particles, and a naive genealogy-tracking smoother whose cost is linear but whose variance grows with the
//! horizon because of path degeneracy. The particle genealogy is recorded so that ancestry trees and their
//! coalescence can be inspected.
//!
//! The crate is built on top of a small set of dependencies:
//! - [`rand`](https://crates.io/crates/rand) and [`rand_distr`](https://crates.io/crates/rand_distr): random number generation for simulation, propagation and resampling.
//! - [`nalgebra`](https://crates.io/crates/nalgebra): matrices for genealogies and replication summaries.
//! - [`rayon`](https://crates.io/crates/rayon): data parallelism for the quadratic smoother and for independent replications.
//! - [`serde`](https://crates.io/crates/serde) with JSON, YAML and TOML back ends, and [`csv`](https://crates.io/crates/csv): configuration and result I/O.
//!
//! ## Crate overview
//!
//! - [model]: the capabilities a model supplies to the filter ([StateSpaceModel], [TransitionDensity]).
//! - [models]: concrete models, a discretely observed Cox process and a linear Gaussian model with a Kalman reference.
//! - [particle]: weighted particle populations, log-domain normalization and resampling schemes.
//! - [genealogy]: ancestor bookkeeping, lineages and coalescence.
//! - [smoothing]: the exact and naive online smoothers.
//! - [filter]: the bootstrap filter driver and its run result.
//! - [config]: run configuration and its file formats.
//! - [sim]: independent replications, percentile summaries and CSV export.
//!
//! ## Model and additive functional
//!
//! A state-space model is given by an initial distribution $X_0 \sim p_0$, a Markov transition
//! $X_t \mid X_{t-1} \sim p_t(\cdot \mid x_{t-1})$ and an observation density $g_t(y_t \mid x_t)$. The quantity of
//! interest is the smoothing expectation of an additive functional
//!
//! $$
//! \varphi_t = \mathbb{E}\left[ \sum_{s=0}^{t} \psi_s(X_{s-1}, X_s) \mid Y_{0:t} = y_{0:t} \right]
//! $$
//!
//! where $\psi_0$ only depends on $X_0$.
//!
//! ## Bootstrap filter
//!
//! Weights are kept in the log domain and normalized with the log-sum-exp trick. At step $t \geq 1$ ancestors
//! $A_t^n$ are drawn from the weights of step $t-1$, particles move as $X_t^n \sim p_t(\cdot \mid X_{t-1}^{A_t^n})$
//! and are reweighted with $\log g_t(y_t \mid X_t^n)$. The increment of the log-likelihood estimate is
//!
//! $$
//! \log \hat{p}(y_t \mid y_{0:t-1}) = \log \sum_n \exp(\tilde{w}_t^n) - \log \sum_n \exp(w_{t-1}^n)
//! $$
//!
//! with $\tilde{w}_t^n$ the unnormalized log-weights after reweighting and $w_{t-1}^n$ the log-weights the step
//! started from.
//!
//! ## Online smoothers
//!
//! The exact smoother keeps one accumulator per particle and updates it by averaging over every previous particle:
//!
//! $$
//! \Phi_t^n = \frac{\sum_m W_{t-1}^m \, p_t(X_t^n \mid X_{t-1}^m) \left[ \Phi_{t-1}^m + \psi_t(X_{t-1}^m, X_t^n) \right]}{\sum_m W_{t-1}^m \, p_t(X_t^n \mid X_{t-1}^m)}
//! $$
//!
//! The naive smoother only follows the sampled ancestor:
//!
//! $$
//! \Phi_t^n = \Phi_{t-1}^{A_t^n} + \psi_t(X_{t-1}^{A_t^n}, X_t^n)
//! $$
//!
//! In both cases the estimate is $\hat{\varphi}_t = \sum_n W_t^n \Phi_t^n$.

pub mod config;
pub mod error;
pub mod filter;
pub mod genealogy;
pub mod model;
pub mod models;
pub mod particle;
pub mod sim;
pub mod smoothing;

pub use config::SmcConfig;
pub use error::{Result, SmcError};
pub use filter::{BootstrapFilter, RunResult, run, run_samplable, run_with_smoother};
pub use genealogy::Genealogy;
pub use model::{StateSpaceModel, TransitionDensity};
pub use models::{DiscreteCox, LinearGaussian};
pub use particle::{ParticleResamplingStrategy, ParticleSystem};
pub use smoothing::{ExactSmoother, NaiveSmoother, OnlineSmoother, Smoother, SmoothingStrategy};
