//! Model contracts consumed by the particle filter.
//!
//! A model is split into two capability sets. [`StateSpaceModel`] is all a
//! bootstrap filter needs: it can draw initial states, propagate a state
//! through the transition kernel, score an observation and evaluate the
//! additive increment $\psi_t$. [`TransitionDensity`] adds point-wise
//! evaluation of the transition kernel, which only the exact $O(N^2)$ online
//! smoother requires. Models that can only be simulated from still work with
//! the naive smoother.
//!
//! Every quantity that is a density or a likelihood is exchanged in the log
//! domain.

use rand::Rng;

/// A (possibly time-inhomogeneous) hidden Markov model that can be simulated.
///
/// The generic RNG arguments let callers thread one explicitly seeded
/// generator through a whole run.
pub trait StateSpaceModel: Send + Sync {
    /// Latent state. Opaque to the engine.
    type State: Clone + Send + Sync;
    /// A single observation $y_t$.
    type Observation: Sync;

    /// Draw $x_0$ from the initial distribution.
    fn sample_initial<R: Rng + ?Sized>(&self, rng: &mut R) -> Self::State;

    /// Draw $x_t$ from the transition kernel given $x_{t-1}$.
    fn sample_transition<R: Rng + ?Sized>(
        &self,
        t: usize,
        prev: &Self::State,
        rng: &mut R,
    ) -> Self::State;

    /// $\log g_t(y_t \mid x_t)$.
    fn observation_loglikelihood(
        &self,
        t: usize,
        state: &Self::State,
        observation: &Self::Observation,
    ) -> f64;

    /// The additive increment $\psi_t(x_{t-1}, x_t)$. `prev` is `None` at `t = 0`.
    fn increment(&self, t: usize, prev: Option<&Self::State>, state: &Self::State) -> f64;
}

/// A model whose transition kernel can be evaluated point-wise.
pub trait TransitionDensity: StateSpaceModel {
    /// $\log p_t(x_t \mid x_{t-1})$.
    fn transition_logdensity(&self, t: usize, prev: &Self::State, state: &Self::State) -> f64;
}
