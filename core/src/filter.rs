//! Bootstrap filter driver.
//!
//! [`BootstrapFilter`] runs one complete pass over `T` observations. Step 0
//! draws the particles from the initial distribution and weights them by the
//! first observation. Every later step `t`:
//!
//! 1. decides, from the weights of step `t - 1`, whether to resample, and if
//!    so draws the ancestor indices (otherwise every particle is its own
//!    ancestor);
//! 2. moves each particle through the transition kernel and adds the
//!    observation log-likelihood to its log-weight;
//! 3. feeds the previous ensemble, the ancestors and the new particles to the
//!    online smoother;
//! 4. records the ancestors in the genealogy when history is kept.
//!
//! The driver owns the particle system, the genealogy and the run's random
//! number generator. It returns a [`RunResult`]; it never prints anything and
//! only emits `debug`/`trace` log records.

use std::time::{Duration, Instant};

use log::{debug, trace};
use rand::SeedableRng;
use rand::rngs::StdRng;

use crate::config::SmcConfig;
use crate::error::{Result, SmcError};
use crate::genealogy::Genealogy;
use crate::model::{StateSpaceModel, TransitionDensity};
use crate::particle::ParticleSystem;
use crate::smoothing::{
    NaiveSmoother, OnlineSmoother, Smoother, SmoothingStrategy, Transition,
};

/// An effective sample size this close to one means a single particle holds
/// all the weight.
const DEGENERATE_ESS: f64 = 1.0 + 1e-6;

/// Outcome of one run.
#[derive(Clone, Debug)]
pub struct RunResult<S> {
    /// Smoothing estimate at the last step.
    pub final_estimate: f64,
    /// Smoothing estimate at every step, length `T`.
    pub estimates: Vec<f64>,
    /// Effective sample size after weighting at every step, length `T`.
    pub ess_sequence: Vec<f64>,
    /// Whether the population was resampled before propagating at each step.
    pub resampled: Vec<bool>,
    /// Number of steps where all the weight sat on a single particle.
    pub degenerate_steps: usize,
    /// Estimate of $\log p(y_{0:T-1})$.
    pub log_likelihood: f64,
    /// Seconds spent inside the filter steps.
    pub cpu_time: f64,
    pub strategy: SmoothingStrategy,
    pub num_particles: usize,
    /// Full ancestry, when `store_history` was set.
    pub genealogy: Option<Genealogy<S>>,
}

/// A bootstrap particle filter coupled with an online smoother.
pub struct BootstrapFilter<'a, M: StateSpaceModel, Sm> {
    model: &'a M,
    data: &'a [M::Observation],
    config: SmcConfig,
    smoother: Sm,
    rng: StdRng,
    particles: Option<ParticleSystem<M::State>>,
    genealogy: Option<Genealogy<M::State>>,
    t: usize,
    estimates: Vec<f64>,
    ess_sequence: Vec<f64>,
    resampled: Vec<bool>,
    degenerate_steps: usize,
    log_likelihood: f64,
    elapsed: Duration,
    /// Step whose error aborted the run.
    failed_at: Option<usize>,
}

impl<'a, M, Sm> BootstrapFilter<'a, M, Sm>
where
    M: StateSpaceModel,
    Sm: OnlineSmoother<M>,
{
    /// Validate `config` against `data` and seed the run's generator.
    pub fn new(
        config: SmcConfig,
        model: &'a M,
        data: &'a [M::Observation],
        smoother: Sm,
    ) -> Result<Self> {
        config.validate()?;
        if data.len() < config.horizon {
            return Err(SmcError::config(format!(
                "horizon {} exceeds the {} available observations",
                config.horizon,
                data.len()
            )));
        }
        let rng = StdRng::seed_from_u64(config.seed);
        let horizon = config.horizon;
        Ok(BootstrapFilter {
            model,
            data,
            config,
            smoother,
            rng,
            particles: None,
            genealogy: None,
            t: 0,
            estimates: Vec::with_capacity(horizon),
            ess_sequence: Vec::with_capacity(horizon),
            resampled: Vec::with_capacity(horizon),
            degenerate_steps: 0,
            log_likelihood: 0.0,
            elapsed: Duration::ZERO,
            failed_at: None,
        })
    }

    /// Number of steps completed so far.
    pub fn steps_done(&self) -> usize {
        self.t
    }

    pub fn is_finished(&self) -> bool {
        self.t >= self.config.horizon
    }

    /// Current particle population, once step 0 has run.
    pub fn particles(&self) -> Option<&ParticleSystem<M::State>> {
        self.particles.as_ref()
    }

    /// Smoothing estimate of the last completed step.
    pub fn current_estimate(&self) -> Option<f64> {
        self.estimates.last().copied()
    }

    /// Whether an earlier step returned an error.
    pub fn is_failed(&self) -> bool {
        self.failed_at.is_some()
    }

    /// Run a single time step. Returns `false` once the horizon is reached.
    ///
    /// An error aborts the run: every later call to `step` or
    /// [`Self::finish`] returns an error as well.
    pub fn step(&mut self) -> Result<bool> {
        self.ensure_not_failed()?;
        if self.is_finished() {
            return Ok(false);
        }
        let started = Instant::now();
        let t = self.t;
        let outcome = match self.particles.take() {
            None => self
                .start()
                .map(|(particles, log_increment)| (particles, log_increment, false)),
            Some(particles) => self.advance(t, particles),
        };
        let (particles, log_increment, resampled) = match outcome {
            Ok(advanced) => advanced,
            Err(e) => {
                self.failed_at = Some(t);
                return Err(e);
            }
        };

        let ess = particles.effective_sample_size();
        if ess < DEGENERATE_ESS {
            self.degenerate_steps += 1;
            debug!("step {t}: weights collapsed onto a single particle");
        }
        let estimate = self.smoother.estimate(particles.weights());
        trace!("step {t}: ess={ess:.2} resampled={resampled} estimate={estimate:.6}");

        self.log_likelihood += log_increment;
        self.ess_sequence.push(ess);
        self.estimates.push(estimate);
        self.resampled.push(resampled);
        self.particles = Some(particles);
        self.t += 1;
        self.elapsed += started.elapsed();
        Ok(!self.is_finished())
    }

    /// Run every remaining step and collect the result.
    pub fn run(mut self) -> Result<RunResult<M::State>> {
        debug!(
            "running {} smoother with N={} over T={} steps (seed {})",
            self.smoother.strategy(),
            self.config.num_particles,
            self.config.horizon,
            self.config.seed
        );
        while self.step()? {}
        self.finish()
    }

    /// Collect the result of a run whose steps were driven with [`Self::step`].
    pub fn finish(self) -> Result<RunResult<M::State>> {
        self.ensure_not_failed()?;
        if !self.is_finished() {
            return Err(SmcError::config(format!(
                "run stopped after {} of {} steps",
                self.t, self.config.horizon
            )));
        }
        let cpu_time = self.elapsed.as_secs_f64();
        debug!(
            "run finished in {cpu_time:.3}s, log-likelihood {:.4}",
            self.log_likelihood
        );
        Ok(RunResult {
            final_estimate: self.estimates.last().copied().unwrap_or(f64::NAN),
            estimates: self.estimates,
            ess_sequence: self.ess_sequence,
            resampled: self.resampled,
            degenerate_steps: self.degenerate_steps,
            log_likelihood: self.log_likelihood,
            cpu_time,
            strategy: self.smoother.strategy(),
            num_particles: self.config.num_particles,
            genealogy: self.genealogy,
        })
    }

    fn ensure_not_failed(&self) -> Result<()> {
        match self.failed_at {
            Some(step) => Err(SmcError::config(format!(
                "run was aborted by an error at step {step}"
            ))),
            None => Ok(()),
        }
    }

    /// Step 0: initial draw, first weighting, smoother and genealogy set-up.
    fn start(&mut self) -> Result<(ParticleSystem<M::State>, f64)> {
        let mut particles =
            ParticleSystem::initialize(self.model, self.config.num_particles, &mut self.rng)?;
        let log_increment = particles.reweight(0, self.model, &self.data[0])?;
        self.smoother.initialize(self.model, particles.states())?;
        if self.config.store_history {
            self.genealogy = Some(Genealogy::new(particles.states().to_vec()));
        }
        Ok((particles, log_increment))
    }

    fn advance(
        &mut self,
        t: usize,
        mut particles: ParticleSystem<M::State>,
    ) -> Result<(ParticleSystem<M::State>, f64, bool)> {
        let prev_states = particles.states().to_vec();
        let prev_log_weights = particles.log_weights().to_vec();
        let resample = self.config.should_resample(particles.effective_sample_size());
        let ancestors: Vec<usize> = if resample {
            particles.resample(self.config.resampling_scheme, &mut self.rng)
        } else {
            (0..particles.num_particles()).collect()
        };
        let log_increment =
            particles.propagate_and_weight(t, self.model, &self.data[t], &mut self.rng)?;
        self.smoother.update(
            self.model,
            &Transition {
                t,
                prev_states: &prev_states,
                prev_log_weights: &prev_log_weights,
                ancestors: &ancestors,
                states: particles.states(),
            },
        )?;
        if let Some(genealogy) = self.genealogy.as_mut() {
            genealogy.record(t, ancestors, particles.states().to_vec())?;
        }
        Ok((particles, log_increment, resample))
    }
}

/// Run the filter with the smoother named in `config`.
pub fn run<M: TransitionDensity>(
    config: &SmcConfig,
    model: &M,
    data: &[M::Observation],
) -> Result<RunResult<M::State>> {
    let smoother = Smoother::new(config.smoothing_strategy, config.parallel);
    BootstrapFilter::new(config.clone(), model, data, smoother)?.run()
}

/// Run the filter for a model without a transition density. Only the naive
/// smoother is available.
pub fn run_samplable<M: StateSpaceModel>(
    config: &SmcConfig,
    model: &M,
    data: &[M::Observation],
) -> Result<RunResult<M::State>> {
    config.validate()?;
    if config.smoothing_strategy == SmoothingStrategy::Exact {
        return Err(SmcError::contract(
            0,
            "the exact smoother needs a transition density, which this model does not expose",
        ));
    }
    BootstrapFilter::new(config.clone(), model, data, NaiveSmoother::new())?.run()
}

/// Run the filter with a caller-provided smoother.
pub fn run_with_smoother<M, Sm>(
    config: &SmcConfig,
    model: &M,
    data: &[M::Observation],
    smoother: Sm,
) -> Result<RunResult<M::State>>
where
    M: StateSpaceModel,
    Sm: OnlineSmoother<M>,
{
    BootstrapFilter::new(config.clone(), model, data, smoother)?.run()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DiscreteCox, LinearGaussian};
    use crate::smoothing::ExactSmoother;
    use assert_approx_eq::assert_approx_eq;
    use rand::Rng;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Same dynamics as the linear-Gaussian model, without a density.
    struct SamplerOnly(LinearGaussian);

    impl StateSpaceModel for SamplerOnly {
        type State = f64;
        type Observation = f64;

        fn sample_initial<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
            self.0.sample_initial(rng)
        }
        fn sample_transition<R: Rng + ?Sized>(&self, t: usize, prev: &f64, rng: &mut R) -> f64 {
            self.0.sample_transition(t, prev, rng)
        }
        fn observation_loglikelihood(&self, t: usize, state: &f64, y: &f64) -> f64 {
            self.0.observation_loglikelihood(t, state, y)
        }
        fn increment(&self, t: usize, prev: Option<&f64>, state: &f64) -> f64 {
            self.0.increment(t, prev, state)
        }
    }

    /// Linear-Gaussian model whose likelihood is NaN the first time step
    /// `fail_at` is weighted.
    struct FailsOnce {
        inner: LinearGaussian,
        fail_at: usize,
        tripped: AtomicBool,
    }

    impl StateSpaceModel for FailsOnce {
        type State = f64;
        type Observation = f64;

        fn sample_initial<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
            self.inner.sample_initial(rng)
        }
        fn sample_transition<R: Rng + ?Sized>(&self, t: usize, prev: &f64, rng: &mut R) -> f64 {
            self.inner.sample_transition(t, prev, rng)
        }
        fn observation_loglikelihood(&self, t: usize, state: &f64, y: &f64) -> f64 {
            if t == self.fail_at && !self.tripped.swap(true, Ordering::SeqCst) {
                return f64::NAN;
            }
            self.inner.observation_loglikelihood(t, state, y)
        }
        fn increment(&self, t: usize, prev: Option<&f64>, state: &f64) -> f64 {
            self.inner.increment(t, prev, state)
        }
    }

    fn cox_data(horizon: usize) -> (DiscreteCox, Vec<u64>) {
        let model = DiscreteCox::default();
        let mut rng = StdRng::seed_from_u64(2024);
        let (_, counts) = model.simulate(horizon, &mut rng).unwrap();
        (model, counts)
    }

    #[test]
    fn result_sequences_have_horizon_length() {
        let (model, data) = cox_data(30);
        let config = SmcConfig {
            num_particles: 50,
            horizon: 30,
            ..SmcConfig::default()
        };
        let result = run(&config, &model, &data).unwrap();
        assert_eq!(result.estimates.len(), 30);
        assert_eq!(result.ess_sequence.len(), 30);
        assert_eq!(result.resampled.len(), 30);
        assert_eq!(result.final_estimate, *result.estimates.last().unwrap());
        assert!(!result.resampled[0]);
        assert!(result.resampled[1..].iter().all(|&r| r));
        assert!(result.log_likelihood.is_finite());
        assert!(result.cpu_time >= 0.0);
        assert!(result.genealogy.is_none());
        assert_eq!(result.strategy, SmoothingStrategy::Exact);
        for ess in &result.ess_sequence {
            assert!(*ess >= 1.0 - 1e-9 && *ess <= 50.0 + 1e-6);
        }
    }

    #[test]
    fn same_seed_is_bit_identical() {
        let (model, data) = cox_data(100);
        for strategy in [SmoothingStrategy::Exact, SmoothingStrategy::Naive] {
            let config = SmcConfig {
                num_particles: 100,
                horizon: 100,
                smoothing_strategy: strategy,
                seed: 99,
                ..SmcConfig::default()
            };
            let a = run(&config, &model, &data).unwrap();
            let b = run(&config, &model, &data).unwrap();
            assert_eq!(a.final_estimate.to_bits(), b.final_estimate.to_bits());
            assert_eq!(a.ess_sequence, b.ess_sequence);
            assert_eq!(a.estimates, b.estimates);
        }
    }

    #[test]
    fn parallel_exact_smoother_matches_sequential() {
        let (model, data) = cox_data(40);
        let config = SmcConfig {
            num_particles: 80,
            horizon: 40,
            ..SmcConfig::default()
        };
        let sequential = run(&config, &model, &data).unwrap();
        let parallel = run(
            &SmcConfig {
                parallel: true,
                ..config
            },
            &model,
            &data,
        )
        .unwrap();
        assert_eq!(sequential.estimates, parallel.estimates);
        assert_eq!(sequential.ess_sequence, parallel.ess_sequence);
    }

    #[test]
    fn strategies_agree_on_the_first_step() {
        let (model, data) = cox_data(1);
        let exact = SmcConfig {
            num_particles: 64,
            horizon: 1,
            ..SmcConfig::default()
        };
        let naive = SmcConfig {
            smoothing_strategy: SmoothingStrategy::Naive,
            ..exact.clone()
        };
        let a = run(&exact, &model, &data).unwrap();
        let b = run(&naive, &model, &data).unwrap();
        assert_approx_eq!(a.final_estimate, b.final_estimate, 1e-12);
    }

    #[test]
    fn different_seeds_differ() {
        let (model, data) = cox_data(20);
        let config = SmcConfig {
            num_particles: 30,
            horizon: 20,
            ..SmcConfig::default()
        };
        let a = run(&config, &model, &data).unwrap();
        let b = run(&SmcConfig { seed: 7, ..config }, &model, &data).unwrap();
        assert_ne!(a.estimates, b.estimates);
    }

    #[test]
    fn stepping_matches_a_full_run() {
        let (model, data) = cox_data(15);
        let config = SmcConfig {
            num_particles: 40,
            horizon: 15,
            ..SmcConfig::default()
        };
        let full = run(&config, &model, &data).unwrap();

        let smoother = Smoother::new(SmoothingStrategy::Exact, false);
        let mut filter = BootstrapFilter::new(config.clone(), &model, &data, smoother).unwrap();
        let mut steps = 0;
        while filter.step().unwrap() {
            steps += 1;
            assert_eq!(filter.current_estimate(), Some(full.estimates[steps - 1]));
        }
        assert!(filter.is_finished());
        assert_eq!(filter.steps_done(), 15);
        assert!(!filter.step().unwrap());
        assert_eq!(filter.current_estimate(), Some(full.final_estimate));
        let finished = filter.finish().unwrap();
        assert_eq!(finished.estimates, full.estimates);
        assert_eq!(finished.log_likelihood, full.log_likelihood);
    }

    #[test]
    fn finishing_early_is_an_error() {
        let (model, data) = cox_data(10);
        let config = SmcConfig {
            num_particles: 10,
            horizon: 10,
            ..SmcConfig::default()
        };
        let mut filter = BootstrapFilter::new(config, &model, &data, NaiveSmoother::new()).unwrap();
        filter.step().unwrap();
        assert!(matches!(filter.finish(), Err(SmcError::Configuration(_))));
    }

    #[test]
    fn a_failed_step_aborts_the_run() {
        let inner = LinearGaussian::default();
        let (_, data) = inner.simulate(6, &mut StdRng::seed_from_u64(8));
        let model = FailsOnce {
            inner,
            fail_at: 3,
            tripped: AtomicBool::new(false),
        };
        let config = SmcConfig {
            num_particles: 20,
            horizon: 6,
            ..SmcConfig::default()
        };
        let mut filter = BootstrapFilter::new(config, &model, &data, NaiveSmoother::new()).unwrap();
        for _ in 0..3 {
            assert!(filter.step().unwrap());
        }
        assert!(matches!(
            filter.step(),
            Err(SmcError::ModelContract { step: 3, .. })
        ));
        assert!(filter.is_failed());

        // The model would now behave, but the run must not resume.
        assert!(matches!(filter.step(), Err(SmcError::Configuration(_))));
        assert_eq!(filter.steps_done(), 3);
        assert!(filter.current_estimate().is_some());
        assert!(filter.particles().is_none());
        assert!(matches!(filter.finish(), Err(SmcError::Configuration(_))));
    }

    #[test]
    fn history_is_stored_on_request() {
        let (model, data) = cox_data(25);
        let config = SmcConfig {
            num_particles: 20,
            horizon: 25,
            store_history: true,
            ..SmcConfig::default()
        };
        let result = run(&config, &model, &data).unwrap();
        let genealogy = result.genealogy.unwrap();
        assert_eq!(genealogy.len(), 25);
        assert_eq!(genealogy.num_particles(), 20);
        let path = genealogy.trajectory(3, 24).unwrap();
        assert_eq!(path.len(), 25);
    }

    #[test]
    fn data_shorter_than_horizon_is_rejected() {
        let (model, data) = cox_data(10);
        let config = SmcConfig {
            horizon: 11,
            ..SmcConfig::default()
        };
        assert!(matches!(
            run(&config, &model, &data),
            Err(SmcError::Configuration(_))
        ));
    }

    #[test]
    fn samplable_model_runs_naive_only() {
        let model = SamplerOnly(LinearGaussian::default());
        let mut rng = StdRng::seed_from_u64(5);
        let (_, data) = model.0.simulate(20, &mut rng);
        let naive = SmcConfig {
            num_particles: 50,
            horizon: 20,
            smoothing_strategy: SmoothingStrategy::Naive,
            ..SmcConfig::default()
        };
        let result = run_samplable(&naive, &model, &data).unwrap();
        assert_eq!(result.strategy, SmoothingStrategy::Naive);
        assert!(result.final_estimate.is_finite());

        let exact = SmcConfig {
            smoothing_strategy: SmoothingStrategy::Exact,
            ..naive
        };
        assert!(matches!(
            run_samplable(&exact, &model, &data),
            Err(SmcError::ModelContract { .. })
        ));
    }

    #[test]
    fn adaptive_resampling_skips_steps() {
        let model = LinearGaussian::new(0.9, 1.0, 5.0).unwrap();
        let mut rng = StdRng::seed_from_u64(17);
        let (_, data) = model.simulate(50, &mut rng);
        let config = SmcConfig {
            num_particles: 200,
            horizon: 50,
            resample_threshold: 0.5,
            ..SmcConfig::default()
        };
        let result = run_with_smoother(&config, &model, &data, ExactSmoother::new()).unwrap();
        assert!(result.resampled.iter().skip(1).any(|&r| !r));
        for (t, resampled) in result.resampled.iter().enumerate().skip(1) {
            assert_eq!(*resampled, result.ess_sequence[t - 1] < 100.0);
        }
    }
}
