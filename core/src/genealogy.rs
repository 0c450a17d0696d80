//! Particle ancestry.
//!
//! The [`Genealogy`] keeps, for every step `t >= 1`, the index of the parent
//! (at `t - 1`) of each particle, together with the particle states of every
//! step. That is O(N) memory per step and O(N T) in total, which is what it
//! takes to rebuild the full path of any particle and to draw ancestry trees.
//!
//! Resampling makes lineages coalesce: looking backwards from the final step,
//! the number of distinct ancestors can only shrink, and for long horizons
//! usually collapses to a single particle. [`Genealogy::distinct_ancestors`]
//! measures exactly that.

use std::collections::HashSet;

use nalgebra::DMatrix;

use crate::error::{Result, SmcError};

/// Ancestor links and states of a whole run.
#[derive(Clone, Debug)]
pub struct Genealogy<S> {
    states: Vec<Vec<S>>,
    ancestors: Vec<Vec<usize>>,
}

impl<S: Clone> Genealogy<S> {
    /// Start a genealogy from the particles of step 0.
    pub fn new(initial_states: Vec<S>) -> Self {
        Genealogy {
            states: vec![initial_states],
            ancestors: Vec::new(),
        }
    }

    pub fn num_particles(&self) -> usize {
        self.states[0].len()
    }

    /// Number of recorded steps, including step 0.
    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Last recorded step.
    pub fn last_step(&self) -> usize {
        self.states.len() - 1
    }

    /// Append the ancestor indices and new states of step `t`.
    pub fn record(&mut self, t: usize, ancestors: Vec<usize>, states: Vec<S>) -> Result<()> {
        let n = self.num_particles();
        if t != self.states.len() {
            return Err(SmcError::config(format!(
                "genealogy expected step {}, got step {t}",
                self.states.len()
            )));
        }
        if ancestors.len() != n || states.len() != n {
            return Err(SmcError::config(format!(
                "step {t} has {} ancestors and {} states for {n} particles",
                ancestors.len(),
                states.len()
            )));
        }
        if let Some(bad) = ancestors.iter().find(|&&a| a >= n) {
            return Err(SmcError::config(format!(
                "ancestor index {bad} out of range at step {t}"
            )));
        }
        self.ancestors.push(ancestors);
        self.states.push(states);
        Ok(())
    }

    /// Ancestor indices recorded at step `t >= 1`.
    pub fn ancestors_at(&self, t: usize) -> Option<&[usize]> {
        t.checked_sub(1)
            .and_then(|i| self.ancestors.get(i))
            .map(Vec::as_slice)
    }

    /// Particle states recorded at step `t`.
    pub fn states_at(&self, t: usize) -> Option<&[S]> {
        self.states.get(t).map(Vec::as_slice)
    }

    fn check_particle(&self, n: usize, t: usize) -> Result<()> {
        if t > self.last_step() {
            return Err(SmcError::config(format!(
                "step {t} is beyond the last recorded step {}",
                self.last_step()
            )));
        }
        if n >= self.num_particles() {
            return Err(SmcError::config(format!("no particle {n} at step {t}")));
        }
        Ok(())
    }

    /// Indices, at every step `0..=t`, of the ancestors of particle `n` alive at `t`.
    pub fn lineage(&self, n: usize, t: usize) -> Result<Vec<usize>> {
        self.check_particle(n, t)?;
        let mut path = vec![0; t + 1];
        let mut index = n;
        path[t] = index;
        for s in (1..=t).rev() {
            index = self.ancestors[s - 1][index];
            path[s - 1] = index;
        }
        Ok(path)
    }

    /// Full state path $x_{0:t}$ of particle `n` alive at step `t`.
    pub fn trajectory(&self, n: usize, t: usize) -> Result<Vec<S>> {
        Ok(self
            .lineage(n, t)?
            .into_iter()
            .enumerate()
            .map(|(s, index)| self.states[s][index].clone())
            .collect())
    }

    /// `(T x N)` matrix `B` with `B[(s, n)]` the index at step `s` of the
    /// ancestor of final particle `n`.
    pub fn trajectories(&self) -> DMatrix<usize> {
        let steps = self.len();
        let n = self.num_particles();
        let mut b = DMatrix::<usize>::zeros(steps, n);
        for j in 0..n {
            b[(steps - 1, j)] = j;
        }
        for s in (1..steps).rev() {
            let ancestors = &self.ancestors[s - 1];
            for j in 0..n {
                b[(s - 1, j)] = ancestors[b[(s, j)]];
            }
        }
        b
    }

    /// Number of distinct ancestors at step `s` of all particles alive at step `t`.
    pub fn distinct_ancestors(&self, t: usize, s: usize) -> Result<usize> {
        if s > t {
            return Err(SmcError::config(format!(
                "ancestor step {s} is after step {t}"
            )));
        }
        self.check_particle(0, t)?;
        let mut current: HashSet<usize> = (0..self.num_particles()).collect();
        for step in (s + 1..=t).rev() {
            let ancestors = &self.ancestors[step - 1];
            current = current.iter().map(|&i| ancestors[i]).collect();
        }
        Ok(current.len())
    }

    /// Most recent step at which every particle alive at step `t` shares a
    /// single ancestor, if the lineages have coalesced at all.
    pub fn coalescence_step(&self, t: usize) -> Result<Option<usize>> {
        self.check_particle(0, t)?;
        let mut current: HashSet<usize> = (0..self.num_particles()).collect();
        for step in (0..=t).rev() {
            if current.len() == 1 {
                return Ok(Some(step));
            }
            if step > 0 {
                let ancestors = &self.ancestors[step - 1];
                current = current.iter().map(|&i| ancestors[i]).collect();
            }
        }
        Ok(None)
    }
}
