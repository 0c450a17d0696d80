//! Run configuration.
//!
//! A [`SmcConfig`] is passed explicitly to every run, so concurrently executed
//! replications never share mutable state. It can be stored as JSON, YAML or
//! TOML; the format is picked from the file extension.

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SmcError};
use crate::particle::ParticleResamplingStrategy;
use crate::smoothing::SmoothingStrategy;

/// Parameters of one particle filter run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SmcConfig {
    /// Number of particles `N`.
    pub num_particles: usize,
    /// Number of time steps `T`.
    pub horizon: usize,
    /// Resample when `ESS < resample_threshold * N`. Values of one or more
    /// resample at every step; zero never resamples.
    pub resample_threshold: f64,
    pub resampling_scheme: ParticleResamplingStrategy,
    pub smoothing_strategy: SmoothingStrategy,
    /// Seed of the run's random number generator.
    pub seed: u64,
    /// Keep the full genealogy in the run result.
    pub store_history: bool,
    /// Run the exact smoother's inner loop on the rayon thread pool.
    pub parallel: bool,
}

impl Default for SmcConfig {
    fn default() -> Self {
        SmcConfig {
            num_particles: 100,
            horizon: 100,
            resample_threshold: 1.0,
            resampling_scheme: ParticleResamplingStrategy::Systematic,
            smoothing_strategy: SmoothingStrategy::Exact,
            seed: 42,
            store_history: false,
            parallel: false,
        }
    }
}

impl SmcConfig {
    /// Fail fast on settings no run could use.
    pub fn validate(&self) -> Result<()> {
        if self.num_particles < 1 {
            return Err(SmcError::config("number of particles must be at least 1"));
        }
        if self.horizon < 1 {
            return Err(SmcError::config("horizon must be at least 1"));
        }
        if !(self.resample_threshold >= 0.0) {
            return Err(SmcError::config(format!(
                "resample threshold must be non-negative, got {}",
                self.resample_threshold
            )));
        }
        Ok(())
    }

    /// Whether a population with effective sample size `ess` should be resampled.
    pub fn should_resample(&self, ess: f64) -> bool {
        if self.resample_threshold >= 1.0 {
            true
        } else {
            ess < self.resample_threshold * self.num_particles as f64
        }
    }

    /// Write the configuration as pretty-printed JSON.
    pub fn to_json<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = File::create(path)?;
        serde_json::to_writer_pretty(file, self)
            .map_err(|e| SmcError::config(format!("cannot encode JSON: {e}")))
    }

    /// Read the configuration from JSON.
    pub fn from_json<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        serde_json::from_reader(file).map_err(|e| SmcError::config(format!("invalid JSON: {e}")))
    }

    /// Write the configuration as YAML.
    pub fn to_yaml<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut file = File::create(path)?;
        let s = serde_yaml::to_string(self)
            .map_err(|e| SmcError::config(format!("cannot encode YAML: {e}")))?;
        file.write_all(s.as_bytes())?;
        Ok(())
    }

    /// Read the configuration from YAML.
    pub fn from_yaml<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        serde_yaml::from_reader(file).map_err(|e| SmcError::config(format!("invalid YAML: {e}")))
    }

    /// Write the configuration as TOML.
    pub fn to_toml<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut file = File::create(path)?;
        let s = toml::to_string(self)
            .map_err(|e| SmcError::config(format!("cannot encode TOML: {e}")))?;
        file.write_all(s.as_bytes())?;
        Ok(())
    }

    /// Read the configuration from TOML.
    pub fn from_toml<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut s = String::new();
        let mut file = File::open(path)?;
        file.read_to_string(&mut s)?;
        toml::from_str(&s).map_err(|e| SmcError::config(format!("invalid TOML: {e}")))
    }

    /// Write, choosing the format by extension (`.json`, `.yaml`/`.yml`, `.toml`).
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let p = path.as_ref();
        match extension(p).as_deref() {
            Some("json") => self.to_json(p),
            Some("yaml") | Some("yml") => self.to_yaml(p),
            Some("toml") => self.to_toml(p),
            _ => Err(unsupported(p)),
        }
    }

    /// Read and validate, choosing the format by extension.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let p = path.as_ref();
        let config = match extension(p).as_deref() {
            Some("json") => Self::from_json(p),
            Some("yaml") | Some("yml") => Self::from_yaml(p),
            Some("toml") => Self::from_toml(p),
            _ => Err(unsupported(p)),
        }?;
        config.validate()?;
        Ok(config)
    }
}

fn extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|s| s.to_str())
        .map(|s| s.to_lowercase())
}

fn unsupported(path: &Path) -> SmcError {
    SmcError::config(format!(
        "unsupported configuration file extension: {}",
        path.display()
    ))
}
