//! Independent replications and their summaries.
//!
//! This module provides:
//! - [`run_replications`] to repeat a run with independently seeded generators,
//!   optionally on the rayon thread pool
//! - percentile / inter-quartile-range summaries across replications, per step
//! - CSV export of per-run estimates, per-step summaries and genealogies

use std::io;
use std::path::Path;

use log::debug;
use nalgebra::DMatrix;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::config::SmcConfig;
use crate::error::Result;
use crate::filter::run;
use crate::genealogy::Genealogy;
use crate::model::TransitionDensity;

/// What a single replication hands back to the caller.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReplicationRecord {
    pub run: usize,
    pub seed: u64,
    /// Smoothing estimate at every step.
    pub estimates: Vec<f64>,
    pub final_estimate: f64,
    pub log_likelihood: f64,
    pub cpu_time: f64,
}

/// Seed of replication `run` derived from a base seed.
pub fn replication_seed(base: u64, run: usize) -> u64 {
    base.wrapping_add(run as u64)
}

/// Repeat [`run`] `runs` times, replication `i` seeded with
/// [`replication_seed`]`(config.seed, i)`. Fails if any replication fails.
pub fn run_replications<M: TransitionDensity>(
    config: &SmcConfig,
    model: &M,
    data: &[M::Observation],
    runs: usize,
    parallel: bool,
) -> Result<Vec<ReplicationRecord>> {
    config.validate()?;
    let replicate = |i: usize| -> Result<ReplicationRecord> {
        let seed = replication_seed(config.seed, i);
        let run_config = SmcConfig {
            seed,
            store_history: false,
            ..config.clone()
        };
        let result = run(&run_config, model, data)?;
        Ok(ReplicationRecord {
            run: i,
            seed,
            final_estimate: result.final_estimate,
            estimates: result.estimates,
            log_likelihood: result.log_likelihood,
            cpu_time: result.cpu_time,
        })
    };
    let records = if parallel {
        (0..runs).into_par_iter().map(replicate).collect::<Result<Vec<_>>>()?
    } else {
        (0..runs).map(replicate).collect::<Result<Vec<_>>>()?
    };
    debug!(
        "{} replications of the {} smoother (N={}) done, mean time {:.4}s",
        runs,
        config.smoothing_strategy,
        config.num_particles,
        mean_cpu_time(&records)
    );
    Ok(records)
}

/// Percentile `q` (in `[0, 100]`) with linear interpolation between order
/// statistics. `NaN` for an empty slice.
pub fn percentile(values: &[f64], q: f64) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let position = (q.clamp(0.0, 100.0) / 100.0) * (sorted.len() - 1) as f64;
    let lower = position.floor() as usize;
    let upper = position.ceil() as usize;
    let fraction = position - lower as f64;
    sorted[lower] + fraction * (sorted[upper] - sorted[lower])
}

/// 75th minus 25th percentile.
pub fn interquartile_range(values: &[f64]) -> f64 {
    percentile(values, 75.0) - percentile(values, 25.0)
}

pub fn mean_cpu_time(records: &[ReplicationRecord]) -> f64 {
    if records.is_empty() {
        return 0.0;
    }
    records.iter().map(|r| r.cpu_time).sum::<f64>() / records.len() as f64
}

/// `(runs x T)` matrix of per-step estimates.
pub fn estimate_matrix(records: &[ReplicationRecord]) -> DMatrix<f64> {
    let steps = records.iter().map(|r| r.estimates.len()).min().unwrap_or(0);
    DMatrix::from_fn(records.len(), steps, |i, j| records[i].estimates[j])
}

/// Inter-quartile range across runs of every column of an estimate matrix.
pub fn iqr_by_step(estimates: &DMatrix<f64>) -> Vec<f64> {
    estimates
        .column_iter()
        .map(|column| interquartile_range(&column.iter().copied().collect::<Vec<_>>()))
        .collect()
}

/// Distribution of the estimates across replications at one step.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StepSummary {
    pub step: usize,
    pub q25: f64,
    pub median: f64,
    pub q75: f64,
    pub iqr: f64,
}

pub fn summarize(records: &[ReplicationRecord]) -> Vec<StepSummary> {
    estimate_matrix(records)
        .column_iter()
        .enumerate()
        .map(|(step, column)| {
            let values: Vec<f64> = column.iter().copied().collect();
            let q25 = percentile(&values, 25.0);
            let q75 = percentile(&values, 75.0);
            StepSummary {
                step,
                q25,
                median: percentile(&values, 50.0),
                q75,
                iqr: q75 - q25,
            }
        })
        .collect()
}

#[derive(Serialize)]
struct EstimateRow {
    run: usize,
    seed: u64,
    step: usize,
    estimate: f64,
}

/// Long-format CSV with one `run,seed,step,estimate` row per run and step.
pub fn write_estimates_csv<P: AsRef<Path>>(records: &[ReplicationRecord], path: P) -> Result<()> {
    let mut writer = csv::Writer::from_path(path).map_err(io::Error::other)?;
    for record in records {
        for (step, estimate) in record.estimates.iter().enumerate() {
            writer
                .serialize(EstimateRow {
                    run: record.run,
                    seed: record.seed,
                    step,
                    estimate: *estimate,
                })
                .map_err(io::Error::other)?;
        }
    }
    writer.flush()?;
    Ok(())
}

pub fn write_summaries_csv<P: AsRef<Path>>(summaries: &[StepSummary], path: P) -> Result<()> {
    let mut writer = csv::Writer::from_path(path).map_err(io::Error::other)?;
    for summary in summaries {
        writer.serialize(summary).map_err(io::Error::other)?;
    }
    writer.flush()?;
    Ok(())
}

#[derive(Serialize)]
struct TrajectoryRow<'a, S> {
    particle: usize,
    step: usize,
    index: usize,
    state: &'a S,
}

/// One `particle,step,index,state` row per final particle and step: the path
/// of every particle alive at the last step, traced back to step 0.
pub fn write_trajectories_csv<S, P>(genealogy: &Genealogy<S>, path: P) -> Result<()>
where
    S: Clone + Serialize,
    P: AsRef<Path>,
{
    let b = genealogy.trajectories();
    let mut writer = csv::Writer::from_path(path).map_err(io::Error::other)?;
    for particle in 0..b.ncols() {
        for step in 0..b.nrows() {
            let index = b[(step, particle)];
            if let Some(states) = genealogy.states_at(step) {
                writer
                    .serialize(TrajectoryRow {
                        particle,
                        step,
                        index,
                        state: &states[index],
                    })
                    .map_err(io::Error::other)?;
            }
        }
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::LinearGaussian;
    use assert_approx_eq::assert_approx_eq;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::sync::Mutex;
    use tempfile::tempdir;

    fn record(run: usize, estimates: Vec<f64>, cpu_time: f64) -> ReplicationRecord {
        ReplicationRecord {
            run,
            seed: run as u64,
            final_estimate: *estimates.last().unwrap(),
            estimates,
            log_likelihood: 0.0,
            cpu_time,
        }
    }

    #[test]
    fn percentiles_interpolate_linearly() {
        let values = [4.0, 1.0, 3.0, 2.0];
        assert_approx_eq!(percentile(&values, 25.0), 1.75, 1e-12);
        assert_approx_eq!(percentile(&values, 50.0), 2.5, 1e-12);
        assert_approx_eq!(percentile(&values, 75.0), 3.25, 1e-12);
        assert_approx_eq!(interquartile_range(&values), 1.5, 1e-12);
        assert_eq!(percentile(&[7.0], 90.0), 7.0);
        assert!(percentile(&[], 50.0).is_nan());
    }

    #[test]
    fn matrix_and_summaries() {
        let records = vec![
            record(0, vec![1.0, 10.0], 0.5),
            record(1, vec![2.0, 20.0], 1.5),
            record(2, vec![3.0, 30.0], 1.0),
        ];
        let m = estimate_matrix(&records);
        assert_eq!(m.shape(), (3, 2));
        assert_eq!(m[(1, 1)], 20.0);
        let iqr = iqr_by_step(&m);
        assert_approx_eq!(iqr[0], 1.0, 1e-12);
        assert_approx_eq!(iqr[1], 10.0, 1e-12);
        let summaries = summarize(&records);
        assert_eq!(summaries.len(), 2);
        assert_approx_eq!(summaries[1].median, 20.0, 1e-12);
        assert_approx_eq!(mean_cpu_time(&records), 1.0, 1e-12);
    }

    #[test]
    fn replications_are_independent_and_reproducible() {
        let model = LinearGaussian::default();
        let mut rng = StdRng::seed_from_u64(3);
        let (_, data) = model.simulate(10, &mut rng);
        let config = SmcConfig {
            num_particles: 30,
            horizon: 10,
            ..SmcConfig::default()
        };
        let sequential = run_replications(&config, &model, &data, 6, false).unwrap();
        let parallel = run_replications(&config, &model, &data, 6, true).unwrap();
        assert_eq!(sequential.len(), 6);
        for (a, b) in sequential.iter().zip(&parallel) {
            assert_eq!(a.run, b.run);
            assert_eq!(a.seed, b.seed);
            assert_eq!(a.estimates, b.estimates);
        }
        assert_ne!(sequential[0].estimates, sequential[1].estimates);
    }

    /// Records the level of every message the library emits.
    struct LevelRecorder {
        levels: Mutex<Vec<log::Level>>,
    }

    impl log::Log for LevelRecorder {
        fn enabled(&self, _metadata: &log::Metadata) -> bool {
            true
        }
        fn log(&self, record: &log::Record) {
            if record.target().starts_with("smoothing")
                && let Ok(mut levels) = self.levels.lock()
            {
                levels.push(record.level());
            }
        }
        fn flush(&self) {}
    }

    static RECORDER: LevelRecorder = LevelRecorder {
        levels: Mutex::new(Vec::new()),
    };

    #[test]
    fn replications_log_below_info() {
        log::set_logger(&RECORDER).unwrap();
        log::set_max_level(log::LevelFilter::Trace);

        let model = LinearGaussian::default();
        let (_, data) = model.simulate(5, &mut StdRng::seed_from_u64(4));
        let config = SmcConfig {
            num_particles: 10,
            horizon: 5,
            ..SmcConfig::default()
        };
        run_replications(&config, &model, &data, 3, false).unwrap();

        let levels = RECORDER.levels.lock().unwrap();
        assert!(!levels.is_empty());
        assert!(levels.iter().all(|level| *level >= log::Level::Debug), "{levels:?}");
    }

    #[test]
    fn csv_exports() {
        let dir = tempdir().unwrap();
        let records = vec![record(0, vec![1.0, 2.0, 3.0], 0.1), record(1, vec![1.5, 2.5, 3.5], 0.1)];
        let estimates_path = dir.path().join("estimates.csv");
        write_estimates_csv(&records, &estimates_path).unwrap();
        let mut reader = csv::Reader::from_path(&estimates_path).unwrap();
        assert_eq!(reader.records().count(), 6);

        let summary_path = dir.path().join("summary.csv");
        write_summaries_csv(&summarize(&records), &summary_path).unwrap();
        let mut reader = csv::Reader::from_path(&summary_path).unwrap();
        let headers = reader.headers().unwrap().clone();
        assert_eq!(headers.iter().collect::<Vec<_>>(), vec!["step", "q25", "median", "q75", "iqr"]);
        assert_eq!(reader.records().count(), 3);

        let mut genealogy = Genealogy::new(vec![0.0, 1.0]);
        genealogy.record(1, vec![1, 1], vec![2.0, 3.0]).unwrap();
        let trajectory_path = dir.path().join("trajectories.csv");
        write_trajectories_csv(&genealogy, &trajectory_path).unwrap();
        let mut reader = csv::Reader::from_path(&trajectory_path).unwrap();
        let rows: Vec<csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 4);
        // particle 0 at step 0 descends from initial particle 1
        assert_eq!(&rows[0][2], "1");
        assert_eq!(&rows[0][3], "1.0");
    }
}
