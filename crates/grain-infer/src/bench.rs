//! Latency and count parity across estimator paths (eager, FP32, INT8).

use crate::postprocess::{PostProcessor, Prediction};
use crate::{Estimator, Result};
use grain_model::{CountCategory, GrainType};
use ndarray::{Array4, ArrayView4};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::fmt;
use std::time::{Duration, Instant};

/// One path under test. Untimed paths run once, for parity only.
pub struct BenchCase<'a> {
    pub estimator: &'a mut dyn Estimator,
    pub timed: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct BenchConfig {
    pub warmup: usize,
    pub runs: usize,
    /// Largest tolerated per-category count difference from the first path.
    pub parity_tolerance: u32,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self { warmup: 1, runs: 5, parity_tolerance: 1 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LatencyStats {
    pub runs: usize,
    pub mean_ms: f64,
    pub min_ms: f64,
}

impl LatencyStats {
    pub fn from_samples(samples: &[Duration]) -> Option<Self> {
        if samples.is_empty() {
            return None;
        }
        let ms: Vec<f64> = samples.iter().map(|d| d.as_secs_f64() * 1e3).collect();
        Some(Self {
            runs: ms.len(),
            mean_ms: ms.iter().sum::<f64>() / ms.len() as f64,
            min_ms: ms.iter().copied().fold(f64::INFINITY, f64::min),
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PathResult {
    pub name: String,
    pub latency: Option<LatencyStats>,
    pub prediction: Prediction,
}

#[derive(Debug, Clone, Serialize)]
pub struct BenchmarkReport {
    pub paths: Vec<PathResult>,
    pub tolerance: u32,
}

impl BenchmarkReport {
    /// `(path, category, |Δ|)` for every count off the first path by more
    /// than the tolerance.
    pub fn parity_failures(&self) -> Vec<(String, CountCategory, u32)> {
        let Some(reference) = self.paths.first() else {
            return Vec::new();
        };
        let mut failures = Vec::new();
        for path in &self.paths[1..] {
            for c in CountCategory::ALL {
                let diff = path.prediction.count(c).abs_diff(reference.prediction.count(c));
                if diff > self.tolerance {
                    failures.push((path.name.clone(), c, diff));
                }
            }
        }
        failures
    }

    pub fn parity_ok(&self) -> bool {
        self.parity_failures().is_empty()
    }

    /// Mean latency every speed-up is relative to: the first path's, or,
    /// when that path was not timed, the first timed exported path's.
    pub fn baseline_ms(&self) -> Option<f64> {
        self.paths.iter().find_map(|p| p.latency.map(|l| l.mean_ms))
    }

    pub fn speedups(&self) -> Vec<(String, Option<f64>)> {
        let baseline = self.baseline_ms();
        self.paths
            .iter()
            .map(|p| {
                let speedup = match (baseline, p.latency) {
                    (Some(b), Some(l)) if l.mean_ms > 0.0 => Some(b / l.mean_ms),
                    _ => None,
                };
                (p.name.clone(), speedup)
            })
            .collect()
    }
}

impl fmt::Display for BenchmarkReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{:<24} {:>10} {:>10} {:>9}", "path", "avg ms", "min ms", "speed-up")?;
        for (path, (_, speedup)) in self.paths.iter().zip(self.speedups()) {
            match path.latency {
                Some(l) => write!(f, "{:<24} {:>10.1} {:>10.1}", path.name, l.mean_ms, l.min_ms)?,
                None => write!(f, "{:<24} {:>10} {:>10}", path.name, "-", "-")?,
            }
            match speedup {
                Some(s) => writeln!(f, " {:>8.2}x", s)?,
                None => writeln!(f, " {:>9}", "-")?,
            }
        }
        let failures = self.parity_failures();
        if failures.is_empty() {
            write!(f, "count parity: ok (tolerance {})", self.tolerance)
        } else {
            write!(f, "count parity: {} mismatches {:?}", failures.len(), failures)
        }
    }
}

/// Runs every case on the same tiles and post-processes each result.
pub fn run(
    cases: &mut [BenchCase<'_>],
    tiles: ArrayView4<f32>,
    grain: GrainType,
    post: &PostProcessor,
    config: &BenchConfig,
) -> Result<BenchmarkReport> {
    let mut paths = Vec::with_capacity(cases.len());
    for case in cases.iter_mut() {
        let name = case.estimator.name().to_string();
        let (raw, latency) = if case.timed && config.runs > 0 {
            for _ in 0..config.warmup {
                case.estimator.estimate(tiles, grain)?;
            }
            let mut samples = Vec::with_capacity(config.runs);
            let mut last = None;
            for _ in 0..config.runs {
                let t0 = Instant::now();
                last = Some(case.estimator.estimate(tiles, grain)?);
                samples.push(t0.elapsed());
            }
            match last {
                Some(raw) => (raw, LatencyStats::from_samples(&samples)),
                None => (case.estimator.estimate(tiles, grain)?, None),
            }
        } else {
            (case.estimator.estimate(tiles, grain)?, None)
        };
        if let Some(l) = latency {
            log::info!("{name}: avg {:.1} ms, min {:.1} ms over {} runs", l.mean_ms, l.min_ms, l.runs);
        }
        paths.push(PathResult { name, latency, prediction: post.apply(&raw, grain)? });
    }
    Ok(BenchmarkReport { paths, tolerance: config.parity_tolerance })
}

/// Random normalized-range tiles for runs without a sample image.
pub fn synthetic_tiles(n: usize, size: usize, seed: u64) -> Array4<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    Array4::from_shape_fn((n, 3, size, size), |_| rng.gen_range(-2.0..2.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RawOutput;
    use grain_model::{ModelConfig, NormStats};

    struct Fixed {
        name: &'static str,
        counts: [f32; 9],
        calls: usize,
    }

    impl Estimator for Fixed {
        fn estimate(&mut self, _tiles: ArrayView4<f32>, _grain: GrainType) -> Result<RawOutput> {
            self.calls += 1;
            Ok(RawOutput { counts: self.counts, measures: [0.0; 6] })
        }

        fn name(&self) -> &str {
            self.name
        }
    }

    fn post() -> PostProcessor {
        PostProcessor::new(&ModelConfig::default(), NormStats::default())
    }

    #[test]
    fn parity_within_one_count() {
        let mut a = Fixed { name: "eager", counts: [1000.0; 9], calls: 0 };
        let mut b = Fixed { name: "int8", counts: [1090.0; 9], calls: 0 };
        let tiles = synthetic_tiles(2, 8, 0);
        let report = run(
            &mut [BenchCase { estimator: &mut a, timed: true }, BenchCase { estimator: &mut b, timed: true }],
            tiles.view(),
            GrainType::White,
            &post(),
            &BenchConfig::default(),
        )
        .unwrap();
        assert!(report.parity_ok());
        assert_eq!(a.calls, 6);
        assert_eq!(report.paths[0].latency.unwrap().runs, 5);
    }

    #[test]
    fn parity_failure_is_reported_per_category() {
        let mut a = Fixed { name: "fp32", counts: [1000.0; 9], calls: 0 };
        let mut counts = [1000.0; 9];
        counts[CountCategory::Broken.index()] = 1300.0;
        let mut b = Fixed { name: "int8", counts, calls: 0 };
        let tiles = synthetic_tiles(1, 4, 1);
        let report = run(
            &mut [BenchCase { estimator: &mut a, timed: false }, BenchCase { estimator: &mut b, timed: false }],
            tiles.view(),
            GrainType::White,
            &post(),
            &BenchConfig::default(),
        )
        .unwrap();
        assert_eq!(report.parity_failures(), vec![("int8".to_string(), CountCategory::Broken, 3)]);
        assert_eq!(a.calls, 1);
    }

    #[test]
    fn untimed_reference_falls_back_to_exported_baseline() {
        let stats = |ms| Some(LatencyStats { runs: 5, mean_ms: ms, min_ms: ms });
        let prediction = Prediction { counts: [0; 9], measures: [0.0; 6] };
        let report = BenchmarkReport {
            paths: vec![
                PathResult { name: "eager".into(), latency: None, prediction },
                PathResult { name: "fp32".into(), latency: stats(400.0), prediction },
                PathResult { name: "int8".into(), latency: stats(100.0), prediction },
            ],
            tolerance: 1,
        };
        assert_eq!(report.baseline_ms(), Some(400.0));
        let s = report.speedups();
        assert_eq!(s[0].1, None);
        assert_eq!(s[1].1, Some(1.0));
        assert_eq!(s[2].1, Some(4.0));
        assert!(report.to_string().contains("4.00x"));
    }

    #[test]
    fn latency_stats() {
        let s = LatencyStats::from_samples(&[Duration::from_millis(10), Duration::from_millis(30)]).unwrap();
        assert_eq!(s.runs, 2);
        assert!((s.mean_ms - 20.0).abs() < 1e-9);
        assert!((s.min_ms - 10.0).abs() < 1e-9);
        assert!(LatencyStats::from_samples(&[]).is_none());
    }
}
