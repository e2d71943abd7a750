//! Throughput benchmark
//!
//! Measures prompt processing (one batch of `pp` tokens) and text generation
//! (`tg` single-position batches across `pl` sequences) on a live session.

use std::fmt;
use std::time::Instant;

use crate::inference::runtime::{Context, Model};
use crate::inference::session::{Session, SessionError};

/// Mean and sample standard deviation of tokens/second across repeats
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhaseStats {
    pub mean: f64,
    pub std_dev: f64,
}

impl PhaseStats {
    /// Standard deviation uses n-1 and is zero for a single sample.
    pub fn from_samples(samples: &[f64]) -> Self {
        if samples.is_empty() {
            return Self {
                mean: 0.0,
                std_dev: 0.0,
            };
        }
        let n = samples.len() as f64;
        let mean = samples.iter().sum::<f64>() / n;
        let std_dev = if samples.len() > 1 {
            let sum_sq: f64 = samples.iter().map(|s| (s - mean).powi(2)).sum();
            (sum_sq / (n - 1.0)).sqrt()
        } else {
            0.0
        };
        Self { mean, std_dev }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BenchReport {
    pub model_description: String,
    pub model_size_bytes: u64,
    pub model_params: u64,
    pub backend: String,
    pub prompt_tokens: u32,
    pub generated_tokens: u32,
    pub parallel_sequences: u32,
    pub prompt_processing: PhaseStats,
    pub text_generation: PhaseStats,
}

impl fmt::Display for BenchReport {
    /// Renders the report as a markdown table
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let size = format!(
            "{:.2} GiB",
            self.model_size_bytes as f64 / 1024.0 / 1024.0 / 1024.0
        );
        let params = format!("{:.2} B", self.model_params as f64 / 1e9);

        writeln!(f, "| model | size | params | backend | test | t/s |")?;
        writeln!(f, "| --- | --- | --- | --- | --- | --- |")?;
        let rows = [
            (format!("pp {}", self.prompt_tokens), self.prompt_processing),
            (format!("tg {}", self.generated_tokens), self.text_generation),
        ];
        for (test, stats) in rows {
            writeln!(
                f,
                "| {} | {} | {} | {} | {} | {:.2} ± {:.2} |",
                self.model_description, size, params, self.backend, test, stats.mean, stats.std_dev
            )?;
        }
        Ok(())
    }
}

fn tokens_per_second(tokens: u32, started: Instant) -> f64 {
    let secs = started.elapsed().as_secs_f64().max(f64::EPSILON);
    f64::from(tokens) / secs
}

impl<'m, M: Model + 'm> Session<'m, M> {
    /// Runs `repeats` rounds of prompt processing and generation.
    ///
    /// The context memory is cleared between phases and the session is reset
    /// afterwards, so any conversation in progress is discarded.
    pub fn benchmark(
        &mut self,
        pp: u32,
        tg: u32,
        pl: u32,
        repeats: u32,
    ) -> Result<BenchReport, SessionError> {
        let max = self.batch.n_seq_max();
        if pl == 0 || pl as usize > max {
            return Err(SessionError::ParallelSequences { requested: pl, max });
        }

        let repeats = repeats.max(1);
        tracing::info!(
            "Benchmark: pp={}, tg={}, pl={}, repeats={}",
            pp,
            tg,
            pl,
            repeats
        );

        let rounds = self.benchmark_rounds(pp, tg, pl, repeats);
        self.clear();
        let (pp_speeds, tg_speeds) = rounds?;

        Ok(BenchReport {
            model_description: self.model_description(),
            model_size_bytes: self.model.size_bytes(),
            model_params: self.model.n_params(),
            backend: self.backend_name().to_string(),
            prompt_tokens: pp,
            generated_tokens: tg,
            parallel_sequences: pl,
            prompt_processing: PhaseStats::from_samples(&pp_speeds),
            text_generation: PhaseStats::from_samples(&tg_speeds),
        })
    }

    fn benchmark_rounds(
        &mut self,
        pp: u32,
        tg: u32,
        pl: u32,
        repeats: u32,
    ) -> Result<(Vec<f64>, Vec<f64>), SessionError> {
        let mut pp_speeds = Vec::with_capacity(repeats as usize);
        let mut tg_speeds = Vec::with_capacity(repeats as usize);

        for round in 0..repeats {
            self.batch.clear();
            for i in 0..pp {
                self.batch.push(0, i as i32, &[0], i + 1 == pp)?;
            }

            self.context.clear_memory();
            let started = Instant::now();
            self.decode_bench_batch("prompt")?;
            let speed_pp = tokens_per_second(pp, started);

            self.context.clear_memory();
            let started = Instant::now();
            for i in 0..tg {
                self.batch.clear();
                for j in 0..pl {
                    self.batch.push(0, i as i32, &[j as i32], true)?;
                }
                self.decode_bench_batch("text generation")?;
            }
            let speed_tg = tokens_per_second(pl.saturating_mul(tg), started);

            self.context.clear_memory();

            tracing::info!(
                "Round {}: pp {:.2} t/s, tg {:.2} t/s",
                round + 1,
                speed_pp,
                speed_tg
            );
            pp_speeds.push(speed_pp);
            tg_speeds.push(speed_tg);
        }

        Ok((pp_speeds, tg_speeds))
    }

    fn decode_bench_batch(&mut self, phase: &str) -> Result<(), SessionError> {
        self.context.decode(&self.batch).map_err(|e| {
            tracing::error!("llama_decode failed during {}: {}", phase, e);
            SessionError::DecodeFailure(e.to_string())
        })
    }
}
