use std::fmt::Display;
use std::path::PathBuf;
use std::time::Instant;

use anyhow::Result;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram};
use tracing::{error, info};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Registry, fmt};

/// Target of the one-line-per-task JSON report.
pub const TASK_REPORT_TARGET: &str = "pipeline";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogOutput {
    Stdout,
    /// For processes whose stdout carries protocol traffic.
    Stderr,
    /// Daily rolling `dataviser.log` plus a JSON `tasks.log` in this directory.
    Dir(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    pub log_level: String,
    pub output: LogOutput,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
            output: LogOutput::Stdout,
        }
    }
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init_tracing(config: &LogConfig) -> Result<()> {
    let env_filter = EnvFilter::try_new(&config.log_level)?;
    match &config.output {
        LogOutput::Stdout => {
            let fmt_layer = fmt::layer().with_thread_names(true);
            Registry::default().with(env_filter).with(fmt_layer).try_init()?;
        }
        LogOutput::Stderr => {
            let fmt_layer = fmt::layer().with_writer(std::io::stderr).with_ansi(false);
            Registry::default().with(env_filter).with(fmt_layer).try_init()?;
        }
        LogOutput::Dir(dir) => {
            std::fs::create_dir_all(dir)?;
            let txt_appender = RollingFileAppender::new(Rotation::DAILY, dir, "dataviser.log");
            let txt_layer = fmt::layer()
                .with_writer(txt_appender)
                .with_ansi(false)
                .with_thread_names(true);

            // newline-delimited JSON, only the task reports
            let json_appender = RollingFileAppender::new(Rotation::DAILY, dir, "tasks.log");
            let json_layer = fmt::layer()
                .json()
                .with_writer(json_appender)
                .with_target(true)
                .with_filter(EnvFilter::new(format!("{TASK_REPORT_TARGET}=info")));

            Registry::default()
                .with(env_filter)
                .with(txt_layer)
                .with(json_layer)
                .try_init()?;
        }
    }
    Ok(())
}

/// Counters and latency for pipeline tasks. Instruments come from the global meter,
/// so they record nowhere until a meter provider is installed.
pub struct PipelineTelemetry {
    pub tasks_started: Counter<u64>,
    pub tasks_succeeded: Counter<u64>,
    pub tasks_failed: Counter<u64>,
    pub task_latency_ms: Histogram<f64>,
}

impl Default for PipelineTelemetry {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineTelemetry {
    pub fn new() -> Self {
        let meter = global::meter("dataviser");
        Self {
            tasks_started: meter
                .u64_counter("tasks_started")
                .with_description("Pipeline tasks started")
                .build(),
            tasks_succeeded: meter.u64_counter("tasks_succeeded").build(),
            tasks_failed: meter.u64_counter("tasks_failed").build(),
            task_latency_ms: meter
                .f64_histogram("task_latency_ms")
                .with_description("Pipeline task latency in ms")
                .with_unit("ms")
                .build(),
        }
    }

    /// Await `task`, recording latency and outcome, and emit one report event.
    pub async fn instrument_task<T, E, F>(&self, name: &str, task: F) -> Result<T, E>
    where
        F: Future<Output = Result<T, E>>,
        E: Display,
    {
        self.tasks_started.add(1, &[]);
        let start = Instant::now();

        let result = task.await;

        let elapsed = start.elapsed().as_secs_f64() * 1_000.0;
        self.task_latency_ms.record(elapsed, &[]);
        match &result {
            Ok(_) => {
                self.tasks_succeeded.add(1, &[]);
                info!("task `{name}` succeeded in {elapsed:.1} ms");
            }
            Err(err) => {
                self.tasks_failed.add(1, &[]);
                error!(error = %err, "task `{name}` failed in {elapsed:.1} ms");
            }
        }
        tracing::event!(
            target: TASK_REPORT_TARGET,
            tracing::Level::INFO,
            task = name,
            latency_ms = elapsed,
            status = if result.is_ok() { "ok" } else { "error" },
        );
        result
    }
}
