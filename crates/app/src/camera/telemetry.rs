//! Telemetry helpers for tracing, Prometheus metrics and frame-rate smoothing.

use std::{
    io,
    sync::{Mutex, OnceLock, PoisonError},
    thread,
    time::Duration,
};

use anyhow::{Context, Result, anyhow};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::warn;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

static PROM_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
static PROM_UPKEEP_THREAD: OnceLock<thread::JoinHandle<()>> = OnceLock::new();
static PROM_INIT: Mutex<()> = Mutex::new(());

/// Frame intervals averaged for the stream log line.
pub const FRAME_AVERAGE_WINDOW: usize = 20;

/// Install the global tracing subscriber: `RUST_LOG` filter (default `info`),
/// uptime-stamped fmt output and span traces for errors.
pub fn init_tracing() -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(false)
                .with_timer(fmt::time::uptime())
                .with_filter(env_filter),
        )
        .with(tracing_error::ErrorLayer::default())
        .try_init()
        .context("failed to install tracing subscriber")
}

/// Ensure the global metrics recorder is installed and return the Prometheus handle.
pub fn init_metrics_recorder() -> Result<&'static PrometheusHandle> {
    if let Some(handle) = PROM_HANDLE.get() {
        return Ok(handle);
    }
    let _init = PROM_INIT.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(handle) = PROM_HANDLE.get() {
        return Ok(handle);
    }

    let recorder = PrometheusBuilder::new().build_recorder();
    let handle = recorder.handle();
    metrics::set_global_recorder(recorder)
        .map_err(|_| anyhow!("a different metrics recorder is already installed"))?;

    let upkeep_handle = handle.clone();
    let upkeep = spawn_thread("prometheus-upkeep", move || {
        loop {
            thread::sleep(Duration::from_secs(5));
            upkeep_handle.run_upkeep();
        }
    })
    .context("failed to spawn prometheus upkeep thread")?;
    if PROM_UPKEEP_THREAD.set(upkeep).is_err() {
        warn!("prometheus upkeep thread already registered");
    }

    Ok(PROM_HANDLE.get_or_init(|| handle))
}

/// Access the Prometheus handle when already initialised.
pub fn prometheus_handle() -> Option<&'static PrometheusHandle> {
    PROM_HANDLE.get()
}

/// Spawn a thread that inherits the current tracing dispatcher.
pub fn spawn_thread<F, T>(name: impl Into<String>, f: F) -> io::Result<thread::JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let dispatch = tracing::dispatcher::get_default(|current| current.clone());
    thread::Builder::new()
        .name(name.into())
        .spawn(move || tracing::dispatcher::with_default(&dispatch, f))
}

/// Fixed-size window of recent samples with an incrementally maintained sum.
#[derive(Clone, Debug)]
pub struct RollingAverage {
    samples: Vec<u64>,
    next: usize,
    len: usize,
    sum: u64,
}

impl RollingAverage {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: vec![0; capacity.max(1)],
            next: 0,
            len: 0,
            sum: 0,
        }
    }

    /// Add a sample, evicting the oldest once the window is full, and return
    /// the new average.
    pub fn push(&mut self, value: u64) -> u64 {
        if self.len == self.samples.len() {
            self.sum -= self.samples[self.next];
        } else {
            self.len += 1;
        }
        self.samples[self.next] = value;
        self.sum += value;
        self.next = (self.next + 1) % self.samples.len();
        self.average()
    }

    pub fn average(&self) -> u64 {
        if self.len == 0 {
            0
        } else {
            self.sum / self.len as u64
        }
    }
}

impl Default for RollingAverage {
    fn default() -> Self {
        Self::new(FRAME_AVERAGE_WINDOW)
    }
}

/// Frames per second for a frame interval in milliseconds.
pub fn fps(interval_ms: u64) -> f64 {
    if interval_ms == 0 {
        0.0
    } else {
        1000.0 / interval_ms as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn concurrent_recorder_init_yields_one_handle() {
        let workers: Vec<_> = (0..4)
            .map(|_| thread::spawn(|| init_metrics_recorder().map(|h| h as *const _ as usize)))
            .collect();
        let handles: Vec<usize> = workers
            .into_iter()
            .map(|w| w.join().unwrap().unwrap())
            .collect();
        assert!(handles.windows(2).all(|pair| pair[0] == pair[1]));
        assert!(PROM_UPKEEP_THREAD.get().is_some());
        assert!(prometheus_handle().is_some());
    }

    #[test]
    fn average_over_partial_window() {
        let mut avg = RollingAverage::new(4);
        assert_eq!(avg.average(), 0);
        assert_eq!(avg.push(10), 10);
        assert_eq!(avg.push(20), 15);
        assert_eq!(avg.average(), 15);
    }

    #[test]
    fn oldest_samples_fall_out_of_window() {
        let mut avg = RollingAverage::new(3);
        for value in [5, 7, 9, 11, 13] {
            avg.push(value);
        }
        // Window now holds 9, 11, 13.
        assert_eq!(avg.average(), 11);
        assert_eq!(avg.push(2), 8);
    }

    #[test]
    fn fps_handles_zero_interval() {
        assert_eq!(fps(0), 0.0);
        assert_eq!(fps(50), 20.0);
    }
}
