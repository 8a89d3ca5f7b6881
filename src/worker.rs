//! Parallel connect-worker pool.
//!
//! A bounded queue feeds a fixed set of consumers, each running one full
//! MDM command cycle per job. Workers accumulate their own statistics
//! locally; the totals are merged only after every worker has joined.

use std::sync::Arc;
use std::time::{Duration, Instant};

use mdmsim_device::{Device, MdmClient};
use tokio::sync::{mpsc, Mutex};

/// One device queued onto the pool.
pub struct ConnectWorkerData {
    /// The device record.
    pub device: Device,
    /// The device's MDM client, constructed before the pool starts.
    pub client: MdmClient,
}

/// Latency statistics for a pool run.
#[derive(Debug, Clone, Default)]
pub struct ConnectStats {
    /// Number of command cycles attempted.
    pub total: u64,
    /// Number of cycles that failed.
    pub errors: u64,
    /// Wall time for the whole run.
    pub elapsed: Duration,
    /// Fastest successful cycle.
    pub min: Duration,
    /// Slowest successful cycle.
    pub max: Duration,
    /// Mean cycle latency over successful cycles.
    pub mean: Duration,
    /// Population standard deviation of successful cycle latencies.
    pub stddev: Duration,
}

impl ConnectStats {
    /// Error share in percent, zero when nothing ran.
    pub fn error_percent(&self) -> u64 {
        if self.total == 0 {
            0
        } else {
            self.errors * 100 / self.total
        }
    }

    fn from_durations(durations: &[Duration], errors: u64, total: u64, elapsed: Duration) -> Self {
        let mut stats = Self {
            total,
            errors,
            elapsed,
            ..Default::default()
        };
        if durations.is_empty() {
            return stats;
        }

        stats.min = durations.iter().copied().min().unwrap_or_default();
        stats.max = durations.iter().copied().max().unwrap_or_default();

        let sum: Duration = durations.iter().sum();
        let mean_secs = sum.as_secs_f64() / durations.len() as f64;
        stats.mean = Duration::from_secs_f64(mean_secs);

        let variance = durations
            .iter()
            .map(|d| (d.as_secs_f64() - mean_secs).powi(2))
            .sum::<f64>()
            / durations.len() as f64;
        stats.stddev = Duration::from_secs_f64(variance.sqrt());

        stats
    }
}

impl std::fmt::Display for ConnectStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Total requests\t{}", self.total)?;
        writeln!(f, "Errors\t{} ({}%)", self.errors, self.error_percent())?;
        writeln!(f, "Total elapsed time\t{:?}", self.elapsed)?;
        writeln!(f, "Min request elapsed\t{:?}", self.min)?;
        writeln!(f, "Max request elapsed\t{:?}", self.max)?;
        writeln!(f, "Avg (mean) request elapsed\t{:?}", self.mean)?;
        write!(f, "Stddev request elapsed\t{:?}", self.stddev)
    }
}

async fn connect_work(job: &Mutex<ConnectWorkerData>) -> color_eyre::eyre::Result<()> {
    let mut job = job.lock().await;
    job.client.connect().await
}

/// Drive `workers` concurrent consumers over every device `iterations`
/// times and report the merged statistics. Cycle failures are logged and
/// counted without aborting the other workers.
pub async fn run_connect_workers(
    data: Vec<ConnectWorkerData>,
    workers: usize,
    iterations: usize,
) -> ConnectStats {
    let workers = workers.max(1);

    let jobs: Vec<Arc<Mutex<ConnectWorkerData>>> = data
        .into_iter()
        .map(|d| Arc::new(Mutex::new(d)))
        .collect();

    let (tx, rx) = mpsc::channel::<Arc<Mutex<ConnectWorkerData>>>(workers);
    let rx = Arc::new(Mutex::new(rx));

    let mut handles = Vec::with_capacity(workers);
    for _ in 0..workers {
        let rx = Arc::clone(&rx);
        handles.push(tokio::spawn(async move {
            let mut durations = Vec::new();
            let mut errors = 0u64;
            let mut total = 0u64;
            loop {
                let job = { rx.lock().await.recv().await };
                let Some(job) = job else { break };

                total += 1;
                let started = Instant::now();
                let result = connect_work(&job).await;
                let elapsed = started.elapsed();

                match result {
                    Ok(()) => durations.push(elapsed),
                    Err(e) => {
                        errors += 1;
                        let udid = job.lock().await.device.udid.clone();
                        tracing::error!(udid = %udid, error = %e, "device connect failed");
                    }
                }
            }
            (durations, errors, total)
        }));
    }

    let start = Instant::now();
    for _ in 0..iterations {
        for job in &jobs {
            // a closed channel here means every worker died; nothing to do
            if tx.send(Arc::clone(job)).await.is_err() {
                break;
            }
        }
    }
    drop(tx);

    let mut durations = Vec::new();
    let mut errors = 0u64;
    let mut total = 0u64;
    for handle in handles {
        if let Ok((worker_durations, worker_errors, worker_total)) = handle.await {
            durations.extend(worker_durations);
            errors += worker_errors;
            total += worker_total;
        }
    }

    ConnectStats::from_durations(&durations, errors, total, start.elapsed())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_from_durations() {
        let durations = vec![
            Duration::from_millis(100),
            Duration::from_millis(200),
            Duration::from_millis(300),
        ];
        let stats =
            ConnectStats::from_durations(&durations, 1, 4, Duration::from_millis(450));

        assert_eq!(stats.total, 4);
        assert_eq!(stats.errors, 1);
        assert_eq!(stats.error_percent(), 25);
        assert_eq!(stats.min, Duration::from_millis(100));
        assert_eq!(stats.max, Duration::from_millis(300));
        assert_eq!(stats.mean, Duration::from_millis(200));

        // population stddev of {0.1, 0.2, 0.3} around 0.2
        let expected = (0.02f64 / 3.0).sqrt();
        assert!((stats.stddev.as_secs_f64() - expected).abs() < 1e-9);
    }

    #[test]
    fn test_stats_empty() {
        let stats = ConnectStats::from_durations(&[], 0, 0, Duration::ZERO);
        assert_eq!(stats.total, 0);
        assert_eq!(stats.error_percent(), 0);
        assert_eq!(stats.mean, Duration::ZERO);
    }

    #[test]
    fn test_display_contains_fields() {
        let stats = ConnectStats::from_durations(
            &[Duration::from_millis(10)],
            0,
            1,
            Duration::from_millis(12),
        );
        let out = stats.to_string();
        assert!(out.contains("Total requests\t1"));
        assert!(out.contains("Errors\t0 (0%)"));
        assert!(out.contains("Stddev request elapsed"));
    }
}
