//! Load generation for experiments.
//!
//! The driver builds a pool of worker tasks from the loadgen section of the
//! experiment spec. Tasks are drawn weighted-random or sequentially; when
//! stages are present, a shape driver adjusts the worker count once per
//! second, adding at most `spawn_rate` workers per tick. A self-quit timer
//! stops everything after `run_time`. Per-request statistics feed the
//! report's loadgen section.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use rand::distributions::{Distribution, WeightedIndex};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::{LoadGenError, OxnError};
use crate::spec::{HttpVerb, LoadgenSpec, StageSpec, TaskSpec};
use crate::util::{time_string_to_seconds, utc_timestamp};

const SHAPE_TICK: Duration = Duration::from_secs(1);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Accumulated request statistics, shared between workers and the report.
#[derive(Default)]
pub struct RequestStats {
    inner: Mutex<StatsInner>,
}

#[derive(Default)]
struct StatsInner {
    start_time: Option<f64>,
    last_request_timestamp: Option<f64>,
    num_requests: u64,
    num_failures: u64,
    entries: BTreeMap<(String, String), EntryInner>,
}

#[derive(Default)]
struct EntryInner {
    num_requests: u64,
    num_failures: u64,
    response_times_ms: Vec<f64>,
}

impl RequestStats {
    fn mark_started(&self) {
        let mut inner = self.inner.lock().expect("stats lock");
        inner.start_time = Some(utc_timestamp());
    }

    fn record(&self, endpoint: &str, verb: &str, response_time_ms: f64, failed: bool) {
        let mut inner = self.inner.lock().expect("stats lock");
        inner.num_requests += 1;
        if failed {
            inner.num_failures += 1;
        }
        inner.last_request_timestamp = Some(utc_timestamp());
        let entry = inner
            .entries
            .entry((endpoint.to_string(), verb.to_string()))
            .or_default();
        entry.num_requests += 1;
        if failed {
            entry.num_failures += 1;
        }
        entry.response_times_ms.push(response_time_ms);
    }

    /// An immutable aggregate view for reporting.
    pub fn snapshot(&self) -> RequestStatsSnapshot {
        let inner = self.inner.lock().expect("stats lock");
        let entries = inner
            .entries
            .iter()
            .map(|((endpoint, verb), entry)| {
                let mut sorted = entry.response_times_ms.clone();
                sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
                let sum: f64 = sorted.iter().sum();
                let count = sorted.len();
                TaskStats {
                    url: endpoint.clone(),
                    verb: verb.clone(),
                    requests: entry.num_requests,
                    failures: entry.num_failures,
                    fail_ratio: if entry.num_requests > 0 {
                        entry.num_failures as f64 / entry.num_requests as f64
                    } else {
                        0.0
                    },
                    sum_response_time: sum,
                    min_response_time: sorted.first().copied().unwrap_or(0.0),
                    max_response_time: sorted.last().copied().unwrap_or(0.0),
                    avg_response_time: if count > 0 { sum / count as f64 } else { 0.0 },
                    median_response_time: if count > 0 { sorted[count / 2] } else { 0.0 },
                }
            })
            .collect();
        RequestStatsSnapshot {
            start_time: inner.start_time,
            last_request_timestamp: inner.last_request_timestamp,
            num_requests: inner.num_requests,
            num_failures: inner.num_failures,
            entries,
        }
    }
}

/// Aggregate request statistics at a point in time.
pub struct RequestStatsSnapshot {
    pub start_time: Option<f64>,
    pub last_request_timestamp: Option<f64>,
    pub num_requests: u64,
    pub num_failures: u64,
    pub entries: Vec<TaskStats>,
}

/// Per-task aggregates. Response times are milliseconds.
pub struct TaskStats {
    pub url: String,
    pub verb: String,
    pub requests: u64,
    pub failures: u64,
    pub fail_ratio: f64,
    pub sum_response_time: f64,
    pub min_response_time: f64,
    pub max_response_time: f64,
    pub avg_response_time: f64,
    pub median_response_time: f64,
}

/// Load generation driver built from the spec's loadgen section.
pub struct LoadGenerator {
    tasks: Arc<Vec<TaskSpec>>,
    stages: Vec<StageSpec>,
    run_time: f64,
    sequential: bool,
    base_url: String,
    client: reqwest::Client,
    stats: Arc<RequestStats>,
    stop: Arc<AtomicBool>,
    driver: Option<JoinHandle<()>>,
}

impl LoadGenerator {
    pub fn new(loadgen: &LoadgenSpec) -> Result<Self, OxnError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| LoadGenError::Startup(e.to_string()))?;
        Ok(Self {
            tasks: Arc::new(loadgen.tasks.clone()),
            stages: loadgen.stages.clone(),
            run_time: time_string_to_seconds(&loadgen.run_time),
            sequential: loadgen.sequential,
            base_url: loadgen.base_url.trim_end_matches('/').to_string(),
            client,
            stats: Arc::new(RequestStats::default()),
            stop: Arc::new(AtomicBool::new(false)),
            driver: None,
        })
    }

    pub fn stats(&self) -> Arc<RequestStats> {
        Arc::clone(&self.stats)
    }

    /// The `(users, spawn_rate)` target at elapsed seconds `t`: the first
    /// stage whose duration bound exceeds `t`. `None` past the last stage.
    fn shape_tick(stages: &[StageSpec], elapsed: f64) -> Option<(u64, u64)> {
        stages
            .iter()
            .find(|stage| elapsed < stage.duration as f64)
            .map(|stage| (stage.users, stage.spawn_rate))
    }

    /// Launch the worker pool and schedule the self-quit after `run_time`.
    pub fn start(&mut self) -> Result<(), OxnError> {
        if self.driver.is_some() {
            return Err(LoadGenError::Startup("load generator already running".into()).into());
        }
        if self.tasks.is_empty() {
            return Err(LoadGenError::Startup("no load generation tasks defined".into()).into());
        }
        self.stats.mark_started();

        let stages = self.stages.clone();
        let run_time = self.run_time;
        let stop = Arc::clone(&self.stop);
        let tasks = Arc::clone(&self.tasks);
        let stats = Arc::clone(&self.stats);
        let client = self.client.clone();
        let base_url = self.base_url.clone();
        let sequential = self.sequential;

        let driver = tokio::spawn(async move {
            let started = Instant::now();
            let deadline = started + Duration::from_secs_f64(run_time);
            let mut workers: Vec<(JoinHandle<()>, Arc<AtomicBool>)> = Vec::new();

            loop {
                if stop.load(Ordering::Relaxed) || Instant::now() >= deadline {
                    break;
                }
                let elapsed = started.elapsed().as_secs_f64();
                let (target, spawn_rate) = if stages.is_empty() {
                    (1, 1)
                } else {
                    Self::shape_tick(&stages, elapsed).unwrap_or((0, 1))
                };
                let current = workers.len() as u64;
                if current < target {
                    let to_spawn = (target - current).min(spawn_rate.max(1));
                    for _ in 0..to_spawn {
                        let worker_stop = Arc::new(AtomicBool::new(false));
                        let handle = tokio::spawn(run_worker(
                            client.clone(),
                            base_url.clone(),
                            Arc::clone(&tasks),
                            sequential,
                            Arc::clone(&stats),
                            Arc::clone(&stop),
                            Arc::clone(&worker_stop),
                        ));
                        workers.push((handle, worker_stop));
                    }
                } else if current > target {
                    for (handle, worker_stop) in workers.drain(target as usize..) {
                        worker_stop.store(true, Ordering::Relaxed);
                        handle.abort();
                    }
                }
                tokio::time::sleep(SHAPE_TICK).await;
            }

            stop.store(true, Ordering::Relaxed);
            for (handle, _) in workers {
                // Workers observe the stop flag between requests.
                if let Err(error) = handle.await
                    && !error.is_cancelled()
                {
                    tracing::warn!(%error, "load generation worker panicked");
                }
            }
            tracing::debug!("load generation finished");
        });
        self.driver = Some(driver);
        Ok(())
    }

    /// Block until the self-quit timer has fired and all workers drained.
    pub async fn stop(&mut self) -> Result<(), OxnError> {
        if let Some(driver) = self.driver.take() {
            driver
                .await
                .map_err(|e| LoadGenError::Shutdown(e.to_string()))?;
        }
        Ok(())
    }

    /// Forcibly terminate load generation on error paths.
    pub fn kill(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(driver) = self.driver.take() {
            driver.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.driver.is_some()
    }
}

async fn run_worker(
    client: reqwest::Client,
    base_url: String,
    tasks: Arc<Vec<TaskSpec>>,
    sequential: bool,
    stats: Arc<RequestStats>,
    stop: Arc<AtomicBool>,
    worker_stop: Arc<AtomicBool>,
) {
    let weights: Vec<u32> = tasks.iter().map(|task| task.weight.max(1)).collect();
    let chooser = WeightedIndex::new(&weights).ok();
    let mut next_sequential = 0usize;

    while !stop.load(Ordering::Relaxed) && !worker_stop.load(Ordering::Relaxed) {
        let index = if sequential {
            let index = next_sequential;
            next_sequential = (next_sequential + 1) % tasks.len();
            index
        } else {
            match &chooser {
                // Sample before the await so the rng does not cross it.
                Some(chooser) => chooser.sample(&mut rand::thread_rng()),
                None => 0,
            }
        };
        let task = &tasks[index];
        let url = format!("{base_url}{}", task.endpoint);
        let request = match task.verb {
            HttpVerb::Get => client.get(&url),
            HttpVerb::Post => client.post(&url),
        };
        let request = match &task.params {
            Some(params) => request.json(params),
            None => request,
        };
        let started = Instant::now();
        let outcome = request.send().await;
        let response_time_ms = started.elapsed().as_secs_f64() * 1e3;
        let failed = match outcome {
            Ok(response) => {
                let status = response.status();
                tracing::trace!(%url, %status, response_time_ms, "load generation request");
                !status.is_success()
            }
            Err(error) => {
                tracing::trace!(%url, %error, "load generation request failed");
                true
            }
        };
        stats.record(&task.endpoint, task.verb.as_str(), response_time_ms, failed);
        tokio::task::yield_now().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stages() -> Vec<StageSpec> {
        vec![
            StageSpec {
                duration: 30,
                users: 5,
                spawn_rate: 1,
            },
            StageSpec {
                duration: 60,
                users: 10,
                spawn_rate: 2,
            },
        ]
    }

    #[test]
    fn shape_returns_the_first_unexpired_stage() {
        assert_eq!(LoadGenerator::shape_tick(&stages(), 0.0), Some((5, 1)));
        assert_eq!(LoadGenerator::shape_tick(&stages(), 29.0), Some((5, 1)));
        assert_eq!(LoadGenerator::shape_tick(&stages(), 30.0), Some((10, 2)));
        assert_eq!(LoadGenerator::shape_tick(&stages(), 59.9), Some((10, 2)));
        assert_eq!(LoadGenerator::shape_tick(&stages(), 60.0), None);
    }

    #[test]
    fn stats_aggregate_per_task() {
        let stats = RequestStats::default();
        stats.mark_started();
        stats.record("/", "get", 10.0, false);
        stats.record("/", "get", 20.0, false);
        stats.record("/", "get", 30.0, true);
        stats.record("/api/cart", "post", 5.0, false);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.num_requests, 4);
        assert_eq!(snapshot.num_failures, 1);
        assert_eq!(snapshot.entries.len(), 2);

        let root = snapshot
            .entries
            .iter()
            .find(|entry| entry.url == "/")
            .expect("root entry");
        assert_eq!(root.requests, 3);
        assert_eq!(root.failures, 1);
        assert_eq!(root.min_response_time, 10.0);
        assert_eq!(root.max_response_time, 30.0);
        assert_eq!(root.avg_response_time, 20.0);
        assert_eq!(root.median_response_time, 20.0);
        assert_eq!(root.sum_response_time, 60.0);
        assert!((root.fail_ratio - 1.0 / 3.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn generator_rejects_empty_task_lists() {
        let loadgen = LoadgenSpec {
            run_time: "1s".to_string(),
            sequential: false,
            stages: Vec::new(),
            tasks: Vec::new(),
            base_url: "http://localhost:8080".to_string(),
        };
        let mut generator = LoadGenerator::new(&loadgen).expect("builds");
        let err = generator.start().expect_err("must fail");
        assert!(matches!(err, OxnError::LoadGen(LoadGenError::Startup(_))));
    }

    #[tokio::test]
    async fn generator_self_quits_after_run_time() {
        let loadgen = LoadgenSpec {
            run_time: "1s".to_string(),
            sequential: true,
            stages: Vec::new(),
            tasks: vec![TaskSpec {
                name: String::new(),
                // Nothing listens here; failures still count as requests.
                endpoint: "/".to_string(),
                verb: HttpVerb::Get,
                weight: 1,
                params: None,
            }],
            base_url: "http://127.0.0.1:1".to_string(),
        };
        let mut generator = LoadGenerator::new(&loadgen).expect("builds");
        generator.start().expect("starts");
        assert!(generator.is_running());
        generator.stop().await.expect("stops");
        assert!(!generator.is_running());
    }
}
