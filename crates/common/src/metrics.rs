use std::sync::Arc;

use prometheus::{
    CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};

/// Prometheus-backed czar statistics.
///
/// Constructed once by the czar service and cloned into every executive and merger.
#[derive(Clone, Debug)]
pub struct MetricsRegistry {
    inner: Arc<MetricsInner>,
}

#[derive(Debug)]
struct MetricsInner {
    registry: Registry,
    merge_bytes: CounterVec,
    merge_rows: CounterVec,
    merge_batches: CounterVec,
    merge_skipped: CounterVec,
    merge_failures: CounterVec,
    merge_seconds: HistogramVec,
    uber_jobs_dispatched: CounterVec,
    uber_jobs_in_flight: GaugeVec,
    job_retries: CounterVec,
    missing_chunks: CounterVec,
    query_outcomes: CounterVec,
    chunk_map_builds: CounterVec,
    dead_workers: CounterVec,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner::new()),
        }
    }

    pub fn record_merge(&self, query_id: u64, bytes: u64, rows: u64, secs: f64) {
        let qid = query_id.to_string();
        let labels = [qid.as_str()];
        self.inner
            .merge_bytes
            .with_label_values(&labels)
            .inc_by(bytes as f64);
        self.inner
            .merge_rows
            .with_label_values(&labels)
            .inc_by(rows as f64);
        self.inner.merge_batches.with_label_values(&labels).inc();
        self.inner
            .merge_seconds
            .with_label_values(&labels)
            .observe(secs.max(0.0));
    }

    pub fn inc_merge_skipped(&self, query_id: u64, reason: &str) {
        let qid = query_id.to_string();
        self.inner
            .merge_skipped
            .with_label_values(&[qid.as_str(), reason])
            .inc();
    }

    pub fn inc_merge_failures(&self, query_id: u64) {
        let qid = query_id.to_string();
        self.inner
            .merge_failures
            .with_label_values(&[qid.as_str()])
            .inc();
    }

    pub fn inc_uber_jobs_dispatched(&self, worker_id: &str) {
        self.inner
            .uber_jobs_dispatched
            .with_label_values(&[worker_id])
            .inc();
    }

    pub fn add_uber_jobs_in_flight(&self, query_id: u64, delta: i64) {
        let qid = query_id.to_string();
        self.inner
            .uber_jobs_in_flight
            .with_label_values(&[qid.as_str()])
            .add(delta as f64);
    }

    pub fn inc_job_retries(&self, query_id: u64) {
        let qid = query_id.to_string();
        self.inner.job_retries.with_label_values(&[qid.as_str()]).inc();
    }

    pub fn inc_missing_chunks(&self, query_id: u64) {
        let qid = query_id.to_string();
        self.inner
            .missing_chunks
            .with_label_values(&[qid.as_str()])
            .inc();
    }

    pub fn inc_query_outcome(&self, outcome: &str) {
        self.inner
            .query_outcomes
            .with_label_values(&[outcome])
            .inc();
    }

    pub fn inc_chunk_map_builds(&self, result: &str) {
        self.inner
            .chunk_map_builds
            .with_label_values(&[result])
            .inc();
    }

    pub fn inc_dead_workers(&self, worker_id: &str) {
        self.inner
            .dead_workers
            .with_label_values(&[worker_id])
            .inc();
    }

    pub fn render_prometheus(&self) -> String {
        let metric_families = self.inner.registry.gather();
        let mut out = Vec::new();
        let enc = TextEncoder::new();
        if enc.encode(&metric_families, &mut out).is_err() {
            return String::new();
        }
        String::from_utf8_lossy(&out).to_string()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsInner {
    fn new() -> Self {
        let registry = Registry::new();

        let merge_bytes = counter_vec(
            &registry,
            "czar_merge_bytes_total",
            "Result bytes merged into merge tables",
            &["query_id"],
        );
        let merge_rows = counter_vec(
            &registry,
            "czar_merge_rows_total",
            "Result rows merged into merge tables",
            &["query_id"],
        );
        let merge_batches = counter_vec(
            &registry,
            "czar_merge_batches_total",
            "Row batches merged",
            &["query_id"],
        );
        let merge_skipped = counter_vec(
            &registry,
            "czar_merge_skipped_total",
            "Row batches received but not merged",
            &["query_id", "reason"],
        );
        let merge_failures = counter_vec(
            &registry,
            "czar_merge_failures_total",
            "Row batches whose merge failed",
            &["query_id"],
        );
        let merge_seconds = histogram_vec(
            &registry,
            "czar_merge_seconds",
            "Time spent merging one row batch",
            &["query_id"],
        );

        let uber_jobs_dispatched = counter_vec(
            &registry,
            "czar_uber_jobs_dispatched_total",
            "UberJobs sent to workers",
            &["worker_id"],
        );
        let uber_jobs_in_flight = gauge_vec(
            &registry,
            "czar_uber_jobs_in_flight",
            "UberJobs currently awaiting worker responses",
            &["query_id"],
        );
        let job_retries = counter_vec(
            &registry,
            "czar_job_retries_total",
            "Jobs reverted to unassigned for re-batching",
            &["query_id"],
        );
        let missing_chunks = counter_vec(
            &registry,
            "czar_missing_chunks_total",
            "Chunk resolutions that found no live worker",
            &["query_id"],
        );
        let query_outcomes = counter_vec(
            &registry,
            "czar_query_outcomes_total",
            "Finished queries by outcome",
            &["outcome"],
        );
        let chunk_map_builds = counter_vec(
            &registry,
            "czar_chunk_map_builds_total",
            "Chunk map build attempts by result",
            &["result"],
        );
        let dead_workers = counter_vec(
            &registry,
            "czar_dead_worker_events_total",
            "Workers observed transitioning to dead",
            &["worker_id"],
        );

        Self {
            registry,
            merge_bytes,
            merge_rows,
            merge_batches,
            merge_skipped,
            merge_failures,
            merge_seconds,
            uber_jobs_dispatched,
            uber_jobs_in_flight,
            job_retries,
            missing_chunks,
            query_outcomes,
            chunk_map_builds,
            dead_workers,
        }
    }
}

fn counter_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> CounterVec {
    let c = CounterVec::new(Opts::new(name, help), labels).expect("counter vec");
    registry
        .register(Box::new(c.clone()))
        .expect("register counter");
    c
}

fn gauge_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> GaugeVec {
    let g = GaugeVec::new(Opts::new(name, help), labels).expect("gauge vec");
    registry
        .register(Box::new(g.clone()))
        .expect("register gauge");
    g
}

fn histogram_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> HistogramVec {
    let h = HistogramVec::new(HistogramOpts::new(name, help), labels).expect("histogram vec");
    registry
        .register(Box::new(h.clone()))
        .expect("register histogram");
    h
}
