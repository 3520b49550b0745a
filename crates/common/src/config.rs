use std::env;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{CzarError, Result};
use crate::ids::{CzarId, MAX_ATTEMPTS_PER_JOB};

/// Storage engine class of the merge table.
///
/// Decides how many bulk inserts may run against one merge table at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeEngine {
    /// Table-locking engine: inserts are fully serialized.
    MyIsam,
    /// Row-locking engine: bounded parallel inserts.
    InnoDb,
    /// In-memory engine: bounded parallel inserts.
    Memory,
}

impl MergeEngine {
    /// Number of concurrent physical inserts allowed for this engine.
    pub fn insert_permits(&self, max_concurrent_merges: usize) -> usize {
        match self {
            MergeEngine::MyIsam => 1,
            MergeEngine::InnoDb | MergeEngine::Memory => max_concurrent_merges.max(1),
        }
    }

    /// Parse `myisam` / `innodb` / `memory`, case-insensitively.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "myisam" => Some(MergeEngine::MyIsam),
            "innodb" => Some(MergeEngine::InnoDb),
            "memory" => Some(MergeEngine::Memory),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
/// Czar behavior/configuration knobs.
pub struct CzarConfig {
    /// Identity of this czar in UberJob payloads.
    pub czar_id: CzarId,
    /// Max jobs batched into one UberJob.
    pub uber_job_max_chunks: usize,
    /// Max resolve attempts per job before the query fails.
    pub max_job_attempts: u32,
    /// Hard cap on accumulated result bytes per query.
    pub max_result_table_size_bytes: u64,
    /// Storage engine class of merge tables.
    pub merge_engine: MergeEngine,
    /// Max parallel inserts for engines that allow them.
    pub max_concurrent_merges: usize,
    /// Max reconnects for a failing result-database statement.
    pub max_sql_reconnects: u32,
    /// Sleep between result-database reconnect attempts.
    pub sql_reconnect_sleep_ms: u64,
    /// Fixed backoff between failed chunk map builds.
    pub chunk_map_retry_ms: u64,
    /// Period of the registry poll (chunk inventory and worker contacts).
    pub registry_poll_interval_ms: u64,
    /// A worker not updated for this long is considered dead.
    pub worker_dead_after_ms: u64,
    /// Period of the per-query re-batching timer for unassigned chunks.
    pub rebuild_interval_ms: u64,
    /// Rows per generated bulk insert statement.
    pub insert_rows_per_statement: usize,
    /// Max number of archived query progress histories.
    pub progress_archive_limit: usize,
}

impl Default for CzarConfig {
    fn default() -> Self {
        Self {
            czar_id: CzarId(1),
            uber_job_max_chunks: 10,
            max_job_attempts: 5,
            max_result_table_size_bytes: 5 * 1024 * 1024 * 1024,
            merge_engine: MergeEngine::InnoDb,
            max_concurrent_merges: 4,
            max_sql_reconnects: 3,
            sql_reconnect_sleep_ms: 500,
            chunk_map_retry_ms: 10_000,
            registry_poll_interval_ms: 15_000,
            worker_dead_after_ms: 60_000,
            rebuild_interval_ms: 5_000,
            insert_rows_per_statement: 256,
            progress_archive_limit: 1_000,
        }
    }
}

impl CzarConfig {
    /// Load a JSON config file; missing fields keep their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path.as_ref())?;
        let cfg: CzarConfig = serde_json::from_str(&raw).map_err(|e| {
            CzarError::InvalidConfig(format!(
                "config '{}' parse failed: {e}",
                path.as_ref().display()
            ))
        })?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Apply `CZAR_*` environment overrides. Unparsable values keep the current value.
    pub fn with_env_overrides(mut self) -> Self {
        self.czar_id = CzarId(env_u32_or_default("CZAR_ID", self.czar_id.0));
        self.uber_job_max_chunks =
            env_usize_or_default("CZAR_UBER_JOB_MAX_CHUNKS", self.uber_job_max_chunks);
        self.max_job_attempts = env_u32_or_default("CZAR_MAX_JOB_ATTEMPTS", self.max_job_attempts);
        self.max_result_table_size_bytes = env_u64_or_default(
            "CZAR_MAX_RESULT_TABLE_SIZE_BYTES",
            self.max_result_table_size_bytes,
        );
        if let Some(engine) = env::var("CZAR_MERGE_ENGINE")
            .ok()
            .and_then(|v| MergeEngine::parse(&v))
        {
            self.merge_engine = engine;
        }
        self.max_concurrent_merges =
            env_usize_or_default("CZAR_MAX_CONCURRENT_MERGES", self.max_concurrent_merges);
        self.max_sql_reconnects =
            env_u32_or_default("CZAR_MAX_SQL_RECONNECTS", self.max_sql_reconnects);
        self.sql_reconnect_sleep_ms =
            env_u64_or_default("CZAR_SQL_RECONNECT_SLEEP_MS", self.sql_reconnect_sleep_ms);
        self.chunk_map_retry_ms =
            env_u64_or_default("CZAR_CHUNK_MAP_RETRY_MS", self.chunk_map_retry_ms);
        self.registry_poll_interval_ms = env_u64_or_default(
            "CZAR_REGISTRY_POLL_INTERVAL_MS",
            self.registry_poll_interval_ms,
        );
        self.worker_dead_after_ms =
            env_u64_or_default("CZAR_WORKER_DEAD_AFTER_MS", self.worker_dead_after_ms);
        self.rebuild_interval_ms =
            env_u64_or_default("CZAR_REBUILD_INTERVAL_MS", self.rebuild_interval_ms);
        self
    }

    /// Reject configurations the dispatch core cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.uber_job_max_chunks == 0 {
            return Err(CzarError::InvalidConfig(
                "uber_job_max_chunks must be > 0".to_string(),
            ));
        }
        if self.max_job_attempts == 0 || self.max_job_attempts >= MAX_ATTEMPTS_PER_JOB {
            return Err(CzarError::InvalidConfig(format!(
                "max_job_attempts must be in 1..{MAX_ATTEMPTS_PER_JOB}"
            )));
        }
        if self.insert_rows_per_statement == 0 {
            return Err(CzarError::InvalidConfig(
                "insert_rows_per_statement must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

fn env_u32_or_default(key: &str, default: u32) -> u32 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(default)
}

fn env_u64_or_default(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_usize_or_default(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(default)
}
