use std::env;
use std::sync::Arc;

use czar_chunkmap::JsonDirRegistry;
use czar_common::CzarConfig;
use czar_dispatch::grpc::GrpcWorkerTransport;
use czar_dispatch::{Czar, QueryOutcome, QueryPlan};
use czar_merge::{SqlConnection, SqliteConnection};
use tracing_subscriber::EnvFilter;

fn env_or_default(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn load_config(path: Option<String>) -> Result<CzarConfig, Box<dyn std::error::Error>> {
    let config = match path {
        Some(p) => CzarConfig::from_json_file(p)?,
        None => CzarConfig::default(),
    };
    Ok(config.with_env_overrides())
}

/// Serve `/metrics` when `CZAR_METRICS_ADDR` is set.
#[cfg(feature = "profiling")]
fn spawn_metrics_exporter(
    metrics: czar_common::MetricsRegistry,
) -> Result<Option<tokio::task::JoinHandle<()>>, Box<dyn std::error::Error>> {
    let Ok(addr) = env::var("CZAR_METRICS_ADDR") else {
        return Ok(None);
    };
    let addr: std::net::SocketAddr = addr.parse()?;
    Ok(Some(tokio::spawn(async move {
        if let Err(e) = czar_common::run_metrics_exporter(addr, metrics).await {
            tracing::error!(error = %e, operator = "CzarRun", "metrics exporter stopped");
        }
    })))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();

    let Some(plan_path) = env::args().nth(1) else {
        eprintln!("usage: czar-run <plan.json>");
        std::process::exit(2);
    };
    let config = load_config(env::var("CZAR_CONFIG_PATH").ok())?;
    let registry_dir = env_or_default("CZAR_REGISTRY_DIR", "/var/lib/czar/registry");
    let result_db = env_or_default("CZAR_RESULT_DB", "/var/lib/czar/result.db");
    let plan: QueryPlan = serde_json::from_str(&std::fs::read_to_string(&plan_path)?)?;

    let db: Arc<dyn SqlConnection> = Arc::new(SqliteConnection::open(&result_db)?);
    let czar = Czar::new(
        config,
        Arc::new(JsonDirRegistry::new(&registry_dir)),
        Arc::new(GrpcWorkerTransport::new()),
        Arc::clone(&db),
    )?;
    println!(
        "czar-run: plan={plan_path} query={} chunks={} registry_dir={registry_dir}",
        plan.query_id,
        plan.chunks.len()
    );
    println!("czar-run: result_db={result_db}");

    #[cfg(feature = "profiling")]
    let _exporter = spawn_metrics_exporter(czar.metrics().clone())?;

    czar.wait_until_ready().await;
    let background = czar.spawn_background();
    let query_id = plan.query_id;
    let exec = czar.submit(plan).await?;
    let outcome = exec.join().await;
    background.abort();

    for message in czar.messages().messages(query_id) {
        println!("[{:?}] code={} {}", message.severity, message.code, message.message);
    }
    match outcome {
        QueryOutcome::Success { rows } => {
            let sql = exec.result_query().await;
            let result = db.run_query(&sql)?;
            println!("rows={rows} table={} query: {sql}", exec.result_table_name());
            println!("{}", result.columns.join("\t"));
            for row in result.rows {
                let cells = row.iter().map(|v| format!("{v:?}")).collect::<Vec<_>>();
                println!("{}", cells.join("\t"));
            }
            Ok(())
        }
        QueryOutcome::Cancelled => Err("query cancelled".into()),
        QueryOutcome::Error(err) => Err(format!("query failed: {}", err.message).into()),
    }
}
