use std::env;

use czar_chunkmap::{ChunkInventorySnapshot, FamilyLayout, FamilyMap};
use tracing_subscriber::EnvFilter;

fn load_layout(path: Option<String>) -> Result<FamilyLayout, Box<dyn std::error::Error>> {
    match path {
        Some(p) => Ok(serde_json::from_str(&std::fs::read_to_string(p)?)?),
        None => Ok(FamilyLayout::default()),
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();

    let mut args = env::args().skip(1);
    let Some(inventory_path) = args.next() else {
        eprintln!("usage: czar-chunkmap <chunks.json> [families.json]");
        std::process::exit(2);
    };
    let layout = load_layout(args.next())?;
    let snapshot = ChunkInventorySnapshot::from_json(&std::fs::read_to_string(&inventory_path)?)?;
    let map = FamilyMap::build(&snapshot, &layout)?;

    println!("update_time_ms={}", map.update_time_ms());
    for (family, chunk_map) in map.families() {
        println!("family {family}: {} chunks", chunk_map.len());
        for entry in chunk_map.workers() {
            println!(
                "  {}: holds={} shared_scan={} shared_scan_bytes={}",
                entry.worker_id,
                entry.chunk_ids.len(),
                entry.shared_scan_chunks.len(),
                entry.shared_scan_total_bytes
            );
        }
    }
    Ok(())
}
