//! Inspect an LMDB cache mirror.
//!
//! Usage: cache-inspect <lmdb-dir> [--sweep] [--clear]
//!
//! Prints the store statistics as JSON. `--sweep` removes expired and
//! corrupt documents first; `--clear` removes every entry under the
//! configured prefix.

use std::process::ExitCode;

use clinic_cache::CacheStore;
use clinic_core::CacheConfig;
use clinic_pipeline::{init_tracing, TelemetryConfig};

fn usage() -> ExitCode {
    eprintln!("Usage: cache-inspect <lmdb-dir> [--sweep] [--clear]");
    ExitCode::from(2)
}

#[tokio::main]
async fn main() -> ExitCode {
    let mut dir = None;
    let mut sweep = false;
    let mut clear = false;
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--sweep" => sweep = true,
            "--clear" => clear = true,
            "-h" | "--help" => return usage(),
            other if other.starts_with("--") => {
                eprintln!("Unknown flag: {}", other);
                return usage();
            }
            other if dir.is_none() => dir = Some(other.to_string()),
            _ => return usage(),
        }
    }
    let Some(dir) = dir else {
        return usage();
    };

    if let Err(e) = init_tracing(&TelemetryConfig::from_env()) {
        eprintln!("Warning: {}", e);
    }

    let store = match CacheStore::with_lmdb(CacheConfig::from_env(), &dir) {
        Ok(store) => store,
        Err(e) => {
            eprintln!("Failed to open {}: {}", dir, e);
            return ExitCode::FAILURE;
        }
    };

    if sweep {
        let removed = store.cleanup_expired().await;
        eprintln!("Swept {} expired entries", removed);
    }
    if clear {
        if let Err(e) = store.clear().await {
            eprintln!("Failed to clear cache: {}", e);
            return ExitCode::FAILURE;
        }
        eprintln!("Cleared cache");
    }

    match serde_json::to_string_pretty(&store.get_stats()) {
        Ok(json) => {
            println!("{}", json);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Failed to render stats: {}", e);
            ExitCode::FAILURE
        }
    }
}
