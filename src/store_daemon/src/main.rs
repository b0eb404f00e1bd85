mod fspathrgrp;
mod target;

use log::{error, info};
use ostore_lib::{BucketMd, Config, Smap, Snode, StoreResult};
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use target::Target;
use transport::HttpPeerTransport;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/ostore/target.json";

fn usage() -> String {
    format!(
        "usage: store_daemon --daemon-id <id> [--config <path>]\n\
         defaults:\n\
         --config {}",
        DEFAULT_CONFIG_PATH
    )
}

struct RunOptions {
    daemon_id: String,
    config_path: PathBuf,
}

fn parse_args() -> Result<RunOptions, String> {
    let args = env::args().skip(1).collect::<Vec<String>>();
    if args.is_empty() || args[0] == "-h" || args[0] == "--help" {
        return Err(usage());
    }

    let mut daemon_id = String::new();
    let mut config_path = PathBuf::from(DEFAULT_CONFIG_PATH);

    let mut i = 0usize;
    while i < args.len() {
        match args[i].as_str() {
            "--daemon-id" => {
                i += 1;
                let value = args
                    .get(i)
                    .ok_or_else(|| "missing value for --daemon-id".to_string())?;
                daemon_id = value.clone();
            }
            "--config" => {
                i += 1;
                let value = args
                    .get(i)
                    .ok_or_else(|| "missing value for --config".to_string())?;
                config_path = PathBuf::from(value);
            }
            other => {
                return Err(format!("unknown argument: {}\n{}", other, usage()));
            }
        }
        i += 1;
    }

    if daemon_id.is_empty() {
        return Err(format!("missing --daemon-id\n{}", usage()));
    }
    Ok(RunOptions {
        daemon_id,
        config_path,
    })
}

async fn run_target(options: RunOptions) -> StoreResult<()> {
    let raw = std::fs::read_to_string(&options.config_path).map_err(|e| {
        ostore_lib::StoreError::Config(format!(
            "cannot read config {}: {}",
            options.config_path.display(),
            e
        ))
    })?;
    let config = Config::from_json(&raw)?;

    // the target starts alone; the cluster-map and bucket-metadata owners
    // are fed by the gossip collaborators once they connect
    let mut smap = Smap::default();
    smap.version = 1;
    smap.tmap
        .insert(options.daemon_id.clone(), Snode::new(options.daemon_id.clone()));
    let bmd = BucketMd::default();

    let target = Target::new(
        &options.daemon_id,
        config,
        smap,
        bmd,
        Arc::new(HttpPeerTransport::new()),
    )?;
    info!("store target {} started", target.si.daemon_id);

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| ostore_lib::StoreError::Internal(format!("signal handler: {}", e)))?;
    info!("shutting down");
    target.shutdown();
    Ok(())
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let options = match parse_args() {
        Ok(v) => v,
        Err(msg) => {
            eprintln!("{}", msg);
            std::process::exit(1);
        }
    };

    if let Err(err) = run_target(options).await {
        error!("run store_daemon failed: {}", err);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod daemon_tests;
