//! The `status` subcommand: print the cluster registry.

use chrono::Utc;

use crate::app::config::Config;
use crate::core::kv::{namespaced, KvStore, RedisKv};
use crate::core::domain::ServerNode;
use crate::error::Result;

pub async fn execute(config: &Config) -> i32 {
    match print_status(config).await {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("status failed: {e}");
            2
        }
    }
}

async fn print_status(config: &Config) -> Result<()> {
    let Some(url) = &config.backend.redis_url else {
        println!("no REDIS_URL configured; cluster status needs the shared registry");
        return Ok(());
    };
    let kv = RedisKv::connect(url).await?;
    let records = kv.hgetall(&namespaced("servers:registry")).await?;

    if records.is_empty() {
        println!("no nodes registered");
        return Ok(());
    }

    let now = Utc::now();
    println!(
        "{:<32} {:<10} {:>6} {:>8} {:>10}",
        "node", "status", "conns", "load%", "hb age(s)"
    );
    let mut nodes: Vec<ServerNode> = records
        .values()
        .filter_map(|body| serde_json::from_str(body).ok())
        .collect();
    nodes.sort_by(|a, b| a.id.as_str().cmp(b.id.as_str()));
    for node in nodes {
        println!(
            "{:<32} {:<10} {:>6} {:>7.1}% {:>10}",
            node.id,
            format!("{:?}", node.status).to_lowercase(),
            node.connections,
            node.load_factor() * 100.0,
            (now - node.last_heartbeat).num_seconds(),
        );
    }
    Ok(())
}
