// Copyright 2025 TraceWire Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Subcommand implementations, kept out of `main.rs` so they can be driven
//! from tests without going through argument parsing.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::Value;
use tracewire_agent::{AgentClient, AgentConfig};
use tracewire_server::{ServerConfig, ServerPipeline};
use tracewire_trace::{metric_name, Endpoint, LoggingEndpoint, MetricType, TraceEvent};

/// Runs a server until Ctrl-C, logging every batch it receives.
pub async fn run_server(config: ServerConfig) -> Result<()> {
    let endpoints: Vec<Arc<dyn Endpoint>> = vec![Arc::new(LoggingEndpoint::new("log"))];
    let pipeline = ServerPipeline::bind(&config, endpoints)
        .await
        .with_context(|| format!("failed to start server on {}", config.bind_addr))?;
    tracing::info!(
        route = %config.route,
        flush_size = config.flush_size,
        flush_interval_ms = config.flush_interval.as_millis() as u64,
        "Server pipeline ready"
    );

    pipeline
        .serve_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for Ctrl-C: {}", e);
            }
        })
        .await?;
    Ok(())
}

/// Connects, sends `count` PINGs and returns the round-trip times.
pub async fn run_ping(config: AgentConfig, count: u32) -> Result<Vec<Duration>> {
    let client = AgentClient::new(config);
    let session_id = client
        .connect()
        .await
        .with_context(|| format!("failed to connect to {}", client.config().server_addr))?;
    tracing::info!(session_id = %session_id, "Connected");

    let mut rtts = Vec::with_capacity(count as usize);
    for seq in 0..count {
        let rtt = client.ping().await.with_context(|| format!("PING {} failed", seq))?;
        println!("PING {}: session={} time={:.3}ms", seq, session_id, rtt.as_secs_f64() * 1000.0);
        rtts.push(rtt);
    }
    client.disconnect().await;
    Ok(rtts)
}

/// Parses a command-line value: JSON when it parses, a plain string otherwise.
pub fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

/// Ships one trace and returns how many traces the server has acknowledged.
pub async fn run_send(config: AgentConfig, name: &str, metric_type: MetricType, value: Value) -> Result<u64> {
    let metric = metric_name(&config.host, &config.agent_id, &[], name);
    let client = AgentClient::new(config);
    client
        .connect()
        .await
        .with_context(|| format!("failed to connect to {}", client.config().server_addr))?;

    client
        .submit_traces(vec![TraceEvent::new(metric.clone(), metric_type, value)])
        .await
        .context("failed to ship trace")?;
    // The TRACE ack travels ahead of this PING's response on the same channel.
    client.ping().await.context("server stopped answering after TRACE")?;

    let acknowledged = client.acknowledged_traces();
    println!("{} acknowledged={}", metric, acknowledged);
    client.disconnect().await;
    Ok(acknowledged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_value() {
        assert_eq!(parse_value("42"), json!(42));
        assert_eq!(parse_value("[1,2]"), json!([1, 2]));
        assert_eq!(parse_value("up"), json!("up"));
    }

    #[tokio::test]
    async fn test_ping_and_send_against_local_server() {
        let config = ServerConfig::default().with_bind_addr("127.0.0.1:0");
        let pipeline = ServerPipeline::bind(&config, Vec::new()).await.unwrap();
        let addr = pipeline.server.local_addr().unwrap().to_string();
        tokio::spawn(pipeline.serve_until(std::future::pending()));

        let agent = AgentConfig::default().with_server(addr).with_identity("cli-host", "cli-agent");
        assert_eq!(run_ping(agent.clone(), 2).await.unwrap().len(), 2);
        assert_eq!(run_send(agent, "load", MetricType::LongAvg, json!(3)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_ping_fails_without_server() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let agent = AgentConfig {
            connect_timeout: Duration::from_millis(200),
            ..AgentConfig::default()
        }
        .with_server(addr);
        assert!(run_ping(agent, 1).await.is_err());
    }
}
