// Cross-crate tests: a real agent talking to a real server over loopback TCP.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracewire::agent::{AgentClient, AgentConfig, AgentTracer, ConnectionState};
use tracewire::common::TraceWireError;
use tracewire::server::{ServerConfig, ServerPipeline, SessionRegistry};
use tracewire::trace::{
    DeltaManager, Endpoint, LocalQueueEndpoint, MetricType, Phase, PhasePipeline, TraceEvent, TriggerBinding,
    WorkerPool,
};

// ============================================================================
// Test Helpers
// ============================================================================

struct Harness {
    addr: String,
    registry: Arc<SessionRegistry>,
    queue: Arc<LocalQueueEndpoint>,
    stop: Option<tokio::sync::oneshot::Sender<()>>,
    serving: tokio::task::JoinHandle<tracewire::common::Result<()>>,
}

impl Harness {
    async fn start(flush_size: usize) -> Self {
        let queue = Arc::new(LocalQueueEndpoint::new("local", 10_000));
        let config = ServerConfig {
            flush_size,
            flush_interval: Duration::from_secs(60),
            route: "it".to_string(),
            ..ServerConfig::default()
        }
        .with_bind_addr("127.0.0.1:0");
        let pipeline = ServerPipeline::bind(&config, vec![queue.clone() as Arc<dyn Endpoint>])
            .await
            .unwrap();
        let addr = pipeline.server.local_addr().unwrap().to_string();
        let registry = pipeline.server.invoker().registry().clone();

        let (stop, stopped) = tokio::sync::oneshot::channel::<()>();
        let serving = tokio::spawn(pipeline.serve_until(async {
            let _ = stopped.await;
        }));
        Harness {
            addr,
            registry,
            queue,
            stop: Some(stop),
            serving,
        }
    }

    fn agent_config(&self, host: &str) -> AgentConfig {
        AgentConfig {
            operation_timeout: Duration::from_secs(2),
            sweep_interval: Duration::from_millis(50),
            ..AgentConfig::default()
        }
        .with_server(self.addr.clone())
        .with_identity(host, "agentX")
    }

    /// Stops accepting and drains the pipeline into the endpoint.
    async fn shutdown(mut self) -> Arc<LocalQueueEndpoint> {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        (&mut self.serving).await.unwrap().unwrap();
        self.queue.clone()
    }
}

async fn eventually<F: Fn() -> bool>(check: F) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_connect_binds_session_on_both_ends() {
    let harness = Harness::start(100).await;
    let client = AgentClient::new(harness.agent_config("hostA"));

    let session_id = client.connect().await.unwrap();
    assert_eq!(session_id, "it:1");
    assert_eq!(
        client.state(),
        ConnectionState::Connected {
            session_id: session_id.clone()
        }
    );

    let sessions = harness.registry.sessions_snapshot();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].host, "hostA");
    assert_eq!(sessions[0].agent_id, "agentX");

    client.ping().await.unwrap();
}

#[tokio::test]
async fn test_traces_are_acknowledged_and_delivered() {
    let harness = Harness::start(5).await;
    let client = AgentClient::new(harness.agent_config("hostA"));
    client.connect().await.unwrap();

    let traces: Vec<TraceEvent> = (0..5)
        .map(|i| TraceEvent::new(format!("hostA/agentX:m{}", i), MetricType::LongAvg, json!(i)))
        .collect();
    client.submit_traces(traces).await.unwrap();
    client.ping().await.unwrap();

    assert_eq!(client.acknowledged_traces(), 5);
    eventually(|| harness.queue.len() == 5).await;
}

#[tokio::test]
async fn test_unknown_operation_fails_with_remote_error() {
    let harness = Harness::start(100).await;
    let client = AgentClient::new(harness.agent_config("hostA"));
    client.connect().await.unwrap();

    match client.invoke(1234, json!(null)).await {
        Err(TraceWireError::Remote(message)) => assert!(message.contains("1234")),
        other => panic!("expected a remote error, got {:?}", other),
    }
    assert_eq!(client.pending_count(), 0);

    // The channel stays usable.
    client.ping().await.unwrap();
}

#[tokio::test]
async fn test_agent_disconnect_releases_session() {
    let harness = Harness::start(100).await;
    let client = AgentClient::new(harness.agent_config("hostA"));
    client.connect().await.unwrap();
    let registry = harness.registry.clone();

    // Closing the agent side releases the session on the server.
    client.disconnect().await;
    eventually(|| registry.is_empty()).await;
    assert!(matches!(client.ping().await, Err(TraceWireError::NotConnected)));

    harness.shutdown().await;
}

#[tokio::test]
async fn test_tracer_deltas_flow_to_endpoint() {
    let harness = Harness::start(1000).await;
    let client = Arc::new(AgentClient::new(harness.agent_config("web-1")));
    client.connect().await.unwrap();
    let tracer = AgentTracer::new(client.clone(), DeltaManager::default());

    for (i, raw) in [100, 150, 175].into_iter().enumerate() {
        let traced = tracer
            .trace(&["cpu"], "ticks", MetricType::DeltaLongAvg, json!(raw))
            .await
            .unwrap();
        assert_eq!(traced, i > 0);
        // Distinct timestamps so the batch keeps both deltas.
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    tracer.trace(&[], "status", MetricType::String, json!("up")).await.unwrap();
    assert_eq!(tracer.flush().await.unwrap(), 3);
    client.ping().await.unwrap();
    assert_eq!(client.acknowledged_traces(), 3);

    let queue = harness.shutdown().await;
    let mut delivered = queue.drain();
    delivered.sort_by_key(|t| (t.metric.clone(), t.timestamp));
    let values: Vec<_> = delivered.iter().map(|t| (t.metric.as_str(), t.value.clone())).collect();
    assert_eq!(
        values,
        vec![
            ("web-1/agentX/cpu:ticks", json!(50)),
            ("web-1/agentX/cpu:ticks", json!(25)),
            ("web-1/agentX:status", json!("up")),
        ]
    );
}

#[tokio::test]
async fn test_phase_triggers_fire_for_shipped_traces() {
    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let recorder = {
        let seen = seen.clone();
        Arc::new(move |phase: Phase, trace: &TraceEvent| {
            seen.lock().unwrap().push((phase, trace.metric.clone()));
        })
    };
    let mut phases = PhasePipeline::new(Arc::new(WorkerPool::default()));
    phases
        .register(TriggerBinding::new(recorder).named("recorder").phases(&Phase::ALL))
        .unwrap();

    let queue = Arc::new(LocalQueueEndpoint::new("local", 100));
    let config = ServerConfig {
        flush_size: 1,
        ..ServerConfig::default()
    }
    .with_bind_addr("127.0.0.1:0");
    let pipeline = ServerPipeline::bind_with_phases(
        &config,
        vec![queue.clone() as Arc<dyn Endpoint>],
        Some(Arc::new(phases)),
    )
    .await
    .unwrap();
    let addr = pipeline.server.local_addr().unwrap().to_string();
    tokio::spawn(pipeline.serve_until(std::future::pending()));

    let client = AgentClient::new(AgentConfig::default().with_server(addr).with_identity("h", "a"));
    client.connect().await.unwrap();
    client
        .submit_traces(vec![TraceEvent::new("h/a:load", MetricType::LongAvg, json!(1))])
        .await
        .unwrap();

    eventually(|| seen.lock().unwrap().iter().any(|(phase, _)| *phase == Phase::Endpoint)).await;
    let fired: Vec<Phase> = seen.lock().unwrap().iter().map(|(phase, _)| *phase).collect();
    assert_eq!(fired, Phase::ALL.to_vec());
    assert_eq!(queue.len(), 1);
}

#[tokio::test]
async fn test_many_agents_get_distinct_sessions() {
    let harness = Harness::start(100).await;
    let clients: Vec<AgentClient> = (0..4)
        .map(|i| AgentClient::new(harness.agent_config(&format!("host{}", i))))
        .collect();
    let mut sessions: Vec<String> = futures::future::join_all(clients.iter().map(|c| c.connect()))
        .await
        .into_iter()
        .collect::<Result<_, _>>()
        .unwrap();
    sessions.sort();
    sessions.dedup();
    assert_eq!(sessions.len(), 4);
    assert_eq!(harness.registry.len(), 4);

    for client in &clients {
        client.ping().await.unwrap();
    }
}
