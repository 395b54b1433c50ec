use std::sync::Arc;

use tracewire_common::protocol::error::{Result, TraceWireError};
use tracewire_trace::{BatchSubmissionContext, Endpoint, PhasePipeline, TraceAccumulator, WorkerPool, WorkerPoolConfig};

use crate::config::ServerConfig;
use crate::invoker::ServerInvoker;
use crate::server::TraceServer;
use crate::session::SessionRegistry;
use crate::sink::BatchingSink;

/// A bound server together with the sink feeding its batch pipeline.
pub struct ServerPipeline {
    pub server: TraceServer,
    pub sink: Arc<BatchingSink>,
}

impl ServerPipeline {
    /// Builds the batch pipeline for `endpoints` and binds the listener.
    ///
    /// Traces accepted from agents are accumulated and flushed every
    /// `config.flush_interval` or once `config.flush_size` are queued.
    pub async fn bind(config: &ServerConfig, endpoints: Vec<Arc<dyn Endpoint>>) -> Result<Self> {
        Self::bind_with_phases(config, endpoints, None).await
    }

    /// Like [`bind`](Self::bind), firing `phases` triggers as traces move
    /// through the pipeline.
    pub async fn bind_with_phases(
        config: &ServerConfig,
        endpoints: Vec<Arc<dyn Endpoint>>,
        phases: Option<Arc<PhasePipeline>>,
    ) -> Result<Self> {
        let executor = Arc::new(WorkerPool::new(WorkerPoolConfig::from_env()));
        let mut builder = endpoints
            .into_iter()
            .fold(BatchSubmissionContext::builder(), |builder, endpoint| builder.endpoint(endpoint))
            .executor(executor)
            .multithreaded(config.multithreaded);
        if let Some(phases) = phases {
            builder = builder.pipeline(phases);
        }
        let context = builder.build();

        let accumulator = Arc::new(TraceAccumulator::new(config.accumulator_config(), context));
        let sink = Arc::new(BatchingSink::with_timed_flush(accumulator)?);
        let registry = Arc::new(SessionRegistry::new(config.route.clone()));
        let invoker = Arc::new(ServerInvoker::new(registry, sink.clone()));
        let server = TraceServer::bind(&config.bind_addr, invoker)
            .await?
            .with_outbound_capacity(config.outbound_capacity);

        Ok(ServerPipeline { server, sink })
    }

    /// Serves until `shutdown` completes, then drains the pipeline. Returns
    /// once every accepted trace has been offered to the endpoints.
    pub async fn serve_until<F>(self, shutdown: F) -> Result<()>
    where
        F: std::future::Future<Output = ()>,
    {
        let served = self.server.run_until(shutdown).await;
        let sink = self.sink.clone();
        let flushed = tokio::task::spawn_blocking(move || sink.close())
            .await
            .map_err(|e| TraceWireError::Transport(format!("pipeline drain task failed: {}", e)))?
            .map_err(|e| TraceWireError::Transport(format!("final flush failed: {}", e)))?;
        tracing::info!(flushed, "Pipeline drained");
        served
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use tokio::net::TcpStream;
    use tracewire_common::{FramedTransport, OpCode, ProtocolInvocation, ProtocolMessage};
    use tracewire_trace::{LocalQueueEndpoint, MetricType, TraceEvent};

    #[tokio::test]
    async fn test_traces_reach_endpoint_after_shutdown_flush() {
        let queue = Arc::new(LocalQueueEndpoint::new("local", 100));
        let config = ServerConfig {
            flush_size: 1000,
            flush_interval: Duration::from_secs(60),
            ..ServerConfig::default()
        }
        .with_bind_addr("127.0.0.1:0");
        let pipeline = ServerPipeline::bind(&config, vec![queue.clone() as Arc<dyn Endpoint>]).await.unwrap();
        let addr = pipeline.server.local_addr().unwrap();

        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let serving = tokio::spawn(pipeline.serve_until(async {
            let _ = stop_rx.await;
        }));

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let traces: Vec<TraceEvent> = (0..3)
            .map(|i| TraceEvent::new(format!("h/a:m{}", i), MetricType::LongAvg, json!(i)))
            .collect();
        for invocation in [
            ProtocolInvocation::new(OpCode::Connect, json!(["h", "a"])),
            ProtocolInvocation::new(OpCode::Trace, serde_json::to_value(&traces).unwrap()),
        ] {
            FramedTransport::write_message(&mut stream, &ProtocolMessage::from(invocation)).await.unwrap();
            assert!(matches!(
                FramedTransport::read_message(&mut stream).await.unwrap(),
                Some(ProtocolMessage::Response(r)) if r.is_success()
            ));
        }

        stop_tx.send(()).unwrap();
        serving.await.unwrap().unwrap();
        assert_eq!(queue.len(), 3);
    }
}
