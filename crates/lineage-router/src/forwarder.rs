// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use async_trait::async_trait;
use opentelemetry_proto::tonic::collector::trace::v1::{
    trace_service_client::TraceServiceClient, ExportTraceServiceRequest,
    ExportTraceServiceResponse,
};
use tonic::codec::CompressionEncoding;
use tonic::transport::{Channel, Endpoint};
use tonic::{Response, Status};
use tracing::debug;

use crate::config::Config;
use crate::error::RouterError;

#[async_trait]
pub trait TraceForwarder {
    /// Sends a rewritten batch downstream. A failure is returned as-is so the
    /// caller can hand it back to the exporter that sent the batch.
    async fn forward(
        &self,
        request: ExportTraceServiceRequest,
    ) -> Result<ExportTraceServiceResponse, Status>;
}

#[derive(Clone)]
#[allow(clippy::module_name_repetitions)]
pub struct GrpcTraceForwarder {
    client: TraceServiceClient<Channel>,
}

impl GrpcTraceForwarder {
    /// Builds a client for `config.forward_endpoint`. The connection is made on
    /// first use, so an unreachable collector does not block startup.
    pub fn new(config: &Config) -> Result<Self, RouterError> {
        let endpoint = Endpoint::from_shared(config.forward_endpoint.clone())
            .map_err(|err| RouterError::ForwardEndpoint {
                endpoint: config.forward_endpoint.clone(),
                reason: err.to_string(),
            })?
            .timeout(Duration::from_secs(config.forward_timeout_secs));

        let mut client = TraceServiceClient::new(endpoint.connect_lazy());
        if config.forward_gzip {
            client = client.send_compressed(CompressionEncoding::Gzip);
        }
        debug!("Forwarding traces to {}", config.forward_endpoint);
        Ok(GrpcTraceForwarder { client })
    }
}

#[async_trait]
impl TraceForwarder for GrpcTraceForwarder {
    async fn forward(
        &self,
        request: ExportTraceServiceRequest,
    ) -> Result<ExportTraceServiceResponse, Status> {
        let mut client = self.client.clone();
        client.export(request).await.map(Response::into_inner)
    }
}
