// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! OTLP trace receiver.
//!
//! Every span of an export call is rewritten and then inspected, in request
//! order, before the whole batch is forwarded downstream in a single call.

use std::future::Future;
use std::sync::Arc;

use opentelemetry_proto::tonic::collector::trace::v1::{
    trace_service_server::{TraceService, TraceServiceServer},
    ExportTraceServiceRequest, ExportTraceServiceResponse,
};
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::codec::CompressionEncoding;
use tonic::transport::Server;
use tonic::{Request, Response, Status};
use tracing::{debug, error, info};

use crate::config::DEFAULT_MAX_REQUEST_SIZE;
use crate::detection::DetectionGate;
use crate::error::RouterError;
use crate::forwarder::TraceForwarder;
use crate::span_rewriter::SpanRewriter;

/// Per-batch counters, logged once the batch has been processed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub spans: usize,
    /// spans that carried a process id and were attributed to a lineage
    pub rewritten: usize,
    pub unattributed: usize,
    pub alerts: usize,
}

pub struct TraceRouter {
    rewriter: SpanRewriter,
    gate: DetectionGate,
    forwarder: Arc<dyn TraceForwarder + Send + Sync>,
    max_request_size: usize,
}

impl TraceRouter {
    pub fn new(
        rewriter: SpanRewriter,
        gate: DetectionGate,
        forwarder: Arc<dyn TraceForwarder + Send + Sync>,
    ) -> Self {
        TraceRouter {
            rewriter,
            gate,
            forwarder,
            max_request_size: DEFAULT_MAX_REQUEST_SIZE,
        }
    }

    #[must_use]
    pub fn with_max_request_size(mut self, max_request_size: usize) -> Self {
        self.max_request_size = max_request_size;
        self
    }

    /// Rewrites and inspects every span of the request in place.
    pub fn process_request(&self, request: &mut ExportTraceServiceRequest) -> BatchSummary {
        let mut summary = BatchSummary::default();
        let spans = request
            .resource_spans
            .iter_mut()
            .flat_map(|rs| rs.scope_spans.iter_mut())
            .flat_map(|ss| ss.spans.iter_mut());

        for span in spans {
            summary.spans += 1;
            if self.rewriter.rewrite(span).is_some() {
                summary.rewritten += 1;
            } else {
                summary.unattributed += 1;
            }
            if self.gate.inspect(span).is_some() {
                summary.alerts += 1;
            }
        }
        summary
    }

    /// Serves OTLP/gRPC on `listener` until `shutdown` resolves.
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> Result<(), RouterError>
    where
        F: Future<Output = ()> + Send,
    {
        let max_request_size = self.max_request_size;
        if let Ok(addr) = listener.local_addr() {
            info!("Listening for OTLP traces on {addr}");
        }

        let service = TraceServiceServer::new(self)
            .accept_compressed(CompressionEncoding::Gzip)
            .max_decoding_message_size(max_request_size);

        Server::builder()
            .add_service(service)
            .serve_with_incoming_shutdown(TcpListenerStream::new(listener), shutdown)
            .await?;

        info!("OTLP receiver stopped");
        Ok(())
    }
}

#[tonic::async_trait]
impl TraceService for TraceRouter {
    async fn export(
        &self,
        request: Request<ExportTraceServiceRequest>,
    ) -> Result<Response<ExportTraceServiceResponse>, Status> {
        let mut request = request.into_inner();
        let summary = self.process_request(&mut request);
        debug!(
            "Processed batch spans={} rewritten={} unattributed={} alerts={}",
            summary.spans, summary.rewritten, summary.unattributed, summary.alerts
        );

        match self.forwarder.forward(request).await {
            Ok(response) => Ok(Response::new(response)),
            Err(status) => {
                error!("Error forwarding batch of {} spans: {status}", summary.spans);
                Err(status)
            }
        }
    }
}
