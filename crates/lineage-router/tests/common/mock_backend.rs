// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Mock OTLP/gRPC collector that records every export it receives

use opentelemetry_proto::tonic::collector::trace::v1::{
    trace_service_server::{TraceService, TraceServiceServer},
    ExportTraceServiceRequest, ExportTraceServiceResponse,
};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::codec::CompressionEncoding;
use tonic::{transport::Server, Code, Request, Response, Status};

#[derive(Clone)]
struct RecordingService {
    received: Arc<Mutex<Vec<ExportTraceServiceRequest>>>,
    fail_with: Option<(Code, String)>,
}

#[tonic::async_trait]
impl TraceService for RecordingService {
    async fn export(
        &self,
        request: Request<ExportTraceServiceRequest>,
    ) -> Result<Response<ExportTraceServiceResponse>, Status> {
        self.received.lock().unwrap().push(request.into_inner());
        match &self.fail_with {
            Some((code, message)) => Err(Status::new(*code, message.clone())),
            None => Ok(Response::new(ExportTraceServiceResponse::default())),
        }
    }
}

pub struct MockBackend {
    pub addr: SocketAddr,
    pub received: Arc<Mutex<Vec<ExportTraceServiceRequest>>>,
}

impl MockBackend {
    /// Start a collector on a random port that accepts every export
    pub async fn start() -> Self {
        Self::start_with(None).await
    }

    /// Start a collector on a random port that rejects every export
    pub async fn start_failing(code: Code, message: &str) -> Self {
        Self::start_with(Some((code, message.to_string()))).await
    }

    async fn start_with(fail_with: Option<(Code, String)>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind mock backend");
        let addr = listener.local_addr().expect("Failed to get local addr");

        let received = Arc::new(Mutex::new(Vec::new()));
        let service = TraceServiceServer::new(RecordingService {
            received: received.clone(),
            fail_with,
        })
        .accept_compressed(CompressionEncoding::Gzip);

        tokio::spawn(async move {
            let _ = Server::builder()
                .add_service(service)
                .serve_with_incoming(TcpListenerStream::new(listener))
                .await;
        });

        MockBackend { addr, received }
    }

    pub fn exports(&self) -> Vec<ExportTraceServiceRequest> {
        self.received.lock().unwrap().clone()
    }
}
