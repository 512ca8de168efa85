// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Helper functions for integration tests

use clap::Parser;
use lineage_router::{
    config::{Args, Config},
    detection::DetectionGate,
    forwarder::GrpcTraceForwarder,
    id_generator::IdGenerator,
    lineage::LineageTable,
    router::TraceRouter,
    sigma::Ruleset,
    span_rewriter::SpanRewriter,
};
use opentelemetry_proto::tonic::collector::trace::v1::{
    trace_service_client::TraceServiceClient, ExportTraceServiceRequest,
};
use opentelemetry_proto::tonic::common::v1::{any_value, AnyValue, KeyValue};
use opentelemetry_proto::tonic::trace::v1::{ResourceSpans, ScopeSpans, Span};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tonic::transport::{Channel, Endpoint};

pub fn str_attr(key: &str, value: &str) -> KeyValue {
    KeyValue {
        key: key.to_string(),
        value: Some(AnyValue {
            value: Some(any_value::Value::StringValue(value.to_string())),
        }),
    }
}

pub fn int_attr(key: &str, value: i64) -> KeyValue {
    KeyValue {
        key: key.to_string(),
        value: Some(AnyValue {
            value: Some(any_value::Value::IntValue(value)),
        }),
    }
}

pub fn span(name: &str, attributes: Vec<KeyValue>) -> Span {
    Span {
        name: name.to_string(),
        attributes,
        ..Default::default()
    }
}

/// Wrap spans in a single resource and scope
pub fn export_request(spans: Vec<Span>) -> ExportTraceServiceRequest {
    ExportTraceServiceRequest {
        resource_spans: vec![ResourceSpans {
            scope_spans: vec![ScopeSpans {
                spans,
                ..Default::default()
            }],
            ..Default::default()
        }],
    }
}

pub fn spans_of(request: &ExportTraceServiceRequest) -> Vec<Span> {
    request
        .resource_spans
        .iter()
        .flat_map(|rs| rs.scope_spans.iter())
        .flat_map(|ss| ss.spans.iter().cloned())
        .collect()
}

pub struct RunningRouter {
    pub addr: SocketAddr,
    pub table: Arc<LineageTable>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl RunningRouter {
    pub async fn client(&self) -> TraceServiceClient<Channel> {
        let channel = Endpoint::from_shared(format!("http://{}", self.addr))
            .expect("Invalid router address")
            .connect()
            .await
            .expect("Failed to connect to router");
        TraceServiceClient::new(channel)
    }
}

impl Drop for RunningRouter {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

/// Start a router on a random port forwarding to `forward`, with rules from `rules_dir`
pub async fn start_router(forward: SocketAddr, rules_dir: &Path) -> RunningRouter {
    let forward = forward.to_string();
    let args = Args::try_parse_from([
        "lineage-router",
        "--listen",
        "127.0.0.1:0",
        "--forward",
        forward.as_str(),
        "--forward-timeout-secs",
        "2",
    ])
    .expect("Failed to parse test args");
    let config = Config::new(&args).expect("Failed to create test config");

    let ruleset = Ruleset::load_dir(rules_dir).expect("Failed to load test rules");
    let table = Arc::new(LineageTable::new());
    let rewriter = SpanRewriter::new(table.clone(), Arc::new(IdGenerator::new()));
    let forwarder = GrpcTraceForwarder::new(&config).expect("Failed to create forwarder");
    let router = TraceRouter::new(
        rewriter,
        DetectionGate::new(Arc::new(ruleset)),
        Arc::new(forwarder),
    );

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .expect("Failed to bind router");
    let addr = listener.local_addr().expect("Failed to get local addr");

    let (tx, rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        let _ = router
            .serve(listener, async {
                let _ = rx.await;
            })
            .await;
    });

    RunningRouter {
        addr,
        table,
        shutdown: Some(tx),
    }
}

/// Address with nothing listening on it
pub async fn unused_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind");
    listener.local_addr().expect("Failed to get local addr")
}
