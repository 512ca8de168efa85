// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use lineage_router::{
    config::{Args, Config},
    detection::DetectionGate,
    error::RouterError,
    forwarder::GrpcTraceForwarder,
    id_generator::IdGenerator,
    lineage::LineageTable,
    router::TraceRouter,
    sigma::Ruleset,
    span_rewriter::SpanRewriter,
};

#[tokio::main]
pub async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match Config::new(&args) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error creating lineage router config: {e}");
            return ExitCode::FAILURE;
        }
    };

    let env_filter = format!("h2=off,hyper=off,tower=off,{}", config.log_level);

    let filter = match EnvFilter::try_new(env_filter) {
        Ok(filter) => filter,
        Err(e) => {
            eprintln!("Could not parse log level {:?}: {e}", config.log_level);
            return ExitCode::FAILURE;
        }
    };
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Setting default subscriber failed: {e}");
        return ExitCode::FAILURE;
    }

    debug!("Logging subsystem enabled");

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let ruleset = Ruleset::load_dir(&config.rules_dir).map_err(|e| {
        format!(
            "Error loading Sigma rules from {}: {e}",
            config.rules_dir.display()
        )
    })?;
    info!(
        "Loaded {} Sigma rules from {}",
        ruleset.len(),
        config.rules_dir.display()
    );
    if ruleset.failed() > 0 || ruleset.unsupported() > 0 {
        warn!(
            "Skipped {} invalid and {} unsupported Sigma rules",
            ruleset.failed(),
            ruleset.unsupported()
        );
    }

    let table = Arc::new(LineageTable::new());
    let rewriter = SpanRewriter::new(table, Arc::new(IdGenerator::new()));
    let gate = DetectionGate::new(Arc::new(ruleset));
    let forwarder = Arc::new(GrpcTraceForwarder::new(&config)?);
    let router = TraceRouter::new(rewriter, gate, forwarder)
        .with_max_request_size(config.max_request_content_length);

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .map_err(|source| RouterError::Bind {
            addr: config.listen_addr,
            source,
        })?;
    info!("Lineage router forwarding to {}", config.forward_endpoint);

    router
        .serve(listener, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Error waiting for shutdown signal: {e}");
                std::future::pending::<()>().await;
            }
            info!("Shutting down lineage router");
        })
        .await?;
    Ok(())
}
