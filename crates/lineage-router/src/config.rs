// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::env;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;

use clap::Parser;

pub const DEFAULT_LISTEN_ADDR: &str = ":55680";
pub const DEFAULT_FORWARD_ADDR: &str = "localhost:4320";
pub const DEFAULT_RULES_DIR: &str = "rules/windows";
pub const DEFAULT_FORWARD_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_MAX_REQUEST_SIZE: usize = 10 * 1024 * 1024;

/// OTLP trace router that stitches process spans into per-lineage traces.
#[derive(Debug, Clone, Parser)]
#[command(name = "lineage-router", version, about)]
pub struct Args {
    /// Address the OTLP gRPC receiver listens on (`:port` binds all interfaces)
    #[arg(long, env = "LINEAGE_ROUTER_LISTEN", default_value = DEFAULT_LISTEN_ADDR)]
    pub listen: String,

    /// Downstream OTLP gRPC collector that receives rewritten batches
    #[arg(long, env = "LINEAGE_ROUTER_FORWARD", default_value = DEFAULT_FORWARD_ADDR)]
    pub forward: String,

    /// Directory of Sigma rules, searched recursively
    #[arg(long, env = "LINEAGE_ROUTER_RULES", default_value = DEFAULT_RULES_DIR)]
    pub rules: PathBuf,

    /// Enable debug logging
    #[arg(short, long, env = "LINEAGE_ROUTER_VERBOSE")]
    pub verbose: bool,

    /// Timeout for each forwarded export, in seconds
    #[arg(long, default_value_t = DEFAULT_FORWARD_TIMEOUT_SECS)]
    pub forward_timeout_secs: u64,

    /// Compress forwarded batches with gzip
    #[arg(long)]
    pub forward_gzip: bool,

    /// Maximum accepted export request size, in bytes
    #[arg(long, default_value_t = DEFAULT_MAX_REQUEST_SIZE)]
    pub max_request_size: usize,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    /// forward endpoint URI, always carrying a scheme
    pub forward_endpoint: String,
    pub rules_dir: PathBuf,
    pub log_level: String,
    /// timeout for each forwarded export, in seconds
    pub forward_timeout_secs: u64,
    pub forward_gzip: bool,
    pub max_request_content_length: usize,
}

impl Config {
    pub fn new(args: &Args) -> Result<Config, Box<dyn std::error::Error>> {
        let listen_addr = parse_listen_addr(&args.listen)?;

        let forward = args.forward.trim();
        if forward.is_empty() {
            return Err(anyhow::anyhow!("Forward address must not be empty").into());
        }
        let forward_endpoint = if forward.contains("://") {
            forward.to_string()
        } else {
            format!("http://{forward}")
        };

        if args.forward_timeout_secs == 0 {
            return Err(anyhow::anyhow!("Forward timeout must be at least one second").into());
        }
        if args.max_request_size == 0 {
            return Err(anyhow::anyhow!("Maximum request size must be greater than zero").into());
        }

        let log_level = if args.verbose {
            "debug".to_string()
        } else {
            env::var("LINEAGE_ROUTER_LOG_LEVEL")
                .map(|val| val.to_lowercase())
                .unwrap_or_else(|_| "info".to_string())
        };

        Ok(Config {
            listen_addr,
            forward_endpoint,
            rules_dir: args.rules.clone(),
            log_level,
            forward_timeout_secs: args.forward_timeout_secs,
            forward_gzip: args.forward_gzip,
            max_request_content_length: args.max_request_size,
        })
    }
}

/// Resolves a listen address, treating a bare `:port` as every interface.
fn parse_listen_addr(listen: &str) -> Result<SocketAddr, Box<dyn std::error::Error>> {
    let listen = listen.trim();
    let candidate = match listen.strip_prefix(':') {
        Some(port) => format!("0.0.0.0:{port}"),
        None => listen.to_string(),
    };
    candidate
        .to_socket_addrs()
        .map_err(|err| anyhow::anyhow!("Invalid listen address {listen:?}: {err}"))?
        .next()
        .ok_or_else(|| anyhow::anyhow!("Listen address {listen:?} did not resolve").into())
}
