// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::net::SocketAddr;

#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("Failed to bind listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid forward endpoint {endpoint}: {reason}")]
    ForwardEndpoint { endpoint: String, reason: String },

    #[error("gRPC transport error: {0}")]
    Transport(#[from] tonic::transport::Error),
}
