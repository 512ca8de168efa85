// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Common test utilities and a mock OTLP backend for integration tests

pub mod helpers;
pub mod mock_backend;
