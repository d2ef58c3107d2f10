// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Test-only helpers, mirroring the teacher crate's `testing.rs`.

/// Initializes a `tracing` subscriber exactly once per test process.
pub fn init_tracing() {
    use std::sync::Once;

    static TRACING: Once = Once::new();

    TRACING.call_once(|| {
        let format = tracing_subscriber::fmt::format().compact();

        let env_filter = tracing_subscriber::EnvFilter::builder()
            .with_default_directive(tracing::Level::DEBUG.into())
            .with_env_var("SOCKBUF_LOG")
            .from_env()
            .unwrap();

        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .event_format(format)
            .with_test_writer()
            .init();
    });
}
