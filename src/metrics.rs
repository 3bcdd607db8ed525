//! Prometheus metrics registry and instruments.
//!
//! This module is framework-agnostic and can be used from any layer.

use lazy_static::lazy_static;
use prometheus::{HistogramOpts, IntCounter, IntCounterVec, Opts, Registry};

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // Dereferencing
    pub static ref DEREFERENCE_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("rustfed_dereference_total", "Total number of dereference attempts"),
        &["kind", "outcome"]
    ).expect("metric can be created");
    pub static ref DEREFERENCE_JOINED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "rustfed_dereference_joined_total",
            "Callers that joined an already in-flight fetch instead of starting one"
        ),
        &["kind"]
    ).expect("metric can be created");
    pub static ref FEDERATION_REQUEST_DURATION_SECONDS: prometheus::HistogramVec = prometheus::HistogramVec::new(
        HistogramOpts::new(
            "rustfed_federation_request_duration_seconds",
            "Federation request duration in seconds"
        ).buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        &["direction"]
    ).expect("metric can be created");

    // Domain blocks
    pub static ref DOMAIN_BLOCK_CACHE_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("rustfed_domain_block_cache_total", "Domain block cache lookups"),
        &["result"]
    ).expect("metric can be created");
    pub static ref DOMAIN_BLOCK_CACHE_CLEARS: IntCounter = IntCounter::new(
        "rustfed_domain_block_cache_clears_total",
        "Number of times the domain block cache was invalidated"
    ).expect("metric can be created");

    // Inbound activities and side effects
    pub static ref ACTIVITIES_RECEIVED: IntCounterVec = IntCounterVec::new(
        Opts::new("rustfed_activities_received_total", "Total number of inbound activities"),
        &["activity_type"]
    ).expect("metric can be created");
    pub static ref SIDE_EFFECTS_PUBLISHED: IntCounterVec = IntCounterVec::new(
        Opts::new("rustfed_side_effects_published_total", "Federation side effects handed downstream"),
        &["activity_type", "object_type"]
    ).expect("metric can be created");

    // Errors
    pub static ref ERRORS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("rustfed_errors_total", "Total number of errors rendered at the HTTP boundary"),
        &["error_type"]
    ).expect("metric can be created");
}

/// Initialize metrics registry.
pub fn init_metrics() {
    REGISTRY
        .register(Box::new(DEREFERENCE_TOTAL.clone()))
        .expect("DEREFERENCE_TOTAL can be registered");
    REGISTRY
        .register(Box::new(DEREFERENCE_JOINED_TOTAL.clone()))
        .expect("DEREFERENCE_JOINED_TOTAL can be registered");
    REGISTRY
        .register(Box::new(FEDERATION_REQUEST_DURATION_SECONDS.clone()))
        .expect("FEDERATION_REQUEST_DURATION_SECONDS can be registered");
    REGISTRY
        .register(Box::new(DOMAIN_BLOCK_CACHE_TOTAL.clone()))
        .expect("DOMAIN_BLOCK_CACHE_TOTAL can be registered");
    REGISTRY
        .register(Box::new(DOMAIN_BLOCK_CACHE_CLEARS.clone()))
        .expect("DOMAIN_BLOCK_CACHE_CLEARS can be registered");
    REGISTRY
        .register(Box::new(ACTIVITIES_RECEIVED.clone()))
        .expect("ACTIVITIES_RECEIVED can be registered");
    REGISTRY
        .register(Box::new(SIDE_EFFECTS_PUBLISHED.clone()))
        .expect("SIDE_EFFECTS_PUBLISHED can be registered");
    REGISTRY
        .register(Box::new(ERRORS_TOTAL.clone()))
        .expect("ERRORS_TOTAL can be registered");

    tracing::info!("Metrics registry initialized");
}

/// Record the outcome of one dereference attempt.
pub fn observe_dereference(kind: &str, outcome: &str) {
    DEREFERENCE_TOTAL.with_label_values(&[kind, outcome]).inc();
}
