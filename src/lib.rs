// TuBondi widget backend: session-aware client for the legacy PHP transit
// backend, per-widget configuration and render-state stores, the scheduled
// refresh pipeline and the near-arrival notification deduplicator.

pub mod arrival_notifier;
pub mod refresh_pipeline;
pub mod tubondi_api_models;
pub mod widget_store;
