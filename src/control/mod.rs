//! Control layer exposing live sources to external tooling.

/// High-level control API over live sources.
pub mod api;
/// Ratatui-based developer console.
pub mod ui;
