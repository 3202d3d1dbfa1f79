/*
[INPUT]:  Public API exports for exgate-tap crate
[OUTPUT]: Module declarations and public re-exports
[POS]:    Crate root - library entry point
[UPDATE]: When adding new modules or public exports
*/

pub mod config;
pub mod tap;

// Re-export main types for convenience
pub use config::{StreamConfig, SubscriptionConfig, TapConfig};
pub use tap::{Feed, Tap, TopicRouter, format_line, pump_lines, spawn_printer};
