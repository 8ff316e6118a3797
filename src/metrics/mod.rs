pub mod collector;
pub mod exporter;

pub use collector::ShaperMetrics;
pub use exporter::serve;
