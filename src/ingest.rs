mod coordinator;

#[cfg(test)]
mod tests;

pub use coordinator::{reading_point, AlertDecision, AlertRule, IngestOutcome, IngestionCoordinator};
