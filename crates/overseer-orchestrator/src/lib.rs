pub mod arbitrator;
pub mod decomposer;
pub mod delivery;
pub mod engine;
pub mod scheduler;

#[cfg(test)]
mod scenario_tests;

pub use arbitrator::Arbitrator;
pub use decomposer::{DecomposeBindings, PlanDecomposer};
pub use delivery::{DeliveryOutcome, DeliveryService};
pub use engine::{RunEngine, StartSpec};
pub use scheduler::{PlanOutcome, PlanScheduler};
