pub mod context;
pub mod event;
pub mod plan;
pub mod policy;
pub mod run;
pub mod session;

pub use context::*;
pub use event::*;
pub use plan::*;
pub use policy::*;
pub use run::*;
pub use session::*;

/// Generate a prefixed identifier, e.g. `run_5f1c...`.
pub fn prefixed_id(prefix: &str) -> String {
    format!("{}_{}", prefix, uuid::Uuid::new_v4())
}
