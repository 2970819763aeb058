pub mod engine;
pub mod estimator;
pub mod pipeline;
pub mod retry;
pub mod scheduler;
pub mod window;

pub use engine::{CompensationEngine, CompensationOutcome, SweepReport};
pub use retry::RetryPolicy;
pub use scheduler::SweepScheduler;
