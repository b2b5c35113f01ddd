pub mod executor;
pub mod sessions;
#[cfg(test)]
pub mod testing;

pub use executor::Executor;
pub use sessions::{SessionManager, SessionSummary};
