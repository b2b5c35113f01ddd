//! Client side: HTTP admin calls, the event feed printer and the
//! reconnecting terminal attach.

pub mod api;
pub mod backoff;
pub mod controller;
pub mod driver;
pub mod feed;
pub mod renderer;

pub use api::ApiClient;
pub use driver::Driver;
