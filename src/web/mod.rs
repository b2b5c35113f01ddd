pub mod api;
pub mod server;
pub mod websocket;

pub use server::{generate_token, start_web_server, WebState};
