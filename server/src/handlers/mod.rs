//! Request handlers for document sync.

mod pull;
mod push;
mod websocket;

pub use pull::*;
pub use push::*;
pub use websocket::*;
