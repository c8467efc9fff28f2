//! Session state: the actor owning the controller slot, viewer set,
//! history buffer, and the bridge to the remote terminal.

pub mod bridge;
pub mod history;
pub mod manager;

pub use bridge::SshTarget;
pub use manager::{ConnId, SessionHandle};
