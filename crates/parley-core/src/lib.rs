//! Parley core: signaling, negotiation and recovery for one-to-one WebRTC
//! sessions with an end-to-end encrypted text channel.
//!
//! Applications spawn a [`Session`] and drive it through its
//! [`SessionHandle`], listening for [`SessionEvent`]s.

pub mod call;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod negotiation;
pub mod protocol;
pub mod recovery;
pub mod relay;
pub mod session;
pub mod signaling;
pub mod telemetry;

pub use config::SessionConfig;
pub use context::{Role, SessionContext};
pub use error::SessionError;
pub use relay::{Cipher, ReceivedMessage};
pub use session::{ConnectionStatus, EndReason, Session, SessionEvent, SessionHandle};
