pub mod captions;
pub mod cli;
pub mod config;
pub mod error;
pub mod media;
pub mod profile;
pub mod protocol;
pub mod room;
pub mod session;
pub mod signaling;
pub mod telemetry;
pub mod transport;

pub use config::CallConfig;
pub use error::{CallError, CallNotice, ErrorCategory};
pub use room::{ParticipantId, RoomToken};
pub use session::{CallHandle, CallStatus, CallWatch, NegotiationController};
