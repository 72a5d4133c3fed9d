pub mod signal;

pub use signal::{
    IceCandidate, ProtocolError, SdpKind, SessionDescription, SignalKind, SignalingMessage,
};
