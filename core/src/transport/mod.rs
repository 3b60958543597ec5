// Transport module - per-connection data channels

pub mod abstraction;
pub mod memory;
pub mod webrtc;

pub use abstraction::{
    SignalSender, Transport, TransportEvent, TransportFactory, TransportKind, TransportOptions,
    WireChannel, WireSender,
};
pub use memory::{InMemoryTransport, MemoryTransportFactory, MemoryTransportRegistry};
pub use self::webrtc::{WebRtcTransport, WebRtcTransportFactory};
