//! Realtime conversation protocol: wire messages, response tracking,
//! transport and the engine tying them together.

pub mod engine;
pub mod protocol;
pub mod session;
pub mod transport;

pub use engine::{ConnectionState, EngineEvent, ProtocolEngine};
pub use protocol::{ClientEvent, InboundMessage, MessageAssembler, WireFrame};
pub use session::ResponseSession;
pub use transport::{Connector, MockConnector, TungsteniteConnector, WireReceiver, WireSender};
