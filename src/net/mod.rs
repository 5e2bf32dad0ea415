pub mod backoff;
pub mod heartbeat;
pub mod manager;
pub mod memory;
pub mod registry;
pub mod scheduler;
pub mod transport;
pub mod ws;

pub use manager::{ConnectionEvent, ConnectionManager, ConnectionState};
pub use registry::ConnectionRegistry;
pub use transport::{CloseInfo, Frame, Transport, TransportLink};
pub use ws::WsTransport;
