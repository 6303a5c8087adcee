pub mod memory;
pub mod nats;
pub mod transport;

pub use memory::{HandshakeMode, MemoryTransport};
pub use nats::NatsTransport;
pub use transport::{ChannelFactory, ChannelSpec, ChannelStatus};
