pub mod codec;
pub mod memory;
pub mod stream;
pub mod transport;

pub use codec::{CodecError, RpcCodec, DEFAULT_MAX_FRAME_SIZE};
pub use memory::MemoryTransport;
pub use stream::StreamTransport;
pub use transport::{Transport, TransportError};
