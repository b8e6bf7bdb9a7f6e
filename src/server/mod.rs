pub mod context;
pub mod handlers;
pub mod protocol;
pub mod tree_cache;
pub mod ws;

pub use context::{AppError, ServiceContext};
pub use protocol::{
    ClientMessage, Encoding, RequestEnvelope, ResponseEnvelope, ServerMessage, PROTOCOL_VERSION,
};
pub use tree_cache::{TreeCache, TreeEntry};
pub use ws::{router, run_server, serve};
