/*
[INPUT]:  Endpoint connections and outbound subscription requests
[OUTPUT]: Decoded inbound payloads routed to jobs and handlers
[POS]:    WebSocket layer - transport, multiplexing client, frame codec
[UPDATE]: When adding transports or changing dispatch semantics
*/

pub mod client;
pub mod conn;
pub mod job;
pub mod memory;
pub mod message;

pub use client::{WsClient, WsHandler};
pub use conn::{FrameWriter, TungsteniteConn, TungsteniteConnector, WsConn, WsConnector};
pub use job::{JobHandler, WsJob};
pub use memory::{MemoryConn, MemoryConnector, MemoryPeer};
pub use message::{WsMsg, check_error, decode_frame};
