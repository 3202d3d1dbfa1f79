/*
[INPUT]:  Crate modules and public type definitions
[OUTPUT]: Public exgate stream-core surface
[POS]:    Crate root - module wiring
[UPDATE]: When public modules or exports change
*/

pub mod config;
pub mod error;
pub mod exchange;
pub mod registry;
pub mod ws;

pub use config::{DEFAULT_HANDSHAKE_TIMEOUT, DEFAULT_SEND_CAPACITY, WsConfig, default_chan_caps};
pub use error::{ExgateError, Result};
pub use exchange::WsExchange;
pub use registry::{ChanRegistry, OutChan, chan_key};

// Re-export commonly used types from ws
pub use ws::{
    FrameWriter,
    JobHandler,
    MemoryConn,
    MemoryConnector,
    MemoryPeer,
    TungsteniteConnector,
    WsClient,
    WsConn,
    WsConnector,
    WsHandler,
    WsJob,
    WsMsg,
};
