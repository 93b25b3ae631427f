//! Push-server wire formats.
//!
//! Which format a connection speaks is negotiated from the server version
//! in the configuration:
//!
//! | Server version | Format | Module |
//! |----------------|--------|--------|
//! | `>= 5` | JSON-RPC 2.0 text frames | `jsonrpc` |
//! | `4` | Protobuf batch frames | `binary` |
//! | `< 4` | Delimited text units | `text` |
//!
//! All of them decode into [`PushMessage`].
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `message` | Decoded message model |
//! | `binary` | Protobuf request / response batches |
//! | `text` | Legacy delimited frames |
//! | `jsonrpc` | JSON-RPC request / response types |
//! | `wire` | Protobuf wire primitives |

// ============================================================================
// Submodules
// ============================================================================

/// Protobuf batch frames.
pub mod binary;

/// JSON-RPC message types.
pub mod jsonrpc;

/// Decoded message model.
pub mod message;

/// Legacy delimited text frames.
pub mod text;

mod wire;

// ============================================================================
// Re-exports
// ============================================================================

pub use binary::{
    IncomingMessage, OutgoingMessage, Receiver, Request, RequestBatch, Response, ResponseBatch,
    Sender,
};
pub use jsonrpc::{RpcError, RpcPacket, RpcRequest, RpcResponse};
pub use message::{EventBody, Extra, PushMessage, SenderInfo, SenderType};
