//! LSP base protocol: `Content-Length` framing and JSON-RPC 2.0 messages.
//!
//! Messages travel over stdio as
//! ```text
//! Content-Length: <length>\r\n
//! \r\n
//! <payload>
//! ```
//! where any further headers (such as `Content-Type`) are accepted and
//! ignored.

mod framing;
mod jsonrpc;

pub use framing::{FrameDecoder, FrameError, encode_frame};
pub use jsonrpc::{
    CONTENT_MODIFIED, INTERNAL_ERROR, INVALID_PARAMS, INVALID_REQUEST, JSONRPC_VERSION,
    JsonRpcError, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
    METHOD_NOT_FOUND, MessageError, PARSE_ERROR, REQUEST_CANCELLED, RequestId,
    SERVER_NOT_INITIALIZED,
};
