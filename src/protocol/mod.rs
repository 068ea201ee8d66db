//! Device API wire protocol
//!
//! Topic layout, topic filter matching and the RPC request/response envelopes.

pub mod messages;
pub mod topics;

pub use messages::{MalformedRequestError, RpcRequest, RpcResponse, RpcStatus};
pub use topics::{
    extract_request_id, rpc_response_topic, topic_matches, TopicFormatError,
    RPC_REQUEST_FILTER, RPC_REQUEST_PREFIX, RPC_RESPONSE_PREFIX, TELEMETRY_TOPIC,
};
