//! # iqbridge-server
//!
//! TCP remote server for SDR devices. A client opens a control connection,
//! names a driver and its arguments, and gets a device it can query and
//! configure over a line-oriented text RPC. Sample data flows over
//! separate per-stream data connections as interleaved IQ frames.
//!
//! Structure, leaves first:
//!
//! - [`rpc`]: newline-framed text codec with a sticky error latch
//! - [`protocol`]: connection-kind digits and the RPC code table
//! - [`connection`]: fd-keyed table of live connections
//! - [`handlers`]: one handler per RPC operation
//! - [`pump`]: per-stream worker bridging device buffers and the wire
//! - [`server`]: the poll-driven accept/dispatch loop

pub mod connection;
pub mod handlers;
pub mod protocol;
pub mod pump;
pub mod rpc;
pub mod server;

pub use protocol::{RpcCall, UNKNOWN_CALL};
pub use rpc::RpcCodec;
pub use server::{Server, ServerError};
