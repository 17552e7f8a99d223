//! Control-plane RPC surface and blob storage for the in-container I/O
//! manager. Keeps the transport concern (retries, status mapping, wire
//! DTOs) out of `icm-runtime`, which only ever sees the `RpcClient` and
//! `BlobStore` traits.

pub mod blob;
pub mod client;
pub mod error;
pub mod fake;
pub mod model;

pub use blob::{BlobStore, HttpBlobStore};
pub use client::{HttpRpcClient, RetryConfig, RpcClient};
pub use error::RpcError;
