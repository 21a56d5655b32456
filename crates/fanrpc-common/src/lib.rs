//! fanrpc Common Types
//!
//! Shared building blocks for the fanrpc client crates:
//!
//! - [`error`] - the error taxonomy used by every layer ([`FanrpcError`])
//! - [`status`] - RPC status codes reported by worker nodes ([`Code`])
//! - [`context`] - cancellation/deadline carrying execution context ([`Context`])
//!
//! # Example
//!
//! ```
//! use fanrpc_common::{Code, Context, FanrpcError};
//! use std::time::Duration;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let ctx = Context::background()
//!     .with_method("Search")
//!     .with_timeout(Duration::from_secs(1));
//! assert_eq!(ctx.method(), Some("Search"));
//!
//! let err = FanrpcError::status(Code::Unavailable, "node restarting").at_addr("10.0.0.7:8081");
//! assert_eq!(err.code(), Some(Code::Unavailable));
//! # }
//! ```

pub mod context;
pub mod error;
pub mod status;

pub use context::Context;
pub use error::{FanrpcError, Result};
pub use status::Code;
