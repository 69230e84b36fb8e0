//! # sshwire platform
//!
//! Core types shared by the sshwire crates.
//!
//! This crate provides:
//! - The error taxonomy (`SshError`, `SshResult`) with stable numeric codes
//! - The transport boundary (`SessionStream`) and the readiness hint
//!   (`BlockDirections`) used by non-blocking callers
//!
//! # Examples
//!
//! ```
//! use sshwire_platform::{SshError, SshResult};
//!
//! fn example_function() -> SshResult<String> {
//!     Ok("Hello, sshwire!".to_string())
//! }
//!
//! # fn main() -> SshResult<()> {
//! let result = example_function()?;
//! assert_eq!(result, "Hello, sshwire!");
//! assert_eq!(SshError::WouldBlock.code(), -37);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod error;
pub mod traits;

pub use error::{codes, SshError, SshResult};
pub use traits::{BlockDirections, SessionStream};

/// Platform version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
