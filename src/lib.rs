#![doc = include_str!("../README.md")]
#![forbid(unsafe_code)]

mod call;
mod client;
mod codec;
mod descriptor;
mod error;
mod hash;
mod packet;
mod queue;
mod registry;

pub use call::*;
pub use client::*;
pub use codec::*;
pub use descriptor::*;
pub use error::*;
pub use hash::hash;
pub use packet::*;
pub use queue::*;
pub use registry::*;

// Re-export stream utilities for consumers of streaming calls.
pub use futures_util::StreamExt;
