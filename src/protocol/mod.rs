//! Engine protocol: framing, the correlated client and document sync.

pub mod client;
pub mod documents;
pub mod framing;
pub mod lsp;

pub use client::{ChannelState, ClientOptions, IndexingStatus, ProtocolClient};
pub use documents::DocumentTracker;
