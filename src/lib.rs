//! Bridge between a host application and an instant-messaging SDK.
//!
//! The host drives sessions through `{method, args}` calls answered with
//! `{}`, `{"success": ...}` or `{"error": ...}`; SDK events come back as
//! `{method, args}` notifications. See [`bridge::Bridge`] for the entry point,
//! [`host::stdio`] for the JSON-lines transport and [`sdk::MemorySdk`] for the
//! in-process backend.

pub mod bridge;
pub mod codec;
pub mod host;
pub mod sdk;

pub use bridge::{Bridge, BridgeConfig, BridgeError, Call, EventRecord, MethodCall, Response};
pub use host::{CompletionContext, HostChannel, HostError, StdioHost};
pub use sdk::{ImClient, ImSdk, MemorySdk, SdkError};
