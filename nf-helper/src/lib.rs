//! Building blocks shared by the nanoFramework flashers.
//!
//! - [`partition_map`]: absolute flash address to image mapping.
//! - [`retry`]: bounded polling and retry combinators for device protocols.
//! - [`lock`]: advisory per-device lock so two sessions never interleave commands.
//! - [`console`]: decoders for connect-retry patterns and control-character progress output.
//! - [`resolvable`]: lazily resolved firmware images (`resolvable` feature).

pub mod console;
pub mod lock;
pub mod partition_map;
#[cfg(feature = "resolvable")]
pub mod resolvable;
pub mod retry;

pub use partition_map::{PartitionImage, PartitionMap};
