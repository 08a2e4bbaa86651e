//! Sample buffers
//!
//! - `shared`: memory-mapped ring shared with the audio service, addressed
//!   in whole spans by absolute frame number
//! - `cache`: process-local byte ring that regroups caller chunks into spans

pub mod cache;
pub mod shared;

pub use cache::RingCache;
pub use shared::{BufferGeometry, HandleInfo, SharedRingBuffer};
