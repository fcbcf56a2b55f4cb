//! HAProxy Dataplane API integration: client, transactions, and the
//! reconciler that applies discovered state.

pub mod dataplane;
pub mod mock;
pub mod reconciler;
pub mod slot_allocator;
pub mod transaction;
