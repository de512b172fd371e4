//! mergeq data model — identifiers, request records, and the status machine.

pub mod request;
pub mod status;
pub mod types;
