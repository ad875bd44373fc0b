//! The artifact cache: a local JSON-backed tier, and a best-effort remote
//! push tier layered on top of it (`spec.md` §5.B, §5.C).

pub mod local;
pub mod remote;

pub use local::LocalCache;
pub use remote::RemoteCache;
