//! Cache subsystem: identity derivation, on-disk layout, the per-project
//! settings file, the per-project branch metadata catalogue, and the
//! eviction policy that prunes it (spec.md §3-§4.6).

pub mod eviction;
pub mod identity;
pub mod layout;
pub mod metadata;
pub mod settings;
