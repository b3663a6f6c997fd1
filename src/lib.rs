//! Sandboxed capability execution core.
//!
//! Agent-requested actions arrive as [`capability::CapabilityRequest`]s,
//! are routed by a [`capability::Registry`] to the named capability,
//! checked against its declared schema and the security policy, and run
//! either in-process or inside a [`sandbox::Sandbox`] created by a
//! [`sandbox::Runtime`].

pub mod capability;
pub mod config;
pub mod policy;
pub mod sandbox;

#[cfg(test)]
pub mod testutil;
