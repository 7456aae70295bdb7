//! Bearer token values and their cached form.

pub mod cached;
pub mod secret;
