//! Service identity, assertion signing, scopes, and bearer token models.

pub mod assertion;
pub mod id;
pub mod identity;
pub mod scope;
pub mod token;

pub use assertion::*;
pub use id::*;
pub use identity::*;
pub use scope::*;
pub use token::{cached::*, secret::*};
