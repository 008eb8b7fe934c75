//! Handshake/auth collaborator.
//!
//! Verifies credentials before admission; the engine core trusts the
//! identity produced here and never re-verifies it.

mod claims;
mod jwt;

pub use claims::Claims;
pub use jwt::JwtValidator;
