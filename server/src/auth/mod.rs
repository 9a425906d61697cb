//! Authentication
//!
//! Bearer JWT validation for the publish API and the socket gateway. Tokens
//! are issued elsewhere; this service only verifies them and extracts the
//! tenant and user they speak for.

mod error;
pub mod jwt;
mod middleware;

pub use error::{AuthError, AuthResult};
pub use jwt::{issue_access_token, validate_access_token, Claims};
pub use middleware::{bearer_token, require_auth, AuthUser};
