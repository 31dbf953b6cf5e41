mod middleware;
mod token;

pub use middleware::{AuthError, RequireAdmin, RequireNode};
pub use token::{IssuedToken, TokenHasher, parse_token};
