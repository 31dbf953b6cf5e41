mod admin;
pub mod dto;
mod node;
pub mod response;
mod router;

pub use router::{AppState, create_router};
