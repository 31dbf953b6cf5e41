mod heartbeat;
mod models;
mod states;

pub use heartbeat::*;
pub use models::*;
pub use states::*;
