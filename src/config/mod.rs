mod server;
mod settings;

pub use server::ServerConfig;
pub use settings::{SettingKey, SettingKind, Settings, parse_duration};
