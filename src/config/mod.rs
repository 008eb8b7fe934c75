mod settings;

pub use settings::{EmptyRoomPolicy, EngineConfig, JwtConfig, ServerConfig, Settings};
