pub mod error;
pub mod loader;
pub mod model;
pub mod raw;

pub use error::{ConfigError, ConfigResult};
pub use loader::{load_from_path, load_from_str, Loaded};
pub use model::{
    Config, GlobalConfig, ProgramName, ProgramSpec, RestartPolicy, StopSignal,
};
