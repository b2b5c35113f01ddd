pub mod paths;
pub mod settings;

pub use paths::ensure_dirs;
pub use settings::{ClientConfig, Settings, TerminalConfig, TmuxConfig};
