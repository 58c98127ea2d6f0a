#[cfg(feature = "cli")]
pub mod cli;
pub mod remote;
pub mod script_config;

#[cfg(feature = "cli")]
pub use cli::CliConfig;
pub use remote::RemoteSettings;
pub use script_config::ScriptConfig;
