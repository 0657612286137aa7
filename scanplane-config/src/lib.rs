//! Configuration loading for scanplane controllers.
//!
//! [`SettingsLoader`] resolves a [`ControlPlaneSettings`] from, in order: an
//! explicit file, `$SCANPLANE_CONFIG_PATH`, `$SCANPLANE_CONFIG_JSON`, a
//! `scanplane.toml` next to the working directory, and built-in defaults.
//! Individual environment variables (also read from `.env`) override the
//! result.
#![allow(missing_docs)]

mod loader;
mod settings;

pub use loader::{
    SettingsLoad, SettingsLoader, SettingsSource, env_keys, load_from_file, parse_from_str,
};
pub use settings::ControlPlaneSettings;
