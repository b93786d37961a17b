//! Configuration for the hearth companion: servers, actions, dispatch and
//! probe tuning. Discovery, env substitution and atomic updates live in
//! `loader`.

pub mod env_subst;
pub mod loader;
pub mod schema;

pub use {
    loader::{
        clear_config_dir, config_dir, discover_and_load, find_or_default_config_path,
        load_config, save_config, set_config_dir, update_config,
    },
    schema::{
        ActionEntry, DispatchConfig, HearthConfig, ProbeConfig, ServerEntry,
        serialize_option_secret,
    },
};
