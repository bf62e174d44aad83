mod defaults;
mod merge;
mod resolve;
mod types;
mod util;

pub use self::resolve::{
    CONFIG_ENV_VAR, ConfigSource, default_config_search_paths, load_config,
    minimal_config_template, resolve_config_path,
};
pub use self::types::*;
pub use self::util::{expand_tilde, label_from_path, slugify};
