use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;

/// Where the PostgreSQL binaries come from.
///
/// Resolution order: `bin_dir`, then `PG_BIN`, then `pg_config --bindir`
/// (`PG_CONFIG` or `pg_config` on `PATH`), then plain `PATH` lookup.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ToolsConfig {
    #[serde(default)]
    pub bin_dir: Option<PathBuf>,

    /// Ask `pg_config` once per harness instead of on every lookup
    #[serde(default = "default_true")]
    pub cache_pg_config: bool,

    /// Run `initdb` once and copy the result for every further node
    /// initialized without custom `initdb` parameters
    #[serde(default)]
    pub cache_initdb: bool,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            bin_dir: None,
            cache_pg_config: true,
            cache_initdb: false,
        }
    }
}

fn default_true() -> bool {
    true
}
