//! Manager configuration.

use std::path::PathBuf;

/// Plugins probed at startup when nothing else is configured, in discovery
/// order.
pub const DEFAULT_PLUGINS: &[&str] = &[
    "omptarget.rtl.amdgpu",
    "omptarget.rtl.cuda",
    "omptarget.rtl.x86_64",
];

/// Environment variable listing plugin names (comma separated).
pub const ENV_PLUGINS: &str = "OFFLOAD_PLUGINS";
/// Environment variable with extra plugin search directories.
pub const ENV_PLUGIN_PATH: &str = "OFFLOAD_PLUGIN_PATH";
/// Environment variable enabling locality-aware device ordering.
pub const ENV_NUMA_AFFINITY: &str = "OFFLOAD_NUMA_AFFINITY";

/// Configuration for a [`PluginManager`](crate::PluginManager).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerConfig {
    /// Plugin names in discovery order.
    pub plugins: Vec<String>,
    /// Extra directories searched before the loader defaults.
    pub search_paths: Vec<PathBuf>,
    /// Whether to order devices by NUMA distance.
    pub numa_affinity: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            plugins: DEFAULT_PLUGINS.iter().map(|s| s.to_string()).collect(),
            search_paths: Vec::new(),
            numa_affinity: false,
        }
    }
}

impl ManagerConfig {
    /// Configuration with no plugins, for statically registered backends.
    pub fn empty() -> Self {
        Self {
            plugins: Vec::new(),
            ..Default::default()
        }
    }

    /// Read the configuration from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var_os(key).and_then(|v| v.into_string().ok()))
    }

    /// Build a configuration from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(plugins) = lookup(ENV_PLUGINS) {
            config.plugins = plugins
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(paths) = lookup(ENV_PLUGIN_PATH) {
            config.search_paths = std::env::split_paths(&paths).collect();
        }
        if let Some(flag) = lookup(ENV_NUMA_AFFINITY) {
            config.numa_affinity = parse_bool(&flag);
        }
        config
    }

    /// Set the plugin list.
    pub fn with_plugins(mut self, plugins: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.plugins = plugins.into_iter().map(Into::into).collect();
        self
    }

    /// Add a plugin search directory.
    pub fn with_search_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.search_paths.push(path.into());
        self
    }

    /// Enable or disable NUMA ordering.
    pub fn with_numa_affinity(mut self, enabled: bool) -> Self {
        self.numa_affinity = enabled;
        self
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "on" | "yes"
    )
}
