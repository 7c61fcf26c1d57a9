/// Runtime configuration.
///
/// Configuration is layered: built-in defaults, then `~/.ouro/conf.toml`
/// (if present), then environment variables. The only environment flag the
/// toolchain documents is `OURO_DEBUG=true`, which turns on verbose dispatch
/// logging. A process-wide snapshot is available through [`OuroConf::global`]
/// for the CLI; the engine itself takes its configuration by value so an
/// embedder can run two engines with different settings.
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OuroConf {
    /// Log every dispatched instruction to stderr.
    pub debug_dispatch: bool,
    /// Worker-pool width for parallel regions. 0 = host default.
    pub default_parallelism: usize,
    /// Call-frame limit before the engine refuses to push another frame.
    pub max_call_depth: usize,
    /// Backend optimization level (0-3) used when the caller does not pick one.
    pub opt_level: u8,
}

impl Default for OuroConf {
    fn default() -> Self {
        OuroConf {
            debug_dispatch: false,
            default_parallelism: 0,
            max_call_depth: 1024,
            opt_level: 0,
        }
    }
}

static GLOBAL: Lazy<OuroConf> = Lazy::new(OuroConf::load);

impl OuroConf {
    /// The process-wide snapshot, loaded once.
    pub fn global() -> &'static OuroConf {
        &GLOBAL
    }

    /// Defaults → conf file → environment.
    pub fn load() -> Self {
        let mut conf = Self::from_file(Self::conf_path()).unwrap_or_default();
        if let Ok(v) = std::env::var("OURO_DEBUG") {
            conf.debug_dispatch = v.eq_ignore_ascii_case("true") || v == "1";
        }
        conf
    }

    fn conf_path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".ouro").join("conf.toml"))
    }

    fn from_file(path: Option<PathBuf>) -> Option<Self> {
        let path = path?;
        let text = std::fs::read_to_string(path).ok()?;
        toml::from_str(&text).ok()
    }

    /// Effective parallel-region width. 0 in the conf means "host default".
    pub fn parallelism(&self) -> usize {
        if self.default_parallelism > 0 {
            return self.default_parallelism;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let conf = OuroConf::default();
        assert!(!conf.debug_dispatch);
        assert_eq!(conf.default_parallelism, 0);
        assert!(conf.max_call_depth >= 64);
    }

    #[test]
    fn parallelism_zero_resolves_to_host_width() {
        let conf = OuroConf::default();
        assert!(conf.parallelism() >= 1);
    }
}
