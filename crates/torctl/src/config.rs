//! Top-level configuration: where the control port lives, how to
//! authenticate to it, and the [`torctl_circmgr::SelectionConfig`] that
//! governs path construction (spec §3.3).

use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use torctl_circmgr::SelectionConfig;

/// How to answer the control port's `PROTOCOLINFO`/`AUTHENTICATE` challenge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Auth {
    /// No authentication cookie or password configured (`AUTHENTICATE`
    /// with an empty string).
    #[default]
    Null,
    /// `AUTHENTICATE "<password>"`.
    Password(String),
    /// `AUTHENTICATE <hex>`, where `<hex>` is the hex encoding of the
    /// contents of the cookie file at this path.
    CookieFile(String),
}

/// Default control-port address: the usual `tor` default.
fn default_control_addr() -> String {
    "127.0.0.1:9051".to_string()
}

/// Top-level configuration for the `torctl` binary.
#[derive(Debug, Clone, PartialEq, Eq, Builder, Serialize, Deserialize)]
#[builder(build_fn(error = "torctl_error::Error"))]
#[builder(setter(into, strip_option), default)]
pub struct Config {
    /// `host:port` of the Tor control port.
    #[builder(default = "default_control_addr()")]
    #[serde(default = "default_control_addr")]
    pub control_addr: String,
    /// Authentication method for the control connection.
    #[builder(default)]
    #[serde(default)]
    pub auth: Auth,
    /// The path-selection policy.
    #[builder(default)]
    #[serde(default)]
    pub selection: SelectionConfig,
}

impl Default for Config {
    fn default() -> Self {
        ConfigBuilder::default().build().expect("unusable hardwired defaults")
    }
}

impl Config {
    /// A new builder.
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Load configuration from a TOML file, or fall back to
    /// [`Config::default`] if `path` is `None` (spec §3.3).
    pub fn load(path: Option<&std::path::Path>) -> Result<Config, torctl_error::Error> {
        let Some(path) = path else {
            return Ok(Config::default());
        };
        let text = std::fs::read_to_string(path)
            .map_err(|e| torctl_error::Error::Config(format!("reading {}: {e}", path.display())))?;
        toml::from_str(&text).map_err(|e| torctl_error::Error::Config(format!("parsing {}: {e}", path.display())))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn default_config_targets_the_usual_control_port() {
        let cfg = Config::default();
        assert_eq!(cfg.control_addr, "127.0.0.1:9051");
        assert_eq!(cfg.auth, Auth::Null);
    }

    #[test]
    fn builder_overrides_defaults() {
        let cfg = Config::builder()
            .control_addr("127.0.0.1:9151")
            .auth(Auth::Password("hunter2".into()))
            .build()
            .unwrap();
        assert_eq!(cfg.control_addr, "127.0.0.1:9151");
        assert_eq!(cfg.auth, Auth::Password("hunter2".into()));
    }

    #[test]
    fn load_with_no_path_yields_defaults() {
        let cfg = Config::load(None).unwrap();
        assert_eq!(cfg, Config::default());
    }

    #[test]
    fn load_parses_a_toml_file() {
        let dir = std::env::temp_dir();
        let path = dir.join("torctl-config-test-load-parses.toml");
        std::fs::write(&path, "control_addr = \"127.0.0.1:9999\"\n[selection]\npathlen = 4\n").unwrap();
        let cfg = Config::load(Some(&path)).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(cfg.control_addr, "127.0.0.1:9999");
        assert_eq!(cfg.selection.pathlen, 4);
    }
}
