//! Layered configuration: compiled-in defaults overridden once, at startup,
//! by the environment variables of the external-interfaces surface. No
//! component outside this module reads `std::env::var` directly — every
//! value a component needs is threaded through an immutable `Config`.

use std::path::PathBuf;

use crate::error::ConfigError;

/// Default outbound port when a target host names none explicitly.
pub const DEFAULT_PORT: u16 = 6680;
/// Default bounded outbound retry count when `-r`/`--retry` is not given.
pub const DEFAULT_RETRY: u32 = 5;
/// Default ambient log severity.
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Resolves the on-disk locations used by the keystore and binary cache.
///
/// A single struct constructed once and threaded everywhere a path is
/// needed, rather than ad hoc `env::var` calls scattered through the
/// components that consume them.
#[derive(Debug, Clone)]
pub struct Paths {
    state_dir: PathBuf,
    cache_dir: PathBuf,
}

impl Paths {
    /// Resolve from `ARCAN_STATEPATH`/`A12_CACHE_DIR`, falling back to
    /// `$HOME/.arcan` and `$HOME/.cache/arcan` respectively.
    pub fn resolve() -> Result<Self, ConfigError> {
        let home = dirs::home_dir().ok_or(ConfigError::NoHomeDir)?;

        let state_dir = std::env::var_os("ARCAN_STATEPATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| home.join(".arcan"));

        let cache_dir = std::env::var_os("A12_CACHE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| home.join(".cache").join("arcan"));

        Ok(Self {
            state_dir,
            cache_dir,
        })
    }

    pub fn with_dirs(state_dir: PathBuf, cache_dir: PathBuf) -> Self {
        Self {
            state_dir,
            cache_dir,
        }
    }

    pub fn state_dir(&self) -> &PathBuf {
        &self.state_dir
    }

    pub fn cache_dir(&self) -> &PathBuf {
        &self.cache_dir
    }

    /// Directory backing the keystore facade (§4.8): owner-only, created if
    /// missing.
    pub fn keystore_dir(&self) -> PathBuf {
        self.state_dir.join("keystore")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.state_dir.join("logs")
    }

    /// Create every directory this struct names, with owner-only
    /// permissions on the keystore root.
    pub fn ensure_dirs(&self) -> Result<(), ConfigError> {
        std::fs::create_dir_all(&self.state_dir)?;
        std::fs::create_dir_all(&self.cache_dir)?;
        std::fs::create_dir_all(self.logs_dir())?;

        let keystore_dir = self.keystore_dir();
        std::fs::create_dir_all(&keystore_dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&keystore_dir, std::fs::Permissions::from_mode(0o700))?;
        }
        Ok(())
    }
}

/// One process's configuration, loaded once at startup and never re-read.
#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub default_port: u16,
    pub default_retry: u32,
    /// `ARCAN_DEBUG_NONANNY`: when present, the child supervisor's reaper
    /// thread is disabled (debuggers manage their own children).
    pub reaper_enabled: bool,
    /// Default redirect target on remote exit / device hint.
    pub connpath: Option<String>,
    /// Pre-negotiated shared segment key passed to a spawned producer.
    pub shmkey: Option<String>,
    /// Pre-negotiated segment size passed to a spawned producer.
    pub shmsize: Option<usize>,
    /// Inherited socket descriptor passed to a spawned producer.
    pub sockin_fd: Option<i32>,
    pub applpath: Option<String>,
    pub arg: Option<String>,
    pub paths: PathsConfig,
}

/// The subset of `Paths` carried on `Config` for `Debug`/`Clone`; the real
/// resolved `Paths` value is reconstructed from it on demand via
/// [`Config::paths`].
#[derive(Debug, Clone)]
pub struct PathsConfig {
    pub state_dir: PathBuf,
    pub cache_dir: PathBuf,
}

impl Config {
    /// Compiled-in defaults, before any environment override.
    pub fn defaults() -> Result<Self, ConfigError> {
        let paths = Paths::resolve()?;
        Ok(Self {
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            default_port: DEFAULT_PORT,
            default_retry: DEFAULT_RETRY,
            reaper_enabled: true,
            connpath: None,
            shmkey: None,
            shmsize: None,
            sockin_fd: None,
            applpath: None,
            arg: None,
            paths: PathsConfig {
                state_dir: paths.state_dir,
                cache_dir: paths.cache_dir,
            },
        })
    }

    /// Build the configuration for this process: defaults, then
    /// environment overrides. Called exactly once, from `main`.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::defaults()?;
        config.load_from_env()?;
        Ok(config)
    }

    fn load_from_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(level) = std::env::var("RUST_LOG") {
            self.log_level = level;
        }
        self.reaper_enabled = std::env::var_os("ARCAN_DEBUG_NONANNY").is_none();
        self.connpath = non_empty_env("ARCAN_CONNPATH");
        self.shmkey = non_empty_env("ARCAN_SHMKEY");
        self.shmsize = non_empty_env("ARCAN_SHMSIZE").and_then(|v| v.parse().ok());
        self.sockin_fd = non_empty_env("ARCAN_SOCKIN_FD").and_then(|v| v.parse().ok());
        self.applpath = non_empty_env("ARCAN_APPLPATH");
        self.arg = non_empty_env("ARCAN_ARG");
        Ok(())
    }

    pub fn paths(&self) -> Paths {
        Paths::with_dirs(self.paths.state_dir.clone(), self.paths.cache_dir.clone())
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_have_sane_values() {
        let config = Config::defaults().unwrap();
        assert_eq!(config.log_level, DEFAULT_LOG_LEVEL);
        assert_eq!(config.default_port, DEFAULT_PORT);
        assert!(config.reaper_enabled);
        assert!(config.connpath.is_none());
    }

    #[test]
    fn paths_with_dirs_roundtrips() {
        let paths = Paths::with_dirs(PathBuf::from("/tmp/state"), PathBuf::from("/tmp/cache"));
        assert_eq!(paths.state_dir(), &PathBuf::from("/tmp/state"));
        assert_eq!(paths.keystore_dir(), PathBuf::from("/tmp/state/keystore"));
    }

    #[test]
    fn ensure_dirs_creates_keystore_with_owner_only_permissions() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::with_dirs(dir.path().join("state"), dir.path().join("cache"));
        paths.ensure_dirs().unwrap();

        assert!(paths.keystore_dir().exists());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(paths.keystore_dir())
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o700);
        }
    }

    #[test]
    fn shmsize_env_parses_to_number() {
        std::env::set_var("ARCAN_SHMSIZE", "65536");
        let mut config = Config::defaults().unwrap();
        config.load_from_env().unwrap();
        assert_eq!(config.shmsize, Some(65536));
        std::env::remove_var("ARCAN_SHMSIZE");
    }
}
