use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, ensure, Result};
use config::{Config, ConfigError, Environment, File};
use regex::Regex;
use serde::Deserialize;

use crate::cli::{Cli, LogFormat};
use crate::gc::{AgeThresholds, GcOptions};

fn default_workers() -> usize {
    4
}

fn default_upstream_timeout() -> u64 {
    60
}

fn default_log_format() -> LogFormat {
    LogFormat::Json
}

fn default_gc_interval() -> u64 {
    300
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub listen: SocketAddr,
    pub data_dir: PathBuf,
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Upstream request timeout in seconds.
    #[serde(default = "default_upstream_timeout")]
    pub upstream_timeout: u64,
    #[serde(default = "default_log_format")]
    pub log: LogFormat,
    pub tls: TlsSettings,
    pub default_backend: BackendSettings,
    #[serde(default)]
    pub upstream_rules: Vec<UpstreamRuleSettings>,
    #[serde(default)]
    pub metrics: Option<MetricsSettings>,
    pub gc: GcSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TlsSettings {
    pub cert: PathBuf,
    pub key: PathBuf,
    /// Extra CA bundle trusted for upstream connections; system roots are
    /// always used.
    #[serde(default)]
    pub upstream_ca: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendSettings {
    pub host: String,
    pub scheme: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamRuleSettings {
    /// Matched against the incoming Host header.
    pub regex: String,
    /// Target host; may contain $group0..$groupN placeholders.
    pub host: String,
    pub scheme: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsSettings {
    pub listen: SocketAddr,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GcSettings {
    /// Seconds between sweeps, minimum 60.
    #[serde(default = "default_gc_interval")]
    pub interval: u64,
    #[serde(default)]
    pub check_sha: bool,
    pub disk: DiskSettings,
    pub layers: AgeSettings,
    pub manifests: AgeSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiskSettings {
    /// Cache size cap in bytes.
    pub max_size: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgeSettings {
    /// Seconds since creation after which an object is dropped.
    pub max_age: u64,
    /// Seconds since last access after which an object is dropped.
    pub max_unused: u64,
}

impl Settings {
    pub fn load(cli: &Cli) -> Result<Self> {
        let config_path = resolve_config_path(cli)?;

        let cfg = Config::builder()
            .add_source(File::from(config_path.clone()).required(true))
            .add_source(
                Environment::with_prefix("LAYERSTASH")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(to_anyhow)?;

        let mut settings: Settings = cfg.try_deserialize().map_err(to_anyhow)?;
        settings.apply_base_dir(&config_path);
        settings.validate()?;
        Ok(settings)
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout)
    }

    pub fn gc_options(&self) -> GcOptions {
        GcOptions {
            interval: Duration::from_secs(self.gc.interval),
            check_sha: self.gc.check_sha,
            max_disk_size: self.gc.disk.max_size,
            layers: AgeThresholds {
                max_age: Duration::from_secs(self.gc.layers.max_age),
                max_unused: Duration::from_secs(self.gc.layers.max_unused),
            },
            manifests: AgeThresholds {
                max_age: Duration::from_secs(self.gc.manifests.max_age),
                max_unused: Duration::from_secs(self.gc.manifests.max_unused),
            },
        }
    }

    fn apply_base_dir(&mut self, config_path: &Path) {
        let base_dir = config_path
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));

        self.data_dir = absolutize(&self.data_dir, base_dir);
        self.tls.cert = absolutize(&self.tls.cert, base_dir);
        self.tls.key = absolutize(&self.tls.key, base_dir);
        if let Some(ca) = self.tls.upstream_ca.clone() {
            self.tls.upstream_ca = Some(absolutize(&ca, base_dir));
        }
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.workers >= 1,
            "workers must be at least 1 (got {})",
            self.workers
        );
        ensure!(
            self.upstream_timeout >= 1,
            "upstream_timeout must be at least 1 second (got {})",
            self.upstream_timeout
        );
        ensure!(
            !self.data_dir.as_os_str().is_empty(),
            "data_dir must not be empty"
        );

        validate_scheme(&self.default_backend.scheme, "default_backend")?;
        for (i, rule) in self.upstream_rules.iter().enumerate() {
            validate_scheme(&rule.scheme, &format!("upstream rule {i}"))?;
            Regex::new(&rule.regex).map_err(|err| {
                anyhow::anyhow!("upstream rule {i} has an invalid regex '{}': {err}", rule.regex)
            })?;
        }

        ensure!(
            self.gc.interval >= 60,
            "gc.interval must be at least 60 seconds (got {})",
            self.gc.interval
        );
        ensure!(
            self.gc.disk.max_size > 0,
            "gc.disk.max_size must be greater than 0"
        );
        for (name, ages) in [("layers", &self.gc.layers), ("manifests", &self.gc.manifests)] {
            ensure!(
                ages.max_age >= 60,
                "gc.{name}.max_age must be at least 60 seconds (got {})",
                ages.max_age
            );
            ensure!(
                ages.max_unused >= 60,
                "gc.{name}.max_unused must be at least 60 seconds (got {})",
                ages.max_unused
            );
        }
        Ok(())
    }
}

fn validate_scheme(scheme: &str, what: &str) -> Result<()> {
    if scheme != "http" && scheme != "https" {
        bail!("{what} scheme must be http or https (got '{scheme}')");
    }
    Ok(())
}

fn to_anyhow(err: ConfigError) -> anyhow::Error {
    anyhow::anyhow!(err)
}

fn resolve_config_path(cli: &Cli) -> Result<PathBuf> {
    if let Some(path) = cli.config.as_deref() {
        return Ok(path.to_path_buf());
    }

    for candidate in default_config_candidates() {
        if candidate.exists() {
            return Ok(candidate);
        }
    }

    bail!(
        "no configuration file provided via --config and none found in default locations: {}",
        default_config_candidates()
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(", ")
    );
}

fn default_config_candidates() -> [PathBuf; 2] {
    [
        PathBuf::from("/etc/layerstash/layerstash.toml"),
        PathBuf::from("layerstash.toml"),
    ]
}

fn absolutize(path: &Path, base: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_settings() -> Settings {
        Settings {
            listen: "0.0.0.0:8443".parse().unwrap(),
            data_dir: PathBuf::from("/var/lib/layerstash"),
            workers: 4,
            upstream_timeout: 60,
            log: LogFormat::Text,
            tls: TlsSettings {
                cert: PathBuf::from("server.crt"),
                key: PathBuf::from("server.key"),
                upstream_ca: None,
            },
            default_backend: BackendSettings {
                host: "registry-1.docker.io".to_string(),
                scheme: "https".to_string(),
            },
            upstream_rules: vec![UpstreamRuleSettings {
                regex: "^(.+)\\.mirror\\.local$".to_string(),
                host: "$group1.upstream.io".to_string(),
                scheme: "https".to_string(),
            }],
            metrics: None,
            gc: GcSettings {
                interval: 300,
                check_sha: false,
                disk: DiskSettings {
                    max_size: 10 * 1024 * 1024 * 1024,
                },
                layers: AgeSettings {
                    max_age: 604_800,
                    max_unused: 86_400,
                },
                manifests: AgeSettings {
                    max_age: 86_400,
                    max_unused: 3_600,
                },
            },
        }
    }

    #[test]
    fn accepts_a_complete_configuration() {
        assert!(valid_settings().validate().is_ok());
    }

    #[test]
    fn rejects_zero_workers() {
        let mut settings = valid_settings();
        settings.workers = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn rejects_short_gc_interval() {
        let mut settings = valid_settings();
        settings.gc.interval = 30;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn rejects_unknown_schemes() {
        let mut settings = valid_settings();
        settings.default_backend.scheme = "ftp".to_string();
        assert!(settings.validate().is_err());

        let mut settings = valid_settings();
        settings.upstream_rules[0].scheme = "gopher".to_string();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn rejects_broken_rule_regexes() {
        let mut settings = valid_settings();
        settings.upstream_rules[0].regex = "(".to_string();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn rejects_zero_disk_cap_and_short_age_bounds() {
        let mut settings = valid_settings();
        settings.gc.disk.max_size = 0;
        assert!(settings.validate().is_err());

        let mut settings = valid_settings();
        settings.gc.layers.max_unused = 5;
        assert!(settings.validate().is_err());
    }
}
