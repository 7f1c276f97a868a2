use std::fs::File;
use std::io::{self, BufReader, ErrorKind};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use pgwire::tokio::TlsAcceptor;
use pgwire::tokio::tokio_rustls::rustls::ServerConfig;

use crate::engine::ReservePolicy;
use crate::tenant::TenantSettings;

/// Server configuration, read once from `ROOMD_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub sweep_interval: Duration,
    pub reserve_policy: ReservePolicy,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    pub metrics_port: Option<u16>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 5433,
            bind: "0.0.0.0".into(),
            data_dir: PathBuf::from("./data"),
            password: "roomd".into(),
            max_connections: 256,
            compact_threshold: 1000,
            sweep_interval: Duration::from_secs(30),
            reserve_policy: ReservePolicy::default(),
            tls_cert: None,
            tls_key: None,
            metrics_port: None,
        }
    }
}

#[derive(Debug)]
pub struct ConfigError {
    pub var: &'static str,
    pub value: String,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid value for {}: {:?}", self.var, self.value)
    }
}

impl std::error::Error for ConfigError {}

fn parsed<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(var) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError { var, value }),
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from an arbitrary variable source. Unset variables keep their
    /// defaults; set but unparsable ones are an error.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let d = Config::default();
        let sweep_secs: Option<u64> = parsed(&lookup, "ROOMD_SWEEP_INTERVAL_SECS")?;
        if sweep_secs == Some(0) {
            return Err(ConfigError { var: "ROOMD_SWEEP_INTERVAL_SECS", value: "0".into() });
        }
        Ok(Self {
            port: parsed(&lookup, "ROOMD_PORT")?.unwrap_or(d.port),
            bind: lookup("ROOMD_BIND").unwrap_or(d.bind),
            data_dir: lookup("ROOMD_DATA_DIR").map(PathBuf::from).unwrap_or(d.data_dir),
            password: lookup("ROOMD_PASSWORD").unwrap_or(d.password),
            max_connections: parsed(&lookup, "ROOMD_MAX_CONNECTIONS")?.unwrap_or(d.max_connections),
            compact_threshold: parsed(&lookup, "ROOMD_COMPACT_THRESHOLD")?.unwrap_or(d.compact_threshold),
            sweep_interval: sweep_secs.map(Duration::from_secs).unwrap_or(d.sweep_interval),
            reserve_policy: parsed(&lookup, "ROOMD_RESERVE_POLICY")?.unwrap_or(d.reserve_policy),
            tls_cert: lookup("ROOMD_TLS_CERT").map(PathBuf::from),
            tls_key: lookup("ROOMD_TLS_KEY").map(PathBuf::from),
            metrics_port: parsed(&lookup, "ROOMD_METRICS_PORT")?,
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn tenant_settings(&self) -> TenantSettings {
        TenantSettings {
            compact_threshold: self.compact_threshold,
            sweep_interval: self.sweep_interval,
            reserve_policy: self.reserve_policy,
        }
    }

    /// Load the TLS acceptor from the PEM cert/key pair, if configured.
    pub fn tls_acceptor(&self) -> io::Result<Option<TlsAcceptor>> {
        let (cert_path, key_path) = match (&self.tls_cert, &self.tls_key) {
            (None, None) => return Ok(None),
            (Some(c), Some(k)) => (c, k),
            _ => {
                return Err(io::Error::new(
                    ErrorKind::InvalidInput,
                    "both ROOMD_TLS_CERT and ROOMD_TLS_KEY must be set, or neither",
                ));
            }
        };

        let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(File::open(cert_path)?))
            .collect::<Result<_, _>>()?;
        let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(key_path)?))?
            .ok_or_else(|| io::Error::new(ErrorKind::InvalidInput, "no private key found in key file"))?;

        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| io::Error::new(ErrorKind::InvalidInput, e))?;
        config.alpn_protocols = vec![b"postgresql".to_vec()];

        Ok(Some(TlsAcceptor::from(Arc::new(config))))
    }
}
