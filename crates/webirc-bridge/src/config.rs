//! YAML configuration schema and compilation into the runtime snapshot.
//!
//! Exported (deserialized) fields mirror the configuration file; `compile`
//! validates them and resolves everything that should fail fast -- TLS key
//! pairs, origin globs, CIDR lists, encoding labels -- into an immutable
//! [`GatewayConfig`]. A file that fails any check produces no snapshot at
//! all, which is what lets a bad reload leave the running configuration
//! untouched.

use std::collections::HashMap;
use std::io::BufReader;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use ipnet::IpNet;
use serde::Deserialize;
use thiserror::Error;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::version::{TLS12, TLS13};
use tokio_rustls::rustls::{ClientConfig, RootCertStore, ServerConfig, SupportedProtocolVersion};
use tracing::warn;

use irc_transcode::Transcoder;
use irc_wire::{is_valid_non_final_param, DEFAULT_MAX_LINE_LEN, MAX_CLIENT_TAG_DATA};
use ws_bridge::{GatewayConfig, ListenerSpec, OriginPolicy, UpstreamSpec, WebircSpec};

/// Slack added on top of tag data and line length when sizing the read queue.
const READQ_SLACK: usize = 1024;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file")]
    Parse(#[from] serde_yml::Error),
    #[error("gateway name must be valid as a non-final IRC parameter: nonempty, no spaces, no initial ':'")]
    InvalidGatewayName,
    #[error("no listeners were configured")]
    NoListeners,
    #[error("no upstreams configured")]
    NoUpstreams,
    #[error("cannot enable both chardet and a static list of encodings")]
    TranscodingConflict,
    #[error(transparent)]
    InvalidEncoding(#[from] irc_transcode::UnknownEncoding),
    #[error("invalid websocket allowed-origin expression")]
    InvalidOriginGlob(#[from] globset::Error),
    #[error("could not parse proxy-allowed-from entry {0:?}")]
    InvalidNet(String),
    #[error("failed to load TLS key pair ({cert}, {key}): {reason}")]
    Certificate {
        cert: String,
        key: String,
        reason: String,
    },
}

// ---------------------------------------------------------------------------
// File schema
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct FileConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    pub gateway_name: String,
    #[serde(default)]
    pub listeners: HashMap<String, ListenerBlock>,
    #[serde(default = "default_unix_bind_mode")]
    pub unix_bind_mode: u32,
    #[serde(default)]
    pub allowed_origins: Vec<String>,
    #[serde(default)]
    pub upstreams: Vec<UpstreamBlock>,
    #[serde(default)]
    pub lookup_hostnames: bool,
    #[serde(default)]
    pub forward_confirm_hostnames: bool,
    #[serde(default)]
    pub proxy_allowed_from: Vec<String>,
    #[serde(default)]
    pub transcoding: TranscodingBlock,
    #[serde(default)]
    pub max_line_len: usize,
    /// Accepted for compatibility; the debug endpoint is not part of this
    /// build.
    #[serde(default)]
    pub pprof_listener: Option<String>,
    /// Upstream dial timeout in seconds.
    #[serde(default)]
    pub dial_timeout: Option<u64>,
}

/// One certificate/key file pair.
#[derive(Debug, Default, Deserialize)]
pub struct TlsPair {
    #[serde(default)]
    pub cert: String,
    #[serde(default)]
    pub key: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ListenerBlock {
    /// Normal TLS configuration, with a single certificate.
    #[serde(default)]
    pub tls: TlsPair,
    /// SNI configuration, with multiple certificates.
    #[serde(default)]
    pub tls_certificates: Vec<TlsPair>,
    #[serde(default)]
    pub min_tls_version: Option<String>,
    #[serde(default)]
    pub proxy: bool,
    #[serde(default)]
    pub tor: bool,
    #[serde(default)]
    pub sts_only: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct UpstreamBlock {
    pub address: String,
    #[serde(default)]
    pub tls: bool,
    #[serde(default)]
    pub webirc: WebircBlock,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct WebircBlock {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub cert: String,
    #[serde(default)]
    pub key: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TranscodingBlock {
    #[serde(default)]
    pub enable_chardet: bool,
    #[serde(default)]
    pub encodings: Vec<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_unix_bind_mode() -> u32 {
    0o777
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load and compile the configuration file at `path`.
pub fn load(path: &Path) -> Result<GatewayConfig, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    let file: FileConfig = serde_yml::from_str(&contents)?;
    compile(file)
}

/// Validate a deserialized file and resolve it into a runtime snapshot.
pub fn compile(file: FileConfig) -> Result<GatewayConfig, ConfigError> {
    if !is_valid_non_final_param(&file.gateway_name) {
        return Err(ConfigError::InvalidGatewayName);
    }
    if file.listeners.is_empty() {
        return Err(ConfigError::NoListeners);
    }
    if file.upstreams.is_empty() {
        return Err(ConfigError::NoUpstreams);
    }
    if let Some(addr) = &file.pprof_listener {
        warn!(%addr, "pprof-listener is not supported by this build; ignoring");
    }

    let transcoder = build_transcoder(&file.transcoding)?;
    let origin_policy = OriginPolicy::compile(&file.allowed_origins)?;
    let proxy_allowed_from = parse_net_list(&file.proxy_allowed_from)?;

    let mut listeners = HashMap::with_capacity(file.listeners.len());
    for (addr, block) in &file.listeners {
        if block.sts_only {
            warn!(%addr, "sts-only is not supported by this build; ignoring");
        }
        let mut spec = ListenerSpec::new();
        spec.tls = build_listener_tls(block)?;
        spec.require_proxy = block.proxy;
        spec.tor = block.tor;
        listeners.insert(addr.clone(), spec);
    }

    let mut upstreams = Vec::with_capacity(file.upstreams.len());
    for block in &file.upstreams {
        upstreams.push(build_upstream(block)?);
    }

    let max_line_len = file.max_line_len.max(DEFAULT_MAX_LINE_LEN);
    let max_readq_bytes = MAX_CLIENT_TAG_DATA + max_line_len + READQ_SLACK;

    Ok(GatewayConfig {
        listeners,
        upstreams,
        origin_policy,
        proxy_allowed_from,
        gateway_name: file.gateway_name,
        dial_timeout: file
            .dial_timeout
            .map(Duration::from_secs)
            .unwrap_or(ws_bridge::config::DEFAULT_DIAL_TIMEOUT),
        lookup_hostnames: file.lookup_hostnames,
        forward_confirm_hostnames: file.forward_confirm_hostnames,
        max_line_len,
        max_readq_bytes,
        unix_bind_mode: file.unix_bind_mode,
        transcoder,
        log_level: file.log_level,
    })
}

/// Exactly one transcoding strategy is active per snapshot; asking for both
/// chardet and a fixed list is a configuration error, not a preference.
fn build_transcoder(block: &TranscodingBlock) -> Result<Transcoder, ConfigError> {
    match (block.enable_chardet, block.encodings.is_empty()) {
        (true, false) => Err(ConfigError::TranscodingConflict),
        (true, true) => Ok(Transcoder::chardet()),
        (false, false) => Ok(Transcoder::fixed_encodings(&block.encodings)?),
        (false, true) => Ok(Transcoder::replacement()),
    }
}

fn parse_net_list(entries: &[String]) -> Result<Vec<IpNet>, ConfigError> {
    let mut nets = Vec::new();
    for entry in entries {
        if entry == "localhost" {
            nets.push("127.0.0.0/8".parse().expect("static net"));
            nets.push("::1/128".parse().expect("static net"));
            continue;
        }
        if let Ok(net) = entry.parse::<IpNet>() {
            nets.push(net);
        } else if let Ok(ip) = entry.parse::<IpAddr>() {
            nets.push(IpNet::from(ip));
        } else {
            return Err(ConfigError::InvalidNet(entry.clone()));
        }
    }
    Ok(nets)
}

fn load_key_pair(
    cert_path: &str,
    key_path: &str,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), ConfigError> {
    let certificate_error = |reason: String| ConfigError::Certificate {
        cert: cert_path.to_string(),
        key: key_path.to_string(),
        reason,
    };

    let cert_file = std::fs::File::open(cert_path).map_err(|e| certificate_error(e.to_string()))?;
    let chain: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut BufReader::new(cert_file))
        .collect::<Result<_, _>>()
        .map_err(|e| certificate_error(e.to_string()))?;
    if chain.is_empty() {
        return Err(certificate_error("no certificates found".to_string()));
    }

    let key_file = std::fs::File::open(key_path).map_err(|e| certificate_error(e.to_string()))?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(key_file))
        .map_err(|e| certificate_error(e.to_string()))?
        .ok_or_else(|| certificate_error("no private key found".to_string()))?;

    Ok((chain, key))
}

fn protocol_versions(min_tls_version: Option<&str>) -> Vec<&'static SupportedProtocolVersion> {
    let version = min_tls_version
        .unwrap_or("1.2")
        .trim()
        .to_lowercase();
    let version = version.strip_prefix('v').unwrap_or(&version);
    match version {
        "1.3" => vec![&TLS13],
        "1.2" => vec![&TLS13, &TLS12],
        other => {
            // rustls cannot go below 1.2.
            warn!(requested = other, "unsupported min-tls-version; using 1.2");
            vec![&TLS13, &TLS12]
        }
    }
}

fn build_listener_tls(block: &ListenerBlock) -> Result<Option<Arc<ServerConfig>>, ConfigError> {
    let pairs: Vec<&TlsPair> = if !block.tls_certificates.is_empty() {
        block.tls_certificates.iter().collect()
    } else if !block.tls.cert.is_empty() {
        vec![&block.tls]
    } else {
        // Plaintext listener.
        return Ok(None);
    };

    if pairs.len() > 1 {
        warn!("multiple listener certificates configured; SNI selection is not supported, using the first");
    }
    let pair = pairs[0];
    let (chain, key) = load_key_pair(&pair.cert, &pair.key)?;

    // Browsers disconnect immediately if a websocket server requests a client
    // certificate, so none is ever requested here.
    let config = ServerConfig::builder_with_protocol_versions(&protocol_versions(
        block.min_tls_version.as_deref(),
    ))
    .with_no_client_auth()
    .with_single_cert(chain, key)
    .map_err(|e| ConfigError::Certificate {
        cert: pair.cert.clone(),
        key: pair.key.clone(),
        reason: e.to_string(),
    })?;

    Ok(Some(Arc::new(config)))
}

fn build_upstream(block: &UpstreamBlock) -> Result<UpstreamSpec, ConfigError> {
    let address = block
        .address
        .strip_prefix("unix:")
        .unwrap_or(&block.address)
        .to_string();

    let webirc = if block.webirc.enabled {
        let password = if block.webirc.password.is_empty() {
            "*".to_string()
        } else {
            block.webirc.password.clone()
        };
        Some(WebircSpec { password })
    } else {
        None
    };

    let tls = if block.tls {
        let mut roots = RootCertStore::empty();
        let native = rustls_native_certs::load_native_certs();
        for cert in native.certs {
            if let Err(e) = roots.add(cert) {
                warn!(error = %e, "failed to add native root certificate");
            }
        }
        for e in &native.errors {
            warn!(error = %e, "error loading native root certificates");
        }

        let builder = ClientConfig::builder_with_protocol_versions(&[&TLS13])
            .with_root_certificates(roots);
        let config = if block.webirc.enabled && !block.webirc.cert.is_empty() {
            let (chain, key) = load_key_pair(&block.webirc.cert, &block.webirc.key)?;
            builder
                .with_client_auth_cert(chain, key)
                .map_err(|e| ConfigError::Certificate {
                    cert: block.webirc.cert.clone(),
                    key: block.webirc.key.clone(),
                    reason: e.to_string(),
                })?
        } else {
            builder.with_no_client_auth()
        };
        Some(Arc::new(config))
    } else {
        None
    };

    Ok(UpstreamSpec {
        address,
        tls,
        webirc,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_yaml() -> &'static str {
        r#"
gateway-name: wp.example
listeners:
  "127.0.0.1:8067": {}
upstreams:
  - address: "127.0.0.1:6667"
"#
    }

    #[test]
    fn minimal_config_compiles() {
        let file: FileConfig = serde_yml::from_str(minimal_yaml()).unwrap();
        let config = compile(file).unwrap();
        assert_eq!(config.gateway_name, "wp.example");
        assert_eq!(config.max_line_len, 512);
        assert_eq!(config.max_readq_bytes, 4094 + 512 + 1024);
        assert_eq!(config.dial_timeout, Duration::from_secs(5));
        assert_eq!(config.unix_bind_mode, 0o777);
    }

    #[test]
    fn gateway_name_is_validated() {
        for bad in ["", "has space", ":leading"] {
            let yaml = format!(
                "gateway-name: {bad:?}\nlisteners:\n  \"127.0.0.1:8067\": {{}}\nupstreams:\n  - address: \"127.0.0.1:6667\"\n"
            );
            let file: FileConfig = serde_yml::from_str(&yaml).unwrap();
            assert!(matches!(compile(file), Err(ConfigError::InvalidGatewayName)));
        }
    }

    #[test]
    fn listeners_and_upstreams_are_required() {
        let no_listeners = r#"
gateway-name: wp.example
upstreams:
  - address: "127.0.0.1:6667"
"#;
        let file: FileConfig = serde_yml::from_str(no_listeners).unwrap();
        assert!(matches!(compile(file), Err(ConfigError::NoListeners)));

        let no_upstreams = r#"
gateway-name: wp.example
listeners:
  "127.0.0.1:8067": {}
"#;
        let file: FileConfig = serde_yml::from_str(no_upstreams).unwrap();
        assert!(matches!(compile(file), Err(ConfigError::NoUpstreams)));
    }

    #[test]
    fn chardet_and_fixed_encodings_are_mutually_exclusive() {
        let yaml = r#"
gateway-name: wp.example
listeners:
  "127.0.0.1:8067": {}
upstreams:
  - address: "127.0.0.1:6667"
transcoding:
  enable-chardet: true
  encodings: [windows-1252]
"#;
        let file: FileConfig = serde_yml::from_str(yaml).unwrap();
        assert!(matches!(compile(file), Err(ConfigError::TranscodingConflict)));
    }

    #[test]
    fn unknown_encoding_label_fails() {
        let yaml = r#"
gateway-name: wp.example
listeners:
  "127.0.0.1:8067": {}
upstreams:
  - address: "127.0.0.1:6667"
transcoding:
  encodings: [no-such-charset]
"#;
        let file: FileConfig = serde_yml::from_str(yaml).unwrap();
        assert!(matches!(compile(file), Err(ConfigError::InvalidEncoding(_))));
    }

    #[test]
    fn invalid_origin_glob_fails() {
        let yaml = r#"
gateway-name: wp.example
listeners:
  "127.0.0.1:8067": {}
upstreams:
  - address: "127.0.0.1:6667"
allowed-origins: ["https://["]
"#;
        let file: FileConfig = serde_yml::from_str(yaml).unwrap();
        assert!(matches!(compile(file), Err(ConfigError::InvalidOriginGlob(_))));
    }

    #[test]
    fn proxy_allowed_from_parses_cidrs_bare_ips_and_localhost() {
        let yaml = r#"
gateway-name: wp.example
listeners:
  "127.0.0.1:8067": {}
upstreams:
  - address: "127.0.0.1:6667"
proxy-allowed-from: ["10.0.0.0/8", "192.0.2.7", localhost]
"#;
        let file: FileConfig = serde_yml::from_str(yaml).unwrap();
        let config = compile(file).unwrap();
        // localhost expands to the v4 loopback net plus ::1.
        assert_eq!(config.proxy_allowed_from.len(), 4);

        let yaml_bad = r#"
gateway-name: wp.example
listeners:
  "127.0.0.1:8067": {}
upstreams:
  - address: "127.0.0.1:6667"
proxy-allowed-from: ["not-a-net"]
"#;
        let file: FileConfig = serde_yml::from_str(yaml_bad).unwrap();
        assert!(matches!(compile(file), Err(ConfigError::InvalidNet(_))));
    }

    #[test]
    fn unix_prefix_is_stripped_and_webirc_password_defaulted() {
        let yaml = r#"
gateway-name: wp.example
listeners:
  "127.0.0.1:8067": {}
upstreams:
  - address: "unix:/run/ircd.sock"
    webirc:
      enabled: true
"#;
        let file: FileConfig = serde_yml::from_str(yaml).unwrap();
        let config = compile(file).unwrap();
        assert_eq!(config.upstreams[0].address, "/run/ircd.sock");
        assert_eq!(
            config.upstreams[0].webirc.as_ref().unwrap().password,
            "*"
        );
    }

    #[test]
    fn max_line_len_is_floored_at_default() {
        let yaml = r#"
gateway-name: wp.example
listeners:
  "127.0.0.1:8067": {}
upstreams:
  - address: "127.0.0.1:6667"
max-line-len: 100
"#;
        let file: FileConfig = serde_yml::from_str(yaml).unwrap();
        let config = compile(file).unwrap();
        assert_eq!(config.max_line_len, 512);

        let yaml = r#"
gateway-name: wp.example
listeners:
  "127.0.0.1:8067": {}
upstreams:
  - address: "127.0.0.1:6667"
max-line-len: 4096
"#;
        let file: FileConfig = serde_yml::from_str(yaml).unwrap();
        let config = compile(file).unwrap();
        assert_eq!(config.max_line_len, 4096);
        assert_eq!(config.max_readq_bytes, 4094 + 4096 + 1024);
    }
}
