use anyhow::{Context, Result, anyhow, bail};
use serde::Deserialize;
use std::{
    fs,
    net::IpAddr,
    path::{Path, PathBuf},
};

const UNSPECIFIED_V4: &str = "0.0.0.0";
const LOOPBACK_V4: &str = "127.0.0.1";
const LOOPBACK_V6: &str = "::1";

/// Value of `ca` that turns off outbound certificate verification.
pub const INSECURE_CA: &str = "-";

/// Unresolved settings, as given on the command line or in a config file.
#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Options {
    pub listen: Option<String>,
    pub remote: Option<String>,
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
    pub ca: Option<String>,
    pub remote_tls: bool,
    pub verbose: bool,
    pub dump: bool,
}

impl Options {
    /// Fills every unset value from `fallback`. Flags are on if either side turns them on.
    #[must_use]
    pub fn or(self, fallback: Self) -> Self {
        Self {
            listen: self.listen.or(fallback.listen),
            remote: self.remote.or(fallback.remote),
            cert: self.cert.or(fallback.cert),
            key: self.key.or(fallback.key),
            ca: self.ca.or(fallback.ca),
            remote_tls: self.remote_tls || fallback.remote_tls,
            verbose: self.verbose || fallback.verbose,
            dump: self.dump || fallback.dump,
        }
    }
}

impl Options {
    /// Settings that have no effect because the feature they configure is off.
    #[must_use]
    pub fn ignored_settings(&self) -> Vec<&'static str> {
        let mut ignored = Vec::new();
        if self.cert.is_none() && self.key.is_some() {
            ignored.push("Ignoring key file: inbound TLS needs a certificate file");
        }
        if !self.remote_tls && self.ca.is_some() {
            ignored.push("Ignoring CA setting: outbound TLS is not enabled");
        }
        ignored
    }
}

pub fn load_config(path: &Path) -> Result<Options> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    toml::from_str(&content)
        .with_context(|| format!("Failed to parse {} as valid TOML", path.display()))
}

/// How the certificate presented by the remote is checked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrustPolicy {
    /// Platform trust store.
    System,
    /// PEM bundle of trusted CAs.
    Bundle(PathBuf),
    /// Accept any certificate.
    Insecure,
}

impl TrustPolicy {
    #[must_use]
    pub fn from_ca(ca: Option<&str>) -> Self {
        match ca {
            None | Some("") => Self::System,
            Some(INSECURE_CA) => Self::Insecure,
            Some(path) => Self::Bundle(PathBuf::from(path)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundTls {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundTls {
    pub trust: TrustPolicy,
}

/// Resolved forwarder configuration. Never changes once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub listen: String,
    pub remote: String,
    /// Host part of `remote`; outbound certificates are verified against it.
    pub remote_host: String,
    pub inbound_tls: Option<InboundTls>,
    pub outbound_tls: Option<OutboundTls>,
    pub verbose: bool,
    pub dump: bool,
}

impl Config {
    pub fn resolve(options: Options) -> Result<Self> {
        let listen = options
            .listen
            .filter(|listen| !listen.is_empty())
            .ok_or_else(|| anyhow!("missing local <address>:<port>"))?;
        let remote = options
            .remote
            .filter(|remote| !remote.is_empty())
            .ok_or_else(|| anyhow!("missing remote <address>:<port>"))?;

        let listen = normalize_listen(&listen)
            .with_context(|| format!("Invalid listen address {listen}"))?;
        let remote = normalize_remote(&remote, &listen)
            .with_context(|| format!("Invalid remote address {remote}"))?;

        let (remote_host, remote_port) = split_host_port(&remote)?;
        remote_port
            .parse::<u16>()
            .with_context(|| format!("Invalid remote port in {remote}"))?;
        let remote_host = remote_host.to_string();

        let inbound_tls = options.cert.map(|cert_file| InboundTls {
            key_file: options.key.unwrap_or_else(|| cert_file.clone()),
            cert_file,
        });

        let outbound_tls = options.remote_tls.then(|| OutboundTls {
            trust: TrustPolicy::from_ca(options.ca.as_deref()),
        });

        Ok(Self {
            listen,
            remote,
            remote_host,
            inbound_tls,
            outbound_tls,
            verbose: options.verbose,
            dump: options.dump,
        })
    }
}

/// A bare port listens on every interface.
pub fn normalize_listen(listen: &str) -> Result<String> {
    let (host, port) = if listen.contains(':') {
        split_host_port(listen)?
    } else {
        ("", listen)
    };
    port.parse::<u16>()
        .with_context(|| format!("Invalid listen port in {listen}"))?;
    if host.is_empty() {
        Ok(join_host_port(UNSPECIFIED_V4, port))
    } else {
        Ok(listen.to_string())
    }
}

/// Expands a remote given without a port.
///
/// A value containing `.` is taken as a host and inherits the listen port, so
/// `somehost.example.com` becomes `somehost.example.com:<listen port>`.
/// Anything else is taken as a port on the listen host, with wildcard listen
/// hosts mapped to loopback.
pub fn normalize_remote(remote: &str, listen: &str) -> Result<String> {
    if remote.contains(':') {
        let (host, port) = split_host_port(remote)?;
        return Ok(if host.is_empty() {
            join_host_port(LOOPBACK_V4, port)
        } else {
            remote.to_string()
        });
    }

    let (listen_host, listen_port) = split_host_port(listen)?;
    if remote.contains('.') {
        Ok(join_host_port(remote, listen_port))
    } else {
        Ok(join_host_port(loopback_for(listen_host), remote))
    }
}

fn loopback_for(host: &str) -> &str {
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) if ip.is_unspecified() => LOOPBACK_V4,
        Ok(IpAddr::V6(ip)) if ip.is_unspecified() => LOOPBACK_V6,
        _ if host.is_empty() => LOOPBACK_V4,
        _ => host,
    }
}

/// Splits `host:port` or `[v6host]:port`.
pub fn split_host_port(addr: &str) -> Result<(&str, &str)> {
    if let Some(rest) = addr.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| anyhow!("missing ']' in address {addr}"))?;
        let port = tail
            .strip_prefix(':')
            .ok_or_else(|| anyhow!("missing port in address {addr}"))?;
        return Ok((host, port));
    }

    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("missing port in address {addr}"))?;
    if host.contains(':') {
        bail!("too many colons in address {addr}");
    }
    Ok((host, port))
}

#[must_use]
pub fn join_host_port(host: &str, port: &str) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}
