use clap::Parser;
use std::{ffi::OsString, path::PathBuf};

use crate::config::Options;

/// General-purpose TCP forwarder with optional encryption.
#[derive(Parser, Debug, Default)]
#[command(name = "netfwd", version)]
#[command(
    about = "General-purpose TCP forwarder with optional TLS on either side",
    long_about = "Accepts inbound connections, connects to the remote address and forwards \
                  traffic between the two sockets. TLS is supported on both inbound and \
                  outbound connections. The dump option (useful for debugging other \
                  services) writes all forwarded traffic to STDOUT."
)]
pub struct Cli {
    /// Address and port to listen on, addr defaults to 0.0.0.0
    #[arg(short, long, value_name = "[ADDR:]PORT")]
    pub listen: Option<String>,

    /// Remote address to connect to
    #[arg(short, long, value_name = "ADDR:PORT")]
    pub remote: Option<String>,

    /// Certificate(s) for inbound encryption [turns on inbound TLS]
    #[arg(short, long, value_name = "CERTFILE")]
    pub cert: Option<PathBuf>,

    /// Certificate's private key. Defaults to using <CERTFILE>
    #[arg(short, long, value_name = "KEYFILE")]
    pub key: Option<PathBuf>,

    /// File containing valid CAs for outbound TLS. "-" turns off verification
    #[arg(long, value_name = "CERTS", allow_hyphen_values = true)]
    pub ca: Option<String>,

    /// Turns on TLS for the outbound connection
    #[arg(short = 't', long)]
    pub remote_tls: bool,

    /// Verbose mode
    #[arg(short, long)]
    pub verbose: bool,

    /// Dump all traffic to STDOUT
    #[arg(short, long)]
    pub dump: bool,

    /// TOML file with default settings; command-line values take precedence
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,
}

impl Cli {
    /// Parses arguments, accepting the classic single-dash long flags too.
    pub fn try_parse_args<I, T>(args: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString>,
    {
        Self::try_parse_from(rewrite_legacy_flags(args))
    }

    #[must_use]
    pub fn options(&self) -> Options {
        Options {
            listen: self.listen.clone(),
            remote: self.remote.clone(),
            cert: self.cert.clone(),
            key: self.key.clone(),
            ca: self.ca.clone(),
            remote_tls: self.remote_tls,
            verbose: self.verbose,
            dump: self.dump,
        }
    }
}

/// Rewrites `-ca`, `-rt`, `-help` and `-?` into their clap spellings.
///
/// Without this, `-ca` would parse as `-c a`.
pub fn rewrite_legacy_flags<I, T>(args: I) -> Vec<OsString>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString>,
{
    args.into_iter()
        .map(Into::into)
        .map(|arg| {
            let replacement = match arg.to_str() {
                Some("-ca") => Some("--ca".to_string()),
                Some("-rt") => Some("--remote-tls".to_string()),
                Some("-help" | "-?") => Some("--help".to_string()),
                Some(other) => other
                    .strip_prefix("-ca=")
                    .map(|value| format!("--ca={value}")),
                None => None,
            };
            replacement.map_or(arg, OsString::from)
        })
        .collect()
}
