// ABOUTME: Configuration for the key forwarder and parsing of dial targets.
// ABOUTME: Parses formats like "host", "host:port" and "[v6addr]:port".

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Lifetime of the key inside the in-memory agent.
pub const AGENT_KEY_LIFETIME: Duration = Duration::from_secs(3600);

/// Whether the agent asks for confirmation before each use of the key.
pub const AGENT_CONFIRM_BEFORE_USE: bool = false;

/// Configuration for a [`KeyForwarder`](super::KeyForwarder).
#[derive(Clone)]
pub struct ForwarderConfig {
    /// Accept any host key without verification (default: true).
    /// Only meant for development and testing.
    pub insecure: bool,
    /// Raw private key material, PEM or OpenSSH encoded.
    pub private_key: Vec<u8>,
    /// Optional path to known_hosts file.
    /// If None, uses the default ~/.ssh/known_hosts.
    pub known_hosts_path: Option<PathBuf>,
    /// How long the forwarded agent keeps the key.
    pub agent_key_lifetime: Duration,
    /// Transport inactivity timeout handed to russh.
    pub inactivity_timeout: Option<Duration>,
}

impl fmt::Debug for ForwarderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForwarderConfig")
            .field("insecure", &self.insecure)
            .field("private_key", &format_args!("<{} bytes>", self.private_key.len()))
            .field("known_hosts_path", &self.known_hosts_path)
            .field("agent_key_lifetime", &self.agent_key_lifetime)
            .field("inactivity_timeout", &self.inactivity_timeout)
            .finish()
    }
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl ForwarderConfig {
    pub fn new(private_key: impl Into<Vec<u8>>) -> Self {
        Self {
            insecure: true,
            private_key: private_key.into(),
            known_hosts_path: None,
            agent_key_lifetime: AGENT_KEY_LIFETIME,
            inactivity_timeout: None,
        }
    }

    pub fn insecure(mut self, insecure: bool) -> Self {
        self.insecure = insecure;
        self
    }

    pub fn known_hosts_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.known_hosts_path = Some(path.into());
        self
    }

    pub fn agent_key_lifetime(mut self, lifetime: Duration) -> Self {
        self.agent_key_lifetime = lifetime;
        self
    }

    pub fn inactivity_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.inactivity_timeout = timeout;
        self
    }
}

/// A parsed `host:port` dial target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub host: String,
    pub port: u16,
}

impl Target {
    pub fn parse(s: &str) -> Result<Self, String> {
        let s = s.trim();
        if s.is_empty() {
            return Err("target address cannot be empty".to_string());
        }

        // Bracketed IPv6: [addr] or [addr]:port
        if let Some(rest) = s.strip_prefix('[') {
            let (host, after) = rest
                .split_once(']')
                .ok_or_else(|| format!("unterminated '[' in {}", s))?;
            let port = match after.strip_prefix(':') {
                Some(port_str) => parse_port(port_str)?,
                None if after.is_empty() => 22,
                None => return Err(format!("unexpected text after ']': {}", after)),
            };
            if host.is_empty() {
                return Err("hostname cannot be empty".to_string());
            }
            return Ok(Target {
                host: host.to_string(),
                port,
            });
        }

        let (host, port) = match s.rsplit_once(':') {
            Some((host, port_str)) => (host, parse_port(port_str)?),
            None => (s, 22),
        };

        if host.is_empty() {
            return Err("hostname cannot be empty".to_string());
        }
        if host.contains(':') {
            return Err(format!("IPv6 addresses must be bracketed: {}", s));
        }

        Ok(Target {
            host: host.to_string(),
            port,
        })
    }
}

fn parse_port(port_str: &str) -> Result<u16, String> {
    port_str
        .parse::<u16>()
        .map_err(|_| format!("invalid port: {}", port_str))
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}
