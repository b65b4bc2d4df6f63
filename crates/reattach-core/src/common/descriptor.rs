//! Connection descriptors and their wire encodings.
//!
//! A [`ConnectionDescriptor`] records how to reach a running plugin server. It
//! travels in two encodings:
//!
//! - As a [`ReattachConfig`] entry inside the JSON map published through
//!   [`REATTACH_PROVIDERS_ENV`](crate::types::REATTACH_PROVIDERS_ENV), for
//!   servers running inside the test process.
//! - As a single handshake line printed on stdout by subprocess plugins:
//!   `CORE-PROTOCOL-VERSION|APP-PROTOCOL-VERSION|NETWORK|ADDRESS|PROTOCOL`.
//!
//! A descriptor is only meaningful while its server is running. Once the
//! server has been cancelled it must not be published again.

use crate::{
    Error, Result,
    types::{CORE_PROTOCOL_VERSION, GRPC_PROTOCOL, PROTOCOL_VERSION, PROVIDER_PREFIX},
};
use core::{fmt, str::FromStr};
use hyper_util::rt::TokioIo;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tonic::transport::{Channel, Endpoint, Uri};

/// Transport family a plugin server listens on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Network {
    Unix,
    Tcp,
}

impl Network {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Unix => "unix",
            Self::Tcp => "tcp",
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Network {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "unix" => Ok(Self::Unix),
            "tcp" => Ok(Self::Tcp),
            other => Err(Error::UnsupportedNetwork(other.to_string())),
        }
    }
}

/// How to reach a running plugin server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionDescriptor {
    /// Wire protocol, always [`GRPC_PROTOCOL`] for servers started here.
    pub protocol: String,
    pub network: Network,
    /// Socket path for [`Network::Unix`], `host:port` for [`Network::Tcp`].
    pub address: String,
    /// Process hosting the server. For in-process servers this is the test
    /// process itself.
    pub pid: u32,
    /// `true` when the server is attached to a test session rather than
    /// launched by the host.
    pub test: bool,
}

impl ConnectionDescriptor {
    /// Describes a gRPC server hosted by the current process.
    pub fn local(network: Network, address: impl Into<String>, test: bool) -> Self {
        Self {
            protocol: GRPC_PROTOCOL.to_string(),
            network,
            address: address.into(),
            pid: std::process::id(),
            test,
        }
    }

    /// Formats the line a subprocess plugin prints on stdout once it is
    /// listening.
    pub fn handshake_line(&self) -> String {
        format!(
            "{CORE_PROTOCOL_VERSION}|{PROTOCOL_VERSION}|{}|{}|{}",
            self.network, self.address, self.protocol
        )
    }

    /// Parses a handshake line printed by the subprocess `pid`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidHandshake`] if the line has too few fields,
    /// speaks another core or app protocol version, or offers anything other
    /// than gRPC. Returns [`Error::UnsupportedNetwork`] for unknown networks.
    pub fn parse_handshake_line(line: &str, pid: u32) -> Result<Self> {
        let invalid = |reason: &str| Error::InvalidHandshake {
            line: line.to_string(),
            reason: reason.to_string(),
        };

        let parts: Vec<&str> = line.trim().split('|').collect();
        // A sixth field (server certificate) may follow; we never use TLS.
        if parts.len() < 5 {
            return Err(invalid("expected at least 5 fields"));
        }

        if parts[0].parse::<u32>().ok() != Some(CORE_PROTOCOL_VERSION) {
            return Err(invalid("unsupported core protocol version"));
        }
        if parts[1].parse::<u32>().ok() != Some(PROTOCOL_VERSION) {
            return Err(invalid("unsupported app protocol version"));
        }
        let network = parts[2].parse()?;
        if parts[4] != GRPC_PROTOCOL {
            return Err(invalid("only grpc plugins are supported"));
        }

        Ok(Self {
            protocol: parts[4].to_string(),
            network,
            address: parts[3].to_string(),
            pid,
            test: false,
        })
    }

    /// Dials the described server.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transport`] if the endpoint is malformed or the
    /// connection cannot be established.
    pub async fn connect(&self) -> Result<Channel> {
        match self.network {
            Network::Tcp => {
                let channel = Endpoint::from_shared(format!("http://{}", self.address))?
                    .connect()
                    .await?;
                Ok(channel)
            }
            #[cfg(unix)]
            Network::Unix => {
                let path = self.address.clone();
                // The URI is ignored by the connector but must still parse.
                let channel = Endpoint::from_static("http://[::]:50051")
                    .connect_with_connector(tower::service_fn(move |_: Uri| {
                        let path = path.clone();
                        async move {
                            let stream = tokio::net::UnixStream::connect(path).await?;
                            Ok::<_, std::io::Error>(TokioIo::new(stream))
                        }
                    }))
                    .await?;
                Ok(channel)
            }
            #[cfg(not(unix))]
            Network::Unix => Err(Error::UnsupportedNetwork(self.network.to_string())),
        }
    }
}

/// Address half of a [`ReattachConfig`], shaped like Go's `net.Addr`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ReattachAddr {
    pub network: String,
    pub string: String,
}

/// One entry of the reattach map, as the host expects to read it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ReattachConfig {
    pub protocol: String,
    pub addr: ReattachAddr,
    pub pid: u32,
    pub test: bool,
}

impl From<&ConnectionDescriptor> for ReattachConfig {
    fn from(descriptor: &ConnectionDescriptor) -> Self {
        Self {
            protocol: descriptor.protocol.clone(),
            addr: ReattachAddr {
                network: descriptor.network.to_string(),
                string: descriptor.address.clone(),
            },
            pid: descriptor.pid,
            test: descriptor.test,
        }
    }
}

impl TryFrom<ReattachConfig> for ConnectionDescriptor {
    type Error = Error;

    fn try_from(config: ReattachConfig) -> Result<Self> {
        Ok(Self {
            protocol: config.protocol,
            network: config.addr.network.parse()?,
            address: config.addr.string,
            pid: config.pid,
            test: config.test,
        })
    }
}

/// The full value of the reattach environment variable: registry key to
/// reattach config.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReattachProviders(pub BTreeMap<String, ReattachConfig>);

impl ReattachProviders {
    /// A map holding exactly one provider.
    pub fn single(key: impl Into<String>, descriptor: &ConnectionDescriptor) -> Self {
        Self(BTreeMap::from([(key.into(), descriptor.into())]))
    }

    pub fn get(&self, key: &str) -> Option<&ReattachConfig> {
        self.0.get(key)
    }

    /// Encodes the map as the JSON value of the reattach variable.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Serialization`] if encoding fails.
    pub fn to_env_value(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decodes a reattach variable value.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Serialization`] if `value` is not a valid reattach map.
    pub fn from_env_value(value: &str) -> Result<Self> {
        Ok(serde_json::from_str(value)?)
    }
}

/// Builds the namespace-qualified key a host uses to look up a provider.
///
/// Plugin names carry the [`PROVIDER_PREFIX`] (`terraform-provider-foo`), but
/// the host addresses providers by short name, so `foo` under `namespace`
/// becomes `namespace/foo`.
pub fn registry_key(plugin_name: &str, namespace: &str) -> String {
    let name = plugin_name
        .strip_prefix(PROVIDER_PREFIX)
        .unwrap_or(plugin_name);
    format!("{namespace}/{name}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DEFAULT_NAMESPACE;

    fn unix_descriptor() -> ConnectionDescriptor {
        ConnectionDescriptor {
            protocol: "5".to_string(),
            network: Network::Unix,
            address: "/tmp/x".to_string(),
            pid: 1234,
            test: true,
        }
    }

    #[test]
    fn registry_key_strips_provider_prefix() {
        for name in ["foo", "aws", "my-cloud", "provider-x"] {
            let plugin_name = format!("{PROVIDER_PREFIX}{name}");
            assert_eq!(
                registry_key(&plugin_name, DEFAULT_NAMESPACE),
                format!("hashicorp/{name}")
            );
        }
    }

    #[test]
    fn registry_key_keeps_unprefixed_names() {
        assert_eq!(registry_key("foo", "acme"), "acme/foo");
    }

    #[test]
    fn reattach_value_uses_host_field_names() {
        let value = ReattachProviders::single("hashicorp/foo", &unix_descriptor())
            .to_env_value()
            .unwrap();
        let json: serde_json::Value = serde_json::from_str(&value).unwrap();
        let entry = &json["hashicorp/foo"];

        assert_eq!(entry["Protocol"], "5");
        assert_eq!(entry["Addr"]["Network"], "unix");
        assert_eq!(entry["Addr"]["String"], "/tmp/x");
        assert_eq!(entry["Pid"], 1234);
        assert_eq!(entry["Test"], true);
    }

    #[test]
    fn reattach_value_parses_back_into_descriptor() {
        let descriptor = ConnectionDescriptor {
            protocol: GRPC_PROTOCOL.to_string(),
            network: Network::Tcp,
            address: "127.0.0.1:41234".to_string(),
            pid: 77,
            test: false,
        };
        let value = ReattachProviders::single("hashicorp/foo", &descriptor)
            .to_env_value()
            .unwrap();

        let parsed = ReattachProviders::from_env_value(&value).unwrap();
        let config = parsed.get("hashicorp/foo").cloned().unwrap();
        assert_eq!(ConnectionDescriptor::try_from(config).unwrap(), descriptor);
    }

    #[test]
    fn reattach_value_rejects_unknown_network() {
        let value = r#"{"hashicorp/foo":{"Protocol":"grpc","Addr":{"Network":"pipe","String":"x"},"Pid":1,"Test":true}}"#;
        let parsed = ReattachProviders::from_env_value(value).unwrap();
        let config = parsed.get("hashicorp/foo").cloned().unwrap();

        assert!(matches!(
            ConnectionDescriptor::try_from(config),
            Err(Error::UnsupportedNetwork(n)) if n == "pipe"
        ));
    }

    #[test]
    fn malformed_reattach_value_is_a_serialization_error() {
        assert!(matches!(
            ReattachProviders::from_env_value("{not json"),
            Err(Error::Serialization { .. })
        ));
    }

    #[test]
    fn handshake_line_round_trips() {
        let descriptor = ConnectionDescriptor::local(Network::Unix, "/tmp/plugin.sock", false);
        let line = descriptor.handshake_line();
        assert_eq!(line, "1|5|unix|/tmp/plugin.sock|grpc");

        let parsed = ConnectionDescriptor::parse_handshake_line(&line, descriptor.pid).unwrap();
        assert_eq!(parsed, descriptor);
    }

    #[test]
    fn handshake_line_tolerates_trailing_cert_and_newline() {
        let parsed =
            ConnectionDescriptor::parse_handshake_line("1|5|tcp|127.0.0.1:1234|grpc|\n", 9)
                .unwrap();
        assert_eq!(parsed.network, Network::Tcp);
        assert_eq!(parsed.address, "127.0.0.1:1234");
        assert_eq!(parsed.pid, 9);
        assert!(!parsed.test);
    }

    #[test]
    fn handshake_line_rejects_bad_input() {
        for line in [
            "1|5|unix|/tmp/x",
            "2|5|unix|/tmp/x|grpc",
            "1|4|unix|/tmp/x|grpc",
            "1|5|unix|/tmp/x|netrpc",
        ] {
            assert!(
                matches!(
                    ConnectionDescriptor::parse_handshake_line(line, 1),
                    Err(Error::InvalidHandshake { .. })
                ),
                "{line} should be rejected"
            );
        }

        assert!(matches!(
            ConnectionDescriptor::parse_handshake_line("1|5|pipe|x|grpc", 1),
            Err(Error::UnsupportedNetwork(_))
        ));
    }
}
