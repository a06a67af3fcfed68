//! Broker address parsing and TLS transport selection.

use anyhow::{anyhow, bail, Context, Result};
use rumqttc::Transport;
use std::path::Path;

/// Broker endpoint after scheme parsing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MqttEndpoint {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
}

/// PEM material for the broker connection.
#[derive(Clone, Debug, Default)]
pub struct TlsMaterials {
    /// Trusted CA; the webpki roots when absent.
    pub ca: Option<Vec<u8>>,
    /// (cert, key) for mutual TLS.
    pub client_auth: Option<(Vec<u8>, Vec<u8>)>,
}

fn read_pem(path: &Path, what: &str) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("read TLS {} {}", what, path.display()))
}

impl TlsMaterials {
    pub fn load(
        ca_path: Option<&Path>,
        client_cert_path: Option<&Path>,
        client_key_path: Option<&Path>,
    ) -> Result<Self> {
        let client_auth = match (client_cert_path, client_key_path) {
            (Some(cert), Some(key)) => {
                Some((read_pem(cert, "client cert")?, read_pem(key, "client key")?))
            }
            (None, None) => None,
            (Some(_), None) => bail!("TLS client certificate given without key"),
            (None, Some(_)) => bail!("TLS client key given without certificate"),
        };
        let ca = ca_path.map(|path| read_pem(path, "CA")).transpose()?;
        Ok(Self { ca, client_auth })
    }

    /// Transport for `endpoint`. PEM material on a plain-TCP endpoint and a
    /// client certificate without a CA are both rejected.
    pub fn build_transport(&self, endpoint: &MqttEndpoint) -> Result<Transport> {
        match (endpoint.use_tls, &self.ca, &self.client_auth) {
            (false, None, None) => Ok(Transport::tcp()),
            (false, _, _) => bail!(
                "TLS material given for a plain broker at {}:{}; use mqtts:// or --mqtt-use-tls",
                endpoint.host,
                endpoint.port
            ),
            (true, None, None) => Ok(Transport::tls_with_default_config()),
            (true, None, Some(_)) => {
                bail!("a CA certificate is required with a TLS client certificate")
            }
            (true, Some(ca), auth) => Ok(Transport::tls(ca.clone(), auth.clone(), None)),
        }
    }
}

/// Parse a broker address.
///
/// Supports `host:port`, `mqtt://`, `tcp://` (plain), `mqtts://`, `ssl://`
/// (TLS) and bracketed IPv6 hosts. `tls_override` forces TLS on.
pub fn parse_mqtt_endpoint(addr: &str, tls_override: bool) -> Result<MqttEndpoint> {
    let mut use_tls = tls_override;
    let mut remainder = addr.trim();

    if let Some((scheme, rest)) = remainder.split_once("://") {
        match scheme {
            "mqtt" | "tcp" => {}
            "mqtts" | "ssl" => use_tls = true,
            other => return Err(anyhow!("unsupported MQTT scheme: {}", other)),
        }
        remainder = rest;
    }

    let (host, port) = split_host_port(remainder)?;
    Ok(MqttEndpoint {
        host,
        port,
        use_tls,
    })
}

fn split_host_port(addr: &str) -> Result<(String, u16)> {
    if let Some(rest) = addr.strip_prefix('[') {
        let (host, rest) = rest
            .split_once(']')
            .ok_or_else(|| anyhow!("invalid MQTT address: {}", addr))?;
        let port = rest
            .strip_prefix(':')
            .ok_or_else(|| anyhow!("missing MQTT port in {}", addr))?;
        let port: u16 = port
            .parse()
            .with_context(|| format!("invalid MQTT port in {}", addr))?;
        return Ok((host.to_string(), port));
    }

    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("missing MQTT port in {}", addr))?;
    if host.is_empty() {
        return Err(anyhow!("missing MQTT host in {}", addr));
    }
    let port: u16 = port
        .parse()
        .with_context(|| format!("invalid MQTT port in {}", addr))?;
    Ok((host.to_string(), port))
}

/// Reject non-loopback brokers unless remote access was requested.
pub fn validate_loopback_addr(endpoint: &MqttEndpoint, original: &str) -> Result<()> {
    let host = endpoint.host.as_str();
    if host == "localhost" {
        return Ok(());
    }
    if let Ok(ip) = host.parse::<std::net::IpAddr>() {
        if ip.is_loopback() {
            return Ok(());
        }
    }
    Err(anyhow!(
        "MQTT broker must be loopback: {} (use --allow-remote-mqtt for a LAN broker)",
        original
    ))
}
