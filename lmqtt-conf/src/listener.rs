use std::time::Duration;

use serde::Deserialize;

use super::{deserialize_duration_option, Bytesize};

/// Read buffer strategy, `heap` or `direct`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Allocator {
    #[default]
    Heap,
    Direct,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Tls {
    pub cert: String,
    pub key: String,
    #[serde(default)]
    pub client_ca: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Listener {
    #[serde(default = "Listener::name_default")]
    pub name: String,
    #[serde(default = "Listener::ip_default")]
    pub ip: String,
    #[serde(default = "Listener::port_default")]
    pub port: u16,
    //"0s" disables the heartbeat check
    #[serde(default = "Listener::heartbeat_timeout_default", deserialize_with = "deserialize_duration_option")]
    pub heartbeat_timeout: Option<Duration>,
    #[serde(default)]
    pub buffer_allocator: Allocator,
    #[serde(default = "Listener::read_buffer_size_default")]
    pub read_buffer_size: Bytesize,
    #[serde(default = "Listener::max_packet_size_default")]
    pub max_packet_size: Bytesize,
    #[serde(default)]
    pub tls: Option<Tls>,
    #[serde(default)]
    pub debug: bool,
}

impl Default for Listener {
    fn default() -> Self {
        Self {
            name: Self::name_default(),
            ip: Self::ip_default(),
            port: Self::port_default(),
            heartbeat_timeout: Self::heartbeat_timeout_default(),
            buffer_allocator: Allocator::default(),
            read_buffer_size: Self::read_buffer_size_default(),
            max_packet_size: Self::max_packet_size_default(),
            tls: None,
            debug: false,
        }
    }
}

impl Listener {
    fn name_default() -> String {
        "external/tcp".into()
    }
    fn ip_default() -> String {
        "0.0.0.0".into()
    }
    fn port_default() -> u16 {
        1883
    }
    fn heartbeat_timeout_default() -> Option<Duration> {
        Some(Duration::from_secs(120))
    }
    fn read_buffer_size_default() -> Bytesize {
        Bytesize::from("8K")
    }
    fn max_packet_size_default() -> Bytesize {
        Bytesize::from("1M")
    }
}

#[cfg(test)]
mod tests {
    use config::{Config, File, FileFormat};

    use super::*;

    fn parse(toml: &str) -> Listener {
        Config::builder()
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap()
    }

    #[test]
    fn listener_from_toml() {
        let l = parse(
            r#"
            port = 8883
            heartbeat_timeout = "30s"
            buffer_allocator = "direct"
            read_buffer_size = "64K"
            max_packet_size = "256K"

            [tls]
            cert = "/etc/lmqtt/server.crt"
            key = "/etc/lmqtt/server.key"
            "#,
        );
        assert_eq!(l.port, 8883);
        assert_eq!(l.ip, "0.0.0.0");
        assert_eq!(l.heartbeat_timeout, Some(Duration::from_secs(30)));
        assert_eq!(l.buffer_allocator, Allocator::Direct);
        assert_eq!(l.read_buffer_size.as_usize(), 65536);
        assert_eq!(l.max_packet_size.as_u32(), 262144);
        let tls = l.tls.unwrap();
        assert_eq!(tls.key, "/etc/lmqtt/server.key");
        assert!(tls.client_ca.is_none());
    }

    #[test]
    fn zero_heartbeat_disables() {
        assert_eq!(parse(r#"heartbeat_timeout = "0s""#).heartbeat_timeout, None);
        assert_eq!(parse("debug = true").heartbeat_timeout, Some(Duration::from_secs(120)));
    }
}
