use url::Url;

use crate::error::TransportError;

/// The scheme this transport expects: `mqtt-quic://HOST:PORT`.
pub const SCHEME: &str = "mqtt-quic";

/// Host and port parsed from a `mqtt-quic://` URL, retained on the stream
/// state for reconnect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerAddr {
    pub host: String,
    pub port: u16,
}

/// Parse a `mqtt-quic://HOST:PORT` URL.
///
/// URL parsing itself is an external collaborator's concern (this crate
/// leans on the `url` crate rather than hand-rolling a parser); this
/// function only extracts the host/port pair the rest of the transport
/// needs, the same narrow slice `web-transport-quinn`'s `Client::connect`
/// pulls out of the request URL.
pub fn parse_server_url(raw: &str) -> Result<ServerAddr, TransportError> {
    let url = Url::parse(raw).map_err(|e| TransportError::InvalidUrl(e.to_string()))?;

    if url.scheme() != SCHEME {
        return Err(TransportError::InvalidUrl(format!(
            "expected scheme {SCHEME}, got {}",
            url.scheme()
        )));
    }

    let host = url
        .host_str()
        .ok_or_else(|| TransportError::InvalidUrl("missing host".to_string()))?
        .to_string();

    let port = url
        .port()
        .ok_or_else(|| TransportError::InvalidUrl("missing port".to_string()))?;

    Ok(ServerAddr { host, port })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_host_and_port() {
        let addr = parse_server_url("mqtt-quic://127.0.0.1:14567").unwrap();
        assert_eq!(addr.host, "127.0.0.1");
        assert_eq!(addr.port, 14567);
    }

    #[test]
    fn rejects_wrong_scheme() {
        assert!(parse_server_url("mqtt://127.0.0.1:1883").is_err());
    }

    #[test]
    fn rejects_missing_port() {
        assert!(parse_server_url("mqtt-quic://127.0.0.1").is_err());
    }
}
