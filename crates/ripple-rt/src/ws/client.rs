//! Initiator side: connect to a `ws://` or `wss://` URL.

use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};
use url::Url;

use super::connection::{Connection, ConnectionOptions, Role};
use super::handler::Handler;
use crate::error::{WsError, WsResult};
use crate::transport::{tcp, tls};

/// A parsed WebSocket URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WsUrl {
    pub secure: bool,
    pub host: String,
    pub port: u16,
    /// Path plus query, always starting with `/`.
    pub resource: String,
}

impl WsUrl {
    pub fn parse(input: &str) -> WsResult<WsUrl> {
        let url = Url::parse(input).map_err(|e| WsError::InvalidUrl(format!("{}: {}", input, e)))?;
        let secure = match url.scheme() {
            "ws" => false,
            "wss" => true,
            other => return Err(WsError::InvalidUrl(format!("unsupported scheme {:?}", other))),
        };
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| WsError::InvalidUrl(format!("{}: missing host", input)))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = url.port().unwrap_or(if secure { 443 } else { 80 });

        let mut resource = url.path().to_string();
        if resource.is_empty() {
            resource.push('/');
        }
        if let Some(query) = url.query() {
            resource.push('?');
            resource.push_str(query);
        }

        Ok(WsUrl {
            secure,
            host,
            port,
            resource,
        })
    }

    fn default_port(&self) -> u16 {
        if self.secure {
            443
        } else {
            80
        }
    }

    /// Value for the `Host` header: the port is included only when it is
    /// not the scheme default.
    pub fn host_header(&self) -> String {
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        if self.port == self.default_port() {
            host
        } else {
            format!("{}:{}", host, self.port)
        }
    }
}

/// Client connection settings.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// `None` uses the operating system's connect timeout.
    pub connect_timeout: Option<Duration>,
    pub connection: ConnectionOptions,
    /// Overrides the URL's path and query in the upgrade request.
    pub path: Option<String>,
    /// TLS settings for `wss://`; `None` trusts the webpki root set.
    pub tls_config: Option<Arc<rustls::ClientConfig>>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        ClientOptions {
            connect_timeout: Some(Duration::from_secs(10)),
            connection: ConnectionOptions::default(),
            path: None,
            tls_config: None,
        }
    }
}

/// Open a connection to `url` and complete the opening handshake.
///
/// The returned connection is `Open` and `on_connect` has fired. The caller
/// starts its receive loop with [`Connection::spawn`] or [`Connection::run`].
pub fn connect(
    url: &str,
    handler: impl Handler,
    options: ClientOptions,
) -> WsResult<Arc<Connection>> {
    let target = WsUrl::parse(url)?;
    let stream = open_tcp(&target, options.connect_timeout)?;

    let parts = if target.secure {
        let config = options.tls_config.clone().unwrap_or_else(tls::default_client_config);
        tls::connect(stream, &target.host, config)?
    } else {
        tcp::split(stream)?
    };

    let path = options.path.clone().unwrap_or_else(|| target.resource.clone());
    let conn = Connection::new(Role::Initiator, parts, path, Arc::new(handler), options.connection);
    conn.handshake(&target.host_header())?;
    info!(conn_id = %conn.id(), url, "connected");
    Ok(conn)
}

fn open_tcp(target: &WsUrl, timeout: Option<Duration>) -> WsResult<TcpStream> {
    let addrs: Vec<_> = (target.host.as_str(), target.port).to_socket_addrs()?.collect();
    let Some(timeout) = timeout else {
        return Ok(TcpStream::connect(&addrs[..])?);
    };

    let mut last_err = None;
    for addr in &addrs {
        match TcpStream::connect_timeout(addr, timeout) {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                debug!(%addr, error = %e, "connect attempt failed");
                last_err = Some(e);
            }
        }
    }
    Err(match last_err {
        Some(e) => e.into(),
        None => WsError::InvalidUrl(format!("{}: host resolved to no addresses", target.host)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ws::handler::NoopHandler;

    #[test]
    fn test_parse_plain_url() {
        let url = WsUrl::parse("ws://example.com/chat?room=1").unwrap();
        assert!(!url.secure);
        assert_eq!(url.host, "example.com");
        assert_eq!(url.port, 80);
        assert_eq!(url.resource, "/chat?room=1");
        assert_eq!(url.host_header(), "example.com");
    }

    #[test]
    fn test_parse_secure_url_defaults() {
        let url = WsUrl::parse("wss://example.com").unwrap();
        assert!(url.secure);
        assert_eq!(url.port, 443);
        assert_eq!(url.resource, "/");
    }

    #[test]
    fn test_parse_explicit_port() {
        let url = WsUrl::parse("ws://127.0.0.1:9001/").unwrap();
        assert_eq!(url.port, 9001);
        assert_eq!(url.host_header(), "127.0.0.1:9001");

        let url = WsUrl::parse("ws://[::1]:9001/x").unwrap();
        assert_eq!(url.host, "::1");
        assert_eq!(url.host_header(), "[::1]:9001");
    }

    #[test]
    fn test_parse_rejects_other_schemes() {
        assert!(matches!(WsUrl::parse("http://example.com"), Err(WsError::InvalidUrl(_))));
        assert!(matches!(WsUrl::parse("not a url"), Err(WsError::InvalidUrl(_))));
    }

    #[test]
    fn test_connect_refused_is_transport_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let url = format!("ws://{}/", addr);
        let err = connect(&url, NoopHandler, ClientOptions::default()).unwrap_err();
        assert!(err.is_transport());
    }
}
