use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use quinn::crypto::rustls::QuicClientConfig;
use rustls::client::{ClientSessionMemoryCache, ClientSessionStore};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use tracing::{info, warn};

use crate::config::Config;
use crate::error::TransportError;
use crate::pipe::Pipe;
use crate::stream::StreamHandle;
use crate::url::{parse_server_url, ServerAddr};

/// ALPN token the server must negotiate for this transport to proceed,
/// mirroring the fixed protocol-id byte string msquic's configuration
/// pinned for its MQTT-over-QUIC listener.
const ALPN: &[u8] = b"mqtt";

/// Wraps rustls's stock session cache to additionally expose whether a
/// TLS 1.3 session ticket has ever been captured, satisfying the
/// resumption-ticket-received signal this crate's callers observe without
/// reimplementing ticket storage or parsing: correctness of the ticket
/// value itself is entirely delegated to `ClientSessionMemoryCache`.
#[derive(Debug)]
pub(crate) struct TicketCache {
    inner: Arc<ClientSessionMemoryCache>,
    captured: AtomicBool,
}

impl TicketCache {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: ClientSessionMemoryCache::new(32),
            captured: AtomicBool::new(false),
        })
    }

    /// Whether a resumable session has ever been cached. Used to decide
    /// whether an idle-timeout disconnect is worth retrying as a 0-RTT
    /// reconnect versus finalizing the stream as closed.
    pub(crate) fn has_ticket(&self) -> bool {
        self.captured.load(Ordering::SeqCst)
    }

    /// Records that a ticket was captured. Split out from
    /// `insert_tls13_ticket` so the capture signal itself is directly
    /// testable without constructing a real `Tls13ClientSessionValue`.
    fn note_ticket_received(&self) {
        self.captured.store(true, Ordering::SeqCst);
    }
}

impl ClientSessionStore for TicketCache {
    fn set_kx_hint(&self, server_name: ServerName<'static>, group: rustls::NamedGroup) {
        self.inner.set_kx_hint(server_name, group)
    }

    fn kx_hint(&self, server_name: &ServerName<'static>) -> Option<rustls::NamedGroup> {
        self.inner.kx_hint(server_name)
    }

    fn set_tls12_session(
        &self,
        server_name: ServerName<'static>,
        value: rustls::client::Tls12ClientSessionValue,
    ) {
        self.inner.set_tls12_session(server_name, value)
    }

    fn tls12_session(
        &self,
        server_name: &ServerName<'static>,
    ) -> Option<rustls::client::Tls12ClientSessionValue> {
        self.inner.tls12_session(server_name)
    }

    fn remove_tls12_session(&self, server_name: &ServerName<'static>) {
        self.inner.remove_tls12_session(server_name)
    }

    fn insert_tls13_ticket(
        &self,
        server_name: ServerName<'static>,
        value: rustls::client::Tls13ClientSessionValue,
    ) {
        self.note_ticket_received();
        self.inner.insert_tls13_ticket(server_name, value)
    }

    fn take_tls13_ticket(
        &self,
        server_name: &ServerName<'static>,
    ) -> Option<rustls::client::Tls13ClientSessionValue> {
        self.inner.take_tls13_ticket(server_name)
    }
}

/// Accepts any server certificate. An explicit opt-in mode for local
/// development and the demo binary, never the default once `insecure` is
/// turned off in `Config`.
#[derive(Debug)]
struct NoCertificateVerification(Arc<rustls::crypto::CryptoProvider>);

impl rustls::client::danger::ServerCertVerifier for NoCertificateVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp: &[u8],
        _now: UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

/// The Connection Manager: owns the QUIC endpoint, the TLS configuration,
/// and the resumption ticket cache, and hands out streams that survive an
/// idle-timeout reconnect when a ticket is available.
pub struct Transport {
    endpoint: quinn::Endpoint,
    client_config: quinn::ClientConfig,
    tickets: Arc<TicketCache>,
    cfg: Config,
}

/// The crypto provider selected by this crate's `aws-lc-rs`/`ring` features,
/// mirroring `web-transport-quinn`'s own `crypto::default_provider` switch.
#[cfg(feature = "aws-lc-rs")]
fn default_provider() -> rustls::crypto::CryptoProvider {
    rustls::crypto::aws_lc_rs::default_provider()
}

#[cfg(all(feature = "ring", not(feature = "aws-lc-rs")))]
fn default_provider() -> rustls::crypto::CryptoProvider {
    rustls::crypto::ring::default_provider()
}

impl Transport {
    /// Build a transport. Binds an ephemeral local UDP socket; no network
    /// I/O happens until `connect`.
    pub fn new(cfg: Config) -> Result<Self, TransportError> {
        let provider = Arc::new(default_provider());
        let tickets = TicketCache::new();

        let mut tls_config = if cfg.insecure {
            rustls::ClientConfig::builder_with_provider(provider.clone())
                .with_protocol_versions(&[&rustls::version::TLS13])
                .map_err(|e| TransportError::QuicFailure(e.to_string()))?
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(NoCertificateVerification(provider)))
                .with_no_client_auth()
        } else {
            let mut roots = rustls::RootCertStore::empty();
            let native = rustls_native_certs::load_native_certs();
            for err in native.errors {
                warn!(?err, "failed to load a native root certificate");
            }
            for cert in native.certs {
                if let Err(err) = roots.add(cert) {
                    warn!(?err, "failed to add a native root certificate");
                }
            }
            rustls::ClientConfig::builder_with_provider(provider)
                .with_protocol_versions(&[&rustls::version::TLS13])
                .map_err(|e| TransportError::QuicFailure(e.to_string()))?
                .with_root_certificates(roots)
                .with_no_client_auth()
        };

        tls_config.alpn_protocols = vec![ALPN.to_vec()];
        tls_config.resumption = rustls::client::Resumption::store(tickets.clone());
        tls_config.enable_early_data = true;

        let quic_crypto = QuicClientConfig::try_from(tls_config)
            .map_err(|e| TransportError::QuicFailure(e.to_string()))?;
        let mut client_config = quinn::ClientConfig::new(Arc::new(quic_crypto));

        let mut transport_config = quinn::TransportConfig::default();
        transport_config.max_idle_timeout(Some(
            Duration::from_millis(cfg.idle_timeout_ms)
                .try_into()
                .map_err(|_| TransportError::QuicFailure("idle timeout out of range".into()))?,
        ));
        client_config.transport_config(Arc::new(transport_config));

        let local_addr: SocketAddr = "0.0.0.0:0".parse().expect("valid wildcard address");
        let endpoint = quinn::Endpoint::client(local_addr)
            .map_err(|e| TransportError::QuicFailure(e.to_string()))?;

        Ok(Self {
            endpoint,
            client_config,
            tickets,
            cfg,
        })
    }

    /// Connect to `url`, open the single bidirectional stream this
    /// transport multiplexes MQTT traffic over, and hand it to `pipe`.
    /// Spawns a watcher task that reconnects using the cached resumption
    /// ticket, if any, when the QUIC connection ends; if no ticket is
    /// cached the stream is finalized instead.
    pub async fn connect(
        &self,
        url: &str,
        pipe: Arc<dyn Pipe>,
    ) -> Result<StreamHandle, TransportError> {
        let addr = parse_server_url(url)?;
        let connection = self.dial(&addr).await?;
        let (send, recv) = connection
            .open_bi()
            .await
            .map_err(TransportError::from)?;

        let stream = StreamHandle::new(self.cfg.clone());
        stream.set_pipe(pipe.clone());
        pipe.init(stream.clone());
        let pumps = stream.spawn_pumps(send, recv);
        pipe.start();

        let watcher_stream = stream.clone();
        let watcher_pipe = pipe.clone();
        let watcher_addr = addr;
        let tickets = self.tickets.clone();
        let endpoint = self.endpoint.clone();
        let client_config = self.client_config.clone();

        tokio::spawn(async move {
            let mut connection = connection;
            let mut pumps = pumps;

            loop {
                let reason = connection.closed().await;
                info!(%reason, "quic connection closed");
                // Abort rather than drop: a dropped JoinHandle detaches the
                // task instead of stopping it, and a lingering pump could
                // observe the dead connection and close the stream itself
                // before the reconnect below gets a chance to rebind it.
                pumps.abort();

                if watcher_stream.is_closed().await {
                    // The stream already finalized itself (a framing error
                    // or an explicit close), nothing left to reconnect for.
                    return;
                }

                if !tickets.has_ticket() {
                    watcher_stream
                        .close(TransportError::QuicFailure(reason.to_string()))
                        .await;
                    watcher_pipe.closed(TransportError::QuicFailure(reason.to_string()));
                    return;
                }

                match reconnect(&endpoint, &client_config, &watcher_addr).await {
                    Ok((new_connection, send, recv)) => {
                        info!("reconnected using cached resumption ticket");
                        // The old connection's framer may be mid-parse (a
                        // Remaining Length continuation byte seen but never
                        // completed) with no way for the rest of that
                        // packet to ever arrive. Reset before the new pumps
                        // start so that stale scratch isn't prepended to
                        // the new stream's bytes.
                        watcher_stream.reset_for_reconnect().await;
                        pumps = watcher_stream.spawn_pumps(send, recv);
                        connection = new_connection;
                    }
                    Err(err) => {
                        warn!(%err, "reconnect after idle timeout failed");
                        watcher_stream.close(err.clone()).await;
                        watcher_pipe.closed(err);
                        return;
                    }
                }
            }
        });

        Ok(stream)
    }

    async fn dial(&self, addr: &ServerAddr) -> Result<quinn::Connection, TransportError> {
        let socket_addr = resolve(&addr.host, addr.port).await?;
        let connecting = self
            .endpoint
            .connect_with(self.client_config.clone(), socket_addr, &addr.host)
            .map_err(TransportError::from)?;
        connecting.await.map_err(TransportError::from)
    }
}

async fn reconnect(
    endpoint: &quinn::Endpoint,
    client_config: &quinn::ClientConfig,
    addr: &ServerAddr,
) -> Result<(quinn::Connection, quinn::SendStream, quinn::RecvStream), TransportError> {
    let socket_addr = resolve(&addr.host, addr.port).await?;
    let connecting = endpoint
        .connect_with(client_config.clone(), socket_addr, &addr.host)
        .map_err(TransportError::from)?;
    let connection = connecting.await.map_err(TransportError::from)?;
    let (send, recv) = connection.open_bi().await.map_err(TransportError::from)?;
    Ok((connection, send, recv))
}

async fn resolve(host: &str, port: u16) -> Result<SocketAddr, TransportError> {
    if let Ok(addr) = format!("{host}:{port}").parse::<SocketAddr>() {
        return Ok(addr);
    }
    tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| TransportError::QuicFailure(e.to_string()))?
        .next()
        .ok_or_else(|| TransportError::InvalidUrl(format!("could not resolve host {host}")))
}
