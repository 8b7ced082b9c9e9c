// Copyright (c) 2023 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use std::fs::File;
use std::io::BufReader;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use rustls_pki_types::{CertificateDer, ServerName, UnixTime};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls;
use tokio_rustls::rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::{DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio_rustls::TlsConnector;

use crate::connect_options::{ConnectOptions, ConnectType, MqttsConnect, TlsType};
use crate::error::{Error, ErrorKind};

/// Byte stream between client and server.
pub enum Stream {
    Mqtt(TcpStream),
    Mqtts(Box<TlsStream<TcpStream>>),
}

impl Stream {
    /// Open the transport described in `options`: resolve the host, connect
    /// the socket and run the TLS handshake when configured.
    ///
    /// # Errors
    ///
    /// Returns error if any of these steps fails.
    pub async fn connect(options: &ConnectOptions) -> Result<Self, Error> {
        let address = (options.host(), options.port());
        let socket = TcpStream::connect(address).await?;
        socket.set_nodelay(true)?;

        match options.connect_type() {
            ConnectType::Mqtt => Ok(Self::Mqtt(socket)),
            ConnectType::Mqtts(mqtts_connect) => Self::connect_tls(socket, mqtts_connect).await,
        }
    }

    async fn connect_tls(socket: TcpStream, mqtts_connect: &MqttsConnect) -> Result<Self, Error> {
        let config = build_tls_config(&mqtts_connect.tls_type)?;
        let connector = TlsConnector::from(config);
        let domain = ServerName::try_from(mqtts_connect.domain.clone()).map_err(|_err| {
            Error::from_string(
                ErrorKind::Transport,
                format!("Invalid server name: {}", mqtts_connect.domain),
            )
        })?;
        let tls_stream = connector.connect(domain, socket).await?;
        Ok(Self::Mqtts(Box::new(tls_stream)))
    }
}

impl AsyncRead for Stream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match &mut *self {
            Self::Mqtt(socket) => Pin::new(socket).poll_read(cx, buf),
            Self::Mqtts(tls_stream) => Pin::new(tls_stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match &mut *self {
            Self::Mqtt(socket) => Pin::new(socket).poll_write(cx, buf),
            Self::Mqtts(tls_stream) => Pin::new(tls_stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match &mut *self {
            Self::Mqtt(socket) => Pin::new(socket).poll_flush(cx),
            Self::Mqtts(tls_stream) => Pin::new(tls_stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match &mut *self {
            Self::Mqtt(socket) => Pin::new(socket).poll_shutdown(cx),
            Self::Mqtts(tls_stream) => Pin::new(tls_stream.as_mut()).poll_shutdown(cx),
        }
    }
}

fn build_tls_config(tls_type: &TlsType) -> Result<Arc<rustls::ClientConfig>, Error> {
    match tls_type {
        TlsType::CASigned => {
            let mut roots = RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            let config = rustls::ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth();
            Ok(Arc::new(config))
        }
        TlsType::SelfSigned { root_ca_pem } => {
            let fd = File::open(root_ca_pem).map_err(|err| {
                Error::from_string(
                    ErrorKind::Transport,
                    format!("Failed to open root ca file {root_ca_pem:?}: {err}"),
                )
            })?;
            let mut reader = BufReader::new(fd);
            let mut roots = RootCertStore::empty();
            for cert in rustls_pemfile::certs(&mut reader) {
                let cert = cert.map_err(|err| {
                    Error::from_string(
                        ErrorKind::Transport,
                        format!("Invalid cert in {root_ca_pem:?}: {err}"),
                    )
                })?;
                roots.add(cert).map_err(|err| {
                    Error::from_string(ErrorKind::Transport, format!("Rejected root cert: {err}"))
                })?;
            }
            let config = rustls::ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth();
            Ok(Arc::new(config))
        }
        TlsType::AllowInvalid => {
            let config = rustls::ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(AcceptAnyCert))
                .with_no_client_auth();
            Ok(Arc::new(config))
        }
    }
}

/// Certificate verifier which accepts any server certificate.
#[derive(Debug)]
struct AcceptAnyCert;

impl ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}
