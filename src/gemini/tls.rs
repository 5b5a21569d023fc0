use std::net::TcpStream;
use std::path::Path;

use hex::ToHex;
use nanoid::nanoid;
use openssl::asn1::Asn1Time;
use openssl::hash::MessageDigest;
use openssl::ssl::{
    SslAcceptor, SslAcceptorBuilder, SslFiletype, SslMethod, SslStream, SslVerifyMode,
};
use openssl::x509::X509StoreContextRef;

use crate::gemini::{Error, Result};

/// Scoped ownership of the server-side TLS configuration.
///
/// Starts out as an acceptor builder that `use_certificate_file` and
/// `use_private_key_file` mutate; the first call to [`acceptor`] checks the
/// key against the certificate and freezes the configuration. OpenSSL
/// library initialization is assumed to have happened already.
///
/// [`acceptor`]: TlsContext::acceptor
pub(crate) struct TlsContext {
    builder: Option<SslAcceptorBuilder>,
    acceptor: Option<SslAcceptor>,
}

impl TlsContext {
    pub fn new() -> Result<TlsContext> {
        let mut builder = SslAcceptor::mozilla_intermediate(SslMethod::tls())?;

        // Request a client certificate but keep it optional. Gemini clients
        // use self-signed certificates as identities, so the callback admits
        // those as long as they verify against their own key and are within
        // their validity window.
        builder.set_verify(SslVerifyMode::PEER);
        builder.set_verify_callback(SslVerifyMode::PEER, verify_client_certificate);

        builder.set_session_id_context(nanoid!().as_bytes())?;
        Ok(TlsContext {
            builder: Some(builder),
            acceptor: None,
        })
    }

    /// Set the TLS certificate chain file (PEM format). Fails with
    /// `BadState` once the configuration has been frozen.
    pub fn use_certificate_file(&mut self, path: &Path) -> Result<()> {
        match self.builder.as_mut() {
            Some(builder) => {
                builder.set_certificate_chain_file(path)?;
                Ok(())
            }
            None => Err(Error::BadState),
        }
    }

    /// Set the TLS private key file (PEM format). Fails with `BadState`
    /// once the configuration has been frozen.
    pub fn use_private_key_file(&mut self, path: &Path) -> Result<()> {
        match self.builder.as_mut() {
            Some(builder) => {
                builder.set_private_key_file(path, SslFiletype::PEM)?;
                Ok(())
            }
            None => Err(Error::BadState),
        }
    }

    /// Freeze the configuration if this is the first call, then return the
    /// acceptor. Fails with `TlsInit` if the certificate and key were not
    /// set or do not match.
    pub fn acceptor(&mut self) -> Result<SslAcceptor> {
        if let Some(acceptor) = &self.acceptor {
            return Ok(acceptor.clone());
        }
        if let Some(builder) = self.builder.as_ref() {
            builder.check_private_key()?;
        }
        match self.builder.take() {
            Some(builder) => {
                let acceptor = builder.build();
                self.acceptor = Some(acceptor.clone());
                Ok(acceptor)
            }
            None => Err(Error::BadState),
        }
    }
}

fn verify_client_certificate(preverify_ok: bool, x509_ctx: &mut X509StoreContextRef) -> bool {
    if preverify_ok {
        return true;
    }

    // Not trusted by a CA; admit it anyway if it is a valid self-signed
    // certificate.
    let cert = match x509_ctx.current_cert() {
        Some(cert) => cert,
        None => return false,
    };
    let is_self_signed = match (cert.issuer_name().to_der(), cert.subject_name().to_der()) {
        (Ok(issuer), Ok(subject)) => issuer == subject,
        _ => return false,
    };
    if !is_self_signed {
        return false;
    }

    let public_key = match cert.public_key() {
        Ok(key) => key,
        Err(_) => return false,
    };
    if !matches!(cert.verify(&public_key), Ok(true)) {
        return false;
    }

    let now = match Asn1Time::days_from_now(0) {
        Ok(time) => time,
        Err(_) => return false,
    };
    *cert.not_before() <= now && *cert.not_after() >= now
}

/// Hex-encoded SHA-256 digest of the certificate the peer presented, if any.
pub(crate) fn peer_certificate_digest(stream: &SslStream<TcpStream>) -> Option<String> {
    let cert = stream.ssl().peer_certificate()?;
    let digest = cert.digest(MessageDigest::sha256()).ok()?;
    Some(digest.encode_hex::<String>())
}
