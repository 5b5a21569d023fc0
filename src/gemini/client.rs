use std::net::SocketAddr;

use crate::gemini::{Error, Result};

/// Information about a connected client, handed to the request handler.
///
/// Created by the server when a connection is accepted and dropped when the
/// connection finishes.
pub struct Client {
    socket_address: Option<SocketAddr>,
    certificate: Option<Vec<u8>>,
    certificate_verified: bool,
}

impl Client {
    pub(crate) fn new(
        socket_address: Option<SocketAddr>,
        certificate: Option<Vec<u8>>,
        certificate_verified: bool,
    ) -> Client {
        Client {
            socket_address,
            certificate,
            certificate_verified,
        }
    }

    /// The IP address of the client in string form.
    ///
    /// Returns [`Error::BadState`] if the connection carries no address.
    pub fn ip_address(&self) -> Result<String> {
        match &self.socket_address {
            Some(address) => Ok(address.ip().to_string()),
            None => Err(Error::BadState),
        }
    }

    /// DER bytes of the certificate the client presented, if any.
    pub fn certificate(&self) -> Option<&[u8]> {
        self.certificate.as_deref()
    }

    /// Whether the presented certificate passed TLS verification.
    pub fn certificate_verified(&self) -> bool {
        self.certificate_verified
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use super::Client;
    use crate::gemini::Error;

    #[test]
    fn formats_ip_address() {
        let address: SocketAddr = "127.0.0.1:1965".parse().unwrap();
        let client = Client::new(Some(address), None, false);
        assert_eq!(client.ip_address().unwrap(), "127.0.0.1");

        let address: SocketAddr = "[::1]:1965".parse().unwrap();
        let client = Client::new(Some(address), None, false);
        assert_eq!(client.ip_address().unwrap(), "::1");
    }

    #[test]
    fn missing_address_is_an_error() {
        let client = Client::new(None, None, false);
        assert!(matches!(client.ip_address(), Err(Error::BadState)));
    }

    #[test]
    fn exposes_certificate_bytes() {
        let client = Client::new(None, Some(vec![0x30, 0x82]), true);
        assert_eq!(client.certificate(), Some(&[0x30, 0x82][..]));
        assert!(client.certificate_verified());
    }
}
