use crate::error::Error;

#[cfg(all(not(feature = "tls-rustls"), not(feature = "tls-native")))]
compile_error!("courier requires one TLS backend feature: enable `tls-rustls` or `tls-native`");

pub(crate) const fn tls_backend_name() -> &'static str {
    #[cfg(feature = "tls-rustls")]
    {
        return "tls-rustls";
    }
    #[allow(unreachable_code)]
    "tls-native"
}

/// PEM-encoded certificate material supplied by the caller and handed
/// opaquely to the transport. The core never parses certificate bytes
/// itself; the transport library does.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TlsMaterial {
    cert_pem: Option<Vec<u8>>,
    key_pem: Option<Vec<u8>>,
    ca_pem: Option<Vec<u8>>,
}

impl TlsMaterial {
    /// Trust-only material: server certificates are verified against the
    /// given CA bundle instead of the platform roots.
    pub fn ca_only(ca_pem: impl Into<Vec<u8>>) -> Self {
        Self {
            cert_pem: None,
            key_pem: None,
            ca_pem: Some(ca_pem.into()),
        }
    }

    /// Mutual-TLS material: client certificate chain plus private key, with
    /// an optional CA bundle for server verification.
    pub fn mutual(
        cert_pem: impl Into<Vec<u8>>,
        key_pem: impl Into<Vec<u8>>,
        ca_pem: Option<Vec<u8>>,
    ) -> Self {
        Self {
            cert_pem: Some(cert_pem.into()),
            key_pem: Some(key_pem.into()),
            ca_pem,
        }
    }

    /// Cache key for transport agents built from this material.
    pub(crate) fn fingerprint(&self) -> Vec<u8> {
        let mut fingerprint = Vec::new();
        for part in [&self.cert_pem, &self.key_pem, &self.ca_pem] {
            match part {
                Some(bytes) => {
                    fingerprint.extend_from_slice(&(bytes.len() as u64).to_le_bytes());
                    fingerprint.extend_from_slice(bytes);
                }
                None => fingerprint.push(0),
            }
        }
        fingerprint
    }

    pub(crate) fn build_tls_config(&self) -> Result<ureq::tls::TlsConfig, Error> {
        let provider = {
            #[cfg(feature = "tls-rustls")]
            {
                ureq::tls::TlsProvider::Rustls
            }
            #[cfg(all(not(feature = "tls-rustls"), feature = "tls-native"))]
            {
                ureq::tls::TlsProvider::NativeTls
            }
        };
        let mut builder = ureq::tls::TlsConfig::builder().provider(provider);

        if let Some(ca_pem) = &self.ca_pem {
            let roots = parse_pem_certificates(ca_pem, "CA bundle")?;
            builder = builder.root_certs(ureq::tls::RootCerts::new_with_certs(&roots));
        }

        match (&self.cert_pem, &self.key_pem) {
            (Some(cert_pem), Some(key_pem)) => {
                let cert_chain = parse_pem_certificates(cert_pem, "client certificate chain")?;
                let private_key = ureq::tls::PrivateKey::from_pem(key_pem).map_err(|source| {
                    tls_config_error(format!("failed to parse client private key PEM: {source}"))
                })?;
                let client_cert = ureq::tls::ClientCert::new_with_certs(&cert_chain, private_key);
                builder = builder.client_cert(Some(client_cert));
            }
            (None, None) => {}
            _ => {
                return Err(tls_config_error(
                    "client certificate and private key must be supplied together",
                ));
            }
        }

        Ok(builder.build())
    }
}

fn parse_pem_certificates(
    pem_bundle: &[u8],
    context: &str,
) -> Result<Vec<ureq::tls::Certificate<'static>>, Error> {
    let mut certificates = Vec::new();
    for item in ureq::tls::parse_pem(pem_bundle) {
        match item.map_err(|source| {
            tls_config_error(format!("failed to parse PEM {context}: {source}"))
        })? {
            ureq::tls::PemItem::Certificate(certificate) => certificates.push(certificate),
            _ => {}
        }
    }
    if certificates.is_empty() {
        return Err(tls_config_error(format!(
            "no certificate blocks found in PEM {context}"
        )));
    }
    Ok(certificates)
}

pub(crate) fn tls_config_error(message: impl Into<String>) -> Error {
    Error::TlsConfig {
        backend: tls_backend_name(),
        message: message.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    #[test]
    fn build_rejects_a_certificate_without_a_private_key() {
        let material = TlsMaterial {
            cert_pem: Some(b"-----BEGIN CERTIFICATE-----".to_vec()),
            key_pem: None,
            ca_pem: None,
        };
        let error = material
            .build_tls_config()
            .expect_err("half a client identity must not build");
        assert_eq!(error.code(), ErrorCode::TlsConfig);
        match error {
            Error::TlsConfig { message, .. } => {
                assert!(message.contains("supplied together"));
            }
            other => panic!("unexpected error variant: {other}"),
        }
    }

    #[test]
    fn build_rejects_an_unparseable_ca_bundle() {
        let error = TlsMaterial::ca_only(b"not pem at all".to_vec())
            .build_tls_config()
            .expect_err("garbage CA bundle must not build");
        match error {
            Error::TlsConfig { message, .. } => assert!(message.contains("CA bundle")),
            other => panic!("unexpected error variant: {other}"),
        }
    }

    #[test]
    fn build_rejects_an_unparseable_client_chain() {
        let error = TlsMaterial::mutual(
            b"garbage certificate bytes".to_vec(),
            b"garbage key bytes".to_vec(),
            None,
        )
        .build_tls_config()
        .expect_err("garbage client chain must not build");
        match error {
            Error::TlsConfig { message, .. } => {
                assert!(message.contains("client certificate chain"));
            }
            other => panic!("unexpected error variant: {other}"),
        }
    }
}
