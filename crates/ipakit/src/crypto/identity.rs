//! Signing identity: the private key and certificate imported into the
//! ephemeral keychain.
//!
//! The key comes from build configuration (generated once per account);
//! the certificate is the developer certificate embedded in the selected
//! provisioning profile. Both are only ever written to disk as a
//! password-protected PKCS#12 inside the keychain's scratch directory.

use crate::{Error, Result};
use openssl::pkcs12::Pkcs12;
use openssl::pkey::{PKey, Private};
use openssl::x509::X509;
use secrecy::{ExposeSecret, SecretString};

/// Private key + certificate pair for one build.
pub struct SigningIdentity {
    certificate: X509,
    private_key: PKey<Private>,
}

impl std::fmt::Debug for SigningIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningIdentity")
            .field("certificate", &self.certificate.subject_name())
            .field("private_key", &"<hidden>")
            .finish()
    }
}

impl SigningIdentity {
    /// Loads a PEM (or DER) certificate and a PEM (or DER) private key.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Certificate`] if either fails to parse or the key
    /// does not belong to the certificate.
    pub fn from_pem(
        cert_data: &[u8],
        key_data: &[u8],
        key_password: Option<&SecretString>,
    ) -> Result<Self> {
        let certificate = X509::from_pem(cert_data)
            .or_else(|_| X509::from_der(cert_data))
            .map_err(|e| Error::Certificate(format!("Failed to load certificate: {}", e)))?;

        let private_key = if let Some(pass) = key_password {
            PKey::private_key_from_pem_passphrase(key_data, pass.expose_secret().as_bytes())
        } else {
            PKey::private_key_from_pem(key_data).or_else(|_| PKey::private_key_from_der(key_data))
        }
        .map_err(|e| Error::Certificate(format!("Failed to load private key: {}", e)))?;

        Self::validate_key_pair(&certificate, &private_key)?;

        Ok(Self {
            certificate,
            private_key,
        })
    }

    pub fn certificate(&self) -> &X509 {
        &self.certificate
    }

    /// Exports the pair as a PKCS#12 container protected by `password`.
    pub fn to_pkcs12(&self, friendly_name: &str, password: &SecretString) -> Result<Vec<u8>> {
        Pkcs12::builder()
            .name(friendly_name)
            .pkey(&self.private_key)
            .cert(&self.certificate)
            .build2(password.expose_secret())
            .and_then(|p12| p12.to_der())
            .map_err(|e| Error::Certificate(format!("Failed to build PKCS#12: {}", e)))
    }

    fn validate_key_pair(cert: &X509, private_key: &PKey<Private>) -> Result<()> {
        let cert_public_key = cert.public_key().map_err(|e| {
            Error::Certificate(format!(
                "Failed to extract public key from certificate: {}",
                e
            ))
        })?;

        if !private_key.public_eq(&cert_public_key) {
            return Err(Error::Certificate(
                "Private key does not match certificate public key".into(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_identity;

    #[test]
    fn test_matching_pair_loads() {
        let (key, cert) = test_identity();
        let identity = SigningIdentity::from_pem(
            &cert.to_pem().unwrap(),
            &key.private_key_to_pem_pkcs8().unwrap(),
            None,
        )
        .unwrap();
        assert_eq!(identity.certificate().to_der().unwrap(), cert.to_der().unwrap());
    }

    #[test]
    fn test_der_certificate_accepted() {
        let (key, cert) = test_identity();
        assert!(SigningIdentity::from_pem(
            &cert.to_der().unwrap(),
            &key.private_key_to_pem_pkcs8().unwrap(),
            None,
        )
        .is_ok());
    }

    #[test]
    fn test_mismatched_pair_rejected() {
        let (_, cert) = test_identity();
        let (other_key, _) = test_identity();
        let err = SigningIdentity::from_pem(
            &cert.to_pem().unwrap(),
            &other_key.private_key_to_pem_pkcs8().unwrap(),
            None,
        )
        .unwrap_err();
        assert!(err.to_string().contains("does not match"));
    }

    #[test]
    fn test_pkcs12_round_trip() {
        let (key, cert) = test_identity();
        let identity = SigningIdentity::from_pem(
            &cert.to_pem().unwrap(),
            &key.private_key_to_pem_pkcs8().unwrap(),
            None,
        )
        .unwrap();

        let password = SecretString::new("keychain-pass".to_string());
        let der = identity.to_pkcs12("ipakit", &password).unwrap();
        let parsed = Pkcs12::from_der(&der).unwrap().parse2("keychain-pass").unwrap();
        assert_eq!(parsed.cert.unwrap().to_der().unwrap(), cert.to_der().unwrap());
        assert!(parsed.pkey.is_some());
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(SigningIdentity::from_pem(b"nope", b"nope", None).is_err());
    }
}
