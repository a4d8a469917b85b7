use super::*;

/// Suite labels registered for EDHOC; the table below is exhaustive for
/// labels 0..=6.
pub const EDHOC_SUITES: [u8; 7] = [0, 1, 2, 3, 4, 5, 6];

/// Suites the bundled crypto backend can actually run (P-256 / SHA-256 /
/// AES-CCM). Ordered by preference, most preferred first.
pub const EDHOC_SUPPORTED_SUITES: [u8; 2] = [3, 2];

#[derive(PartialEq, Debug, Clone, Copy)]
pub enum AeadAlg {
    AesCcm16_64_128,
    AesCcm16_128_128,
    A128Gcm,
    ChaCha20Poly1305,
}

impl AeadAlg {
    /// COSE algorithm identifier, as it appears in the OSCORE AAD.
    pub fn cose_label(self) -> i64 {
        match self {
            AeadAlg::AesCcm16_64_128 => 10,
            AeadAlg::AesCcm16_128_128 => 30,
            AeadAlg::A128Gcm => 1,
            AeadAlg::ChaCha20Poly1305 => 24,
        }
    }

    pub fn key_len(self) -> usize {
        match self {
            AeadAlg::AesCcm16_64_128 | AeadAlg::AesCcm16_128_128 | AeadAlg::A128Gcm => 16,
            AeadAlg::ChaCha20Poly1305 => 32,
        }
    }

    pub fn iv_len(self) -> usize {
        match self {
            AeadAlg::AesCcm16_64_128 | AeadAlg::AesCcm16_128_128 => 13,
            AeadAlg::A128Gcm | AeadAlg::ChaCha20Poly1305 => 12,
        }
    }

    pub fn tag_len(self) -> usize {
        match self {
            AeadAlg::AesCcm16_64_128 => 8,
            AeadAlg::AesCcm16_128_128 | AeadAlg::A128Gcm | AeadAlg::ChaCha20Poly1305 => 16,
        }
    }
}

#[derive(PartialEq, Debug, Clone, Copy)]
pub enum HashAlg {
    Sha256,
}

impl HashAlg {
    pub fn digest_len(self) -> usize {
        match self {
            HashAlg::Sha256 => SHA256_DIGEST_LEN,
        }
    }
}

#[derive(PartialEq, Debug, Clone, Copy)]
pub enum EcdhCurve {
    X25519,
    P256,
}

impl EcdhCurve {
    /// Length of a public key element on the wire; this is what splits
    /// `G_Y || CIPHERTEXT_2`.
    pub fn public_key_len(self) -> usize {
        match self {
            EcdhCurve::X25519 | EcdhCurve::P256 => 32,
        }
    }
}

#[derive(PartialEq, Debug, Clone, Copy)]
pub enum SignAlg {
    EdDsa,
    Es256,
}

impl SignAlg {
    pub fn signature_len(self) -> usize {
        match self {
            SignAlg::EdDsa | SignAlg::Es256 => 64,
        }
    }
}

/// One row of the cipher suite registry.
#[derive(PartialEq, Debug, Clone, Copy)]
pub struct CipherSuite {
    pub label: u8,
    pub aead: AeadAlg,
    pub hash: HashAlg,
    pub mac_len: usize,
    pub ecdh_curve: EcdhCurve,
    pub sign_alg: SignAlg,
    pub app_aead: AeadAlg,
    pub app_hash: HashAlg,
}

/// Look up a suite label. Fails with [Error::UnsupportedSuite] for labels
/// outside the registry.
pub fn get_suite(label: u8) -> Result<CipherSuite, Error> {
    let suite = match label {
        0 => CipherSuite {
            label: 0,
            aead: AeadAlg::AesCcm16_64_128,
            hash: HashAlg::Sha256,
            mac_len: 8,
            ecdh_curve: EcdhCurve::X25519,
            sign_alg: SignAlg::EdDsa,
            app_aead: AeadAlg::AesCcm16_64_128,
            app_hash: HashAlg::Sha256,
        },
        1 => CipherSuite {
            label: 1,
            aead: AeadAlg::AesCcm16_128_128,
            hash: HashAlg::Sha256,
            mac_len: 16,
            ecdh_curve: EcdhCurve::X25519,
            sign_alg: SignAlg::EdDsa,
            app_aead: AeadAlg::AesCcm16_64_128,
            app_hash: HashAlg::Sha256,
        },
        2 => CipherSuite {
            label: 2,
            aead: AeadAlg::AesCcm16_64_128,
            hash: HashAlg::Sha256,
            mac_len: 8,
            ecdh_curve: EcdhCurve::P256,
            sign_alg: SignAlg::Es256,
            app_aead: AeadAlg::AesCcm16_64_128,
            app_hash: HashAlg::Sha256,
        },
        3 => CipherSuite {
            label: 3,
            aead: AeadAlg::AesCcm16_128_128,
            hash: HashAlg::Sha256,
            mac_len: 16,
            ecdh_curve: EcdhCurve::P256,
            sign_alg: SignAlg::Es256,
            app_aead: AeadAlg::AesCcm16_64_128,
            app_hash: HashAlg::Sha256,
        },
        4 => CipherSuite {
            label: 4,
            aead: AeadAlg::ChaCha20Poly1305,
            hash: HashAlg::Sha256,
            mac_len: 16,
            ecdh_curve: EcdhCurve::X25519,
            sign_alg: SignAlg::EdDsa,
            app_aead: AeadAlg::ChaCha20Poly1305,
            app_hash: HashAlg::Sha256,
        },
        5 => CipherSuite {
            label: 5,
            aead: AeadAlg::ChaCha20Poly1305,
            hash: HashAlg::Sha256,
            mac_len: 16,
            ecdh_curve: EcdhCurve::P256,
            sign_alg: SignAlg::Es256,
            app_aead: AeadAlg::ChaCha20Poly1305,
            app_hash: HashAlg::Sha256,
        },
        6 => CipherSuite {
            label: 6,
            aead: AeadAlg::A128Gcm,
            hash: HashAlg::Sha256,
            mac_len: 16,
            ecdh_curve: EcdhCurve::X25519,
            sign_alg: SignAlg::Es256,
            app_aead: AeadAlg::A128Gcm,
            app_hash: HashAlg::Sha256,
        },
        _ => return Err(Error::UnsupportedSuite),
    };
    Ok(suite)
}

/// Whether the bundled backend can run this suite.
pub fn suite_supported(label: u8) -> bool {
    EDHOC_SUPPORTED_SUITES.contains(&label)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_get_suite() {
        let suite = get_suite(2).unwrap();
        assert_eq!(suite.aead.tag_len(), 8);
        assert_eq!(suite.ecdh_curve, EcdhCurve::P256);
        assert_eq!(suite.sign_alg, SignAlg::Es256);

        let suite = get_suite(3).unwrap();
        assert_eq!(suite.aead.tag_len(), 16);
        assert_eq!(suite.app_aead.tag_len(), 8);

        assert_eq!(get_suite(7).unwrap_err(), Error::UnsupportedSuite);
    }

    #[test]
    fn test_supported_subset() {
        for label in EDHOC_SUPPORTED_SUITES {
            assert!(get_suite(label).is_ok());
        }
        assert!(!suite_supported(0));
        assert!(suite_supported(2));
    }
}
