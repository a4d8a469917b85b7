use super::*;

/// COSE header labels recognised inside an ID_CRED map.
pub const COSE_HEADER_KID: u8 = 4;
pub const COSE_HEADER_X5BAG: u8 = 32;
pub const COSE_HEADER_X5CHAIN: u8 = 33;
pub const COSE_HEADER_X5T: u8 = 34;
pub const COSE_HEADER_X5U: u8 = 35;
pub const COSE_HEADER_C5B: u8 = 52;
pub const COSE_HEADER_C5C: u8 = 53;
pub const COSE_HEADER_C5T: u8 = 54;
pub const COSE_HEADER_C5U: u8 = 55;

pub const MAX_KID_LEN: usize = 8;
pub const MAX_CRED_HASH_LEN: usize = 32;

/// An authentication credential known to this party: the encoded CRED bytes
/// (CCS, X.509, C509, ...), the public authentication key and, where the
/// credential identifies itself by key id, that kid.
///
/// The same long-term key backs both signature and static-DH
/// authentication, so `public_key` doubles as the peer's G_R/G_I.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Credential {
    pub value: EdhocMessageBuffer,
    pub public_key: BytesP256ElemLen,
    pub kid: Option<KidBytes>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KidBytes {
    content: [u8; MAX_KID_LEN],
    len: usize,
}

impl KidBytes {
    pub fn from_slice(slice: &[u8]) -> Result<Self, Error> {
        if slice.len() > MAX_KID_LEN {
            return Err(Error::BufferTooSmall);
        }
        let mut content = [0u8; MAX_KID_LEN];
        content[..slice.len()].copy_from_slice(slice);
        Ok(KidBytes {
            content,
            len: slice.len(),
        })
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.content[..self.len]
    }
}

impl Credential {
    pub fn new(value: &[u8], public_key: BytesP256ElemLen, kid: Option<&[u8]>) -> Result<Self, Error> {
        let kid = match kid {
            Some(kid) => Some(KidBytes::from_slice(kid)?),
            None => None,
        };
        Ok(Credential {
            value: value.try_into().map_err(|_| Error::BufferTooSmall)?,
            public_key,
            kid,
        })
    }
}

/// The parsed content of an ID_CRED map. `raw` keeps the canonical map
/// encoding as it is fed into the transcript MAC context.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IdCred {
    pub raw: EdhocMessageBuffer,
    pub kind: IdCredKind,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum IdCredKind {
    /// `kid`: reference by key identifier.
    Kid(KidBytes),
    /// `x5t` / `c5t`: reference by certificate hash, with the COSE hash
    /// algorithm that produced it.
    HashRef { alg: i8, hash: CredHashBytes },
    /// `x5chain` / `x5bag` / `c5c` / `c5b`: certificate data carried inline.
    ChainRef,
    /// `x5u` / `c5u`: reference by URI; resolving these is unsupported.
    UriRef,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CredHashBytes {
    content: [u8; MAX_CRED_HASH_LEN],
    len: usize,
}

impl CredHashBytes {
    pub fn from_slice(slice: &[u8]) -> Result<Self, Error> {
        if slice.len() > MAX_CRED_HASH_LEN {
            return Err(Error::BufferTooSmall);
        }
        let mut content = [0u8; MAX_CRED_HASH_LEN];
        content[..slice.len()].copy_from_slice(slice);
        Ok(CredHashBytes {
            content,
            len: slice.len(),
        })
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.content[..self.len]
    }
}

impl IdCred {
    /// Build the `{4: kid}` form, compacting nothing; the compact wire
    /// encoding is applied by the plaintext encoder.
    pub fn from_kid(kid: &[u8]) -> Result<Self, Error> {
        let mut raw = EdhocMessageBuffer::new();
        let mut content = [0u8; MAX_MESSAGE_SIZE_LEN];
        let mut encoder = CborEncoder::new(&mut content);
        encoder.map(1)?;
        encoder.uint(COSE_HEADER_KID as u64)?;
        encoder.bytes(kid)?;
        let len = encoder.position();
        raw.fill_with_slice(&content[..len])
            .map_err(|_| Error::BufferTooSmall)?;
        Ok(IdCred {
            raw,
            kind: IdCredKind::Kid(KidBytes::from_slice(kid)?),
        })
    }

    /// Parse an ID_CRED map. Exactly one recognised label must be present.
    pub fn from_encoded_map(bytes: &[u8]) -> Result<Self, Error> {
        let mut decoder = CborDecoder::new(bytes);
        let pairs = decoder.map()?;
        if pairs == 0 {
            return Err(Error::CborMalformed);
        }

        let mut kind: Option<IdCredKind> = None;
        for _ in 0..pairs {
            let label = decoder.u8()?;
            let parsed = match label {
                COSE_HEADER_KID => {
                    let kid = decoder.bytes()?;
                    Some(IdCredKind::Kid(KidBytes::from_slice(kid)?))
                }
                COSE_HEADER_X5T | COSE_HEADER_C5T => {
                    // COSE_CertHash: [hashAlg: int, hashValue: bstr]
                    let n = decoder.array()?;
                    if n != 2 {
                        return Err(Error::CborMalformed);
                    }
                    let alg = decoder.i8()?;
                    let hash = decoder.bytes()?;
                    Some(IdCredKind::HashRef {
                        alg,
                        hash: CredHashBytes::from_slice(hash)?,
                    })
                }
                COSE_HEADER_X5CHAIN | COSE_HEADER_X5BAG | COSE_HEADER_C5C | COSE_HEADER_C5B => {
                    decoder.skip_item()?;
                    Some(IdCredKind::ChainRef)
                }
                COSE_HEADER_X5U | COSE_HEADER_C5U => {
                    decoder.skip_item()?;
                    Some(IdCredKind::UriRef)
                }
                _ => {
                    // unrecognised labels are tolerated but identify nothing
                    decoder.skip_item()?;
                    None
                }
            };
            if let Some(parsed) = parsed {
                if kind.is_some() {
                    return Err(Error::CborMalformed);
                }
                kind = Some(parsed);
            }
        }
        decoder.ensure_finished()?;

        let kind = kind.ok_or(Error::CborMalformed)?;
        Ok(IdCred {
            raw: bytes.try_into().map_err(|_| Error::BufferTooSmall)?,
            kind,
        })
    }

    /// The chain bytes of a ChainRef, i.e. the map value as encoded.
    pub fn chain_bytes(&self) -> Result<&[u8], Error> {
        match self.kind {
            IdCredKind::ChainRef => {
                let mut decoder = CborDecoder::new(self.raw.as_slice());
                decoder.map()?;
                decoder.u8()?;
                let start = decoder.position();
                decoder.skip_item()?;
                Ok(&self.raw.as_slice()[start..decoder.position()])
            }
            _ => Err(Error::CredNotFound),
        }
    }
}

/// Certificate chain validation, left to the caller: the implementation
/// holds its trust anchors and returns the end-entity public key.
pub trait ChainVerifier {
    fn verify_certificate_chain(&mut self, chain: &[u8]) -> Result<BytesP256ElemLen, Error>;
}

/// A verifier for deployments that carry no certificate trust anchors.
#[derive(Debug, Default)]
pub struct NoChainVerifier;

impl ChainVerifier for NoChainVerifier {
    fn verify_certificate_chain(&mut self, _chain: &[u8]) -> Result<BytesP256ElemLen, Error> {
        Err(Error::CertInvalid)
    }
}

/// Maps a received ID_CRED to the peer credential and public key, against a
/// caller-supplied list of known credentials.
#[derive(Debug)]
pub struct CredentialResolver<'a, V: ChainVerifier> {
    known: &'a [Credential],
    verifier: V,
}

impl<'a, V: ChainVerifier> CredentialResolver<'a, V> {
    pub fn new(known: &'a [Credential], verifier: V) -> Self {
        CredentialResolver { known, verifier }
    }

    /// Resolution is a pure function of the ID_CRED and the store, so
    /// calling it twice yields the same credential or the same error.
    pub fn resolve<C: Crypto>(
        &mut self,
        crypto: &mut C,
        id_cred: &IdCred,
    ) -> Result<Credential, Error> {
        match &id_cred.kind {
            IdCredKind::Kid(kid) => self.unique_match(|known| {
                known
                    .kid
                    .as_ref()
                    .map(|k| k.as_slice() == kid.as_slice())
                    .unwrap_or(false)
            }),
            IdCredKind::HashRef { alg, hash } => {
                // recompute the hash of each candidate CRED and compare
                if *alg != COSE_ALG_SHA256 && *alg != COSE_ALG_SHA256_64 {
                    return Err(Error::CredNotFound);
                }
                let mut matched: Option<Credential> = None;
                for known in self.known {
                    let digest = crypto.sha256_digest(known.value.as_slice());
                    if &digest[..hash.as_slice().len()] == hash.as_slice() {
                        if matched.is_some() {
                            return Err(Error::CredAmbiguous);
                        }
                        matched = Some(*known);
                    }
                }
                matched.ok_or(Error::CredNotFound)
            }
            IdCredKind::ChainRef => {
                let chain = id_cred.chain_bytes()?;
                let public_key = self.verifier.verify_certificate_chain(chain)?;
                Credential::new(chain, public_key, None)
            }
            IdCredKind::UriRef => Err(Error::CredFetchUnsupported),
        }
    }

    fn unique_match<F: Fn(&Credential) -> bool>(&self, pred: F) -> Result<Credential, Error> {
        let mut matched: Option<Credential> = None;
        for known in self.known {
            if pred(known) {
                if matched.is_some() {
                    return Err(Error::CredAmbiguous);
                }
                matched = Some(*known);
            }
        }
        matched.ok_or(Error::CredNotFound)
    }
}

/// COSE hash algorithm identifiers accepted inside x5t/c5t.
pub const COSE_ALG_SHA256: i8 = -16;
pub const COSE_ALG_SHA256_64: i8 = -15;
