//! OSCORE ([RFC 8613]) message protection for CoAP, keyed either from the
//! EDHOC exporter or from provisioned master secrets.
//!
//! A [SecurityContext] owns the derived keys, the sender sequence number
//! and the server-side replay window; [protect] implements the message
//! transformation, [option] the inner/outer partitioning, [coap] the
//! packet model underneath, and [replay] the anti-replay machinery.
//!
//! [RFC 8613]: https://datatracker.ietf.org/doc/html/rfc8613
#![cfg_attr(not(test), no_std)]

pub mod coap;
pub mod option;
pub mod protect;
pub mod replay;

pub use protect::{
    protect_request, protect_response, unprotect_request, unprotect_response, Piv, RequestMeta,
};
pub use replay::{NotificationTracker, ReplayWindow};

use replay::MAX_SEQ_NUM;
use tarn_shared::{
    AeadAlg, BytesCcmIvLen, BytesCcmKeyLen, CborEncoder, Crypto, Error, HashAlg, AES_CCM_IV_LEN,
};
use zeroize::Zeroize;

/// Sender/recipient IDs must leave room for the PIV inside the nonce.
pub const MAX_OSCORE_ID_LEN: usize = AES_CCM_IV_LEN - 6;
pub const MAX_ID_CONTEXT_LEN: usize = 32;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct OscoreId {
    bytes: [u8; MAX_OSCORE_ID_LEN],
    len: usize,
}

impl OscoreId {
    pub fn from_slice(slice: &[u8]) -> Result<Self, Error> {
        if slice.len() > MAX_OSCORE_ID_LEN {
            return Err(Error::BufferTooSmall);
        }
        let mut bytes = [0u8; MAX_OSCORE_ID_LEN];
        bytes[..slice.len()].copy_from_slice(slice);
        Ok(OscoreId {
            bytes,
            len: slice.len(),
        })
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.len]
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct IdContext {
    bytes: [u8; MAX_ID_CONTEXT_LEN],
    len: usize,
}

impl IdContext {
    pub fn from_slice(slice: &[u8]) -> Result<Self, Error> {
        if slice.len() > MAX_ID_CONTEXT_LEN {
            return Err(Error::BufferTooSmall);
        }
        let mut bytes = [0u8; MAX_ID_CONTEXT_LEN];
        bytes[..slice.len()].copy_from_slice(slice);
        Ok(IdContext {
            bytes,
            len: slice.len(),
        })
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.len]
    }
}

/// One side of an OSCORE association: derived keys, the outbound sequence
/// number, inbound replay state and notification ordering.
#[derive(Debug)]
pub struct SecurityContext {
    pub(crate) aead_alg: AeadAlg,
    pub(crate) sender_id: OscoreId,
    pub(crate) recipient_id: OscoreId,
    pub(crate) id_context: Option<IdContext>,
    pub(crate) sender_key: BytesCcmKeyLen,
    pub(crate) recipient_key: BytesCcmKeyLen,
    pub(crate) common_iv: BytesCcmIvLen,
    sender_seq: u64,
    pub replay: ReplayWindow,
    pub notifications: NotificationTracker,
}

impl Drop for SecurityContext {
    fn drop(&mut self) {
        self.sender_key.zeroize();
        self.recipient_key.zeroize();
        self.common_iv.zeroize();
    }
}

const HKDF_TYPE_KEY: &str = "Key";
const HKDF_TYPE_IV: &str = "IV";

impl SecurityContext {
    /// Derive a context from the master secret and salt, RFC 8613 §3.2:
    /// each key is `HKDF(salt, secret, info, L)` with
    /// `info = [id, id_context, alg, type, L]`.
    #[allow(clippy::too_many_arguments)]
    pub fn derive<C: Crypto>(
        crypto: &mut C,
        master_secret: &[u8],
        master_salt: &[u8],
        sender_id: &[u8],
        recipient_id: &[u8],
        id_context: Option<&[u8]>,
        aead_alg: AeadAlg,
        hash_alg: HashAlg,
    ) -> Result<Self, Error> {
        // the trait HKDF is SHA-256, the only registered app hash here
        match hash_alg {
            HashAlg::Sha256 => {}
        }
        if !matches!(
            aead_alg,
            AeadAlg::AesCcm16_64_128 | AeadAlg::AesCcm16_128_128
        ) {
            return Err(Error::UnsupportedSuite);
        }

        let sender_id = OscoreId::from_slice(sender_id)?;
        let recipient_id = OscoreId::from_slice(recipient_id)?;
        let id_context = match id_context {
            Some(bytes) => Some(IdContext::from_slice(bytes)?),
            None => None,
        };

        let prk = crypto.hkdf_extract(master_salt, master_secret);

        let mut sender_key = [0u8; 16];
        expand_into(
            crypto,
            &prk,
            &sender_id,
            &id_context,
            aead_alg,
            HKDF_TYPE_KEY,
            &mut sender_key,
        )?;
        let mut recipient_key = [0u8; 16];
        expand_into(
            crypto,
            &prk,
            &recipient_id,
            &id_context,
            aead_alg,
            HKDF_TYPE_KEY,
            &mut recipient_key,
        )?;
        let mut common_iv = [0u8; AES_CCM_IV_LEN];
        expand_into(
            crypto,
            &prk,
            &OscoreId::from_slice(&[])?,
            &id_context,
            aead_alg,
            HKDF_TYPE_IV,
            &mut common_iv,
        )?;

        Ok(SecurityContext {
            aead_alg,
            sender_id,
            recipient_id,
            id_context,
            sender_key,
            recipient_key,
            common_iv,
            sender_seq: 0,
            replay: ReplayWindow::new(),
            notifications: NotificationTracker::new(),
        })
    }

    pub fn sender_id(&self) -> &OscoreId {
        &self.sender_id
    }

    pub fn recipient_id(&self) -> &OscoreId {
        &self.recipient_id
    }

    pub fn sender_seq(&self) -> u64 {
        self.sender_seq
    }

    /// Claim the next outbound sequence number.
    pub fn next_sender_seq(&mut self) -> Result<u64, Error> {
        if self.sender_seq > MAX_SEQ_NUM {
            // PIV space exhausted; the association must be rekeyed
            return Err(Error::BufferTooSmall);
        }
        let seq = self.sender_seq;
        self.sender_seq += 1;
        Ok(seq)
    }
}

fn expand_into<C: Crypto>(
    crypto: &mut C,
    prk: &[u8; 32],
    id: &OscoreId,
    id_context: &Option<IdContext>,
    aead_alg: AeadAlg,
    type_label: &str,
    out: &mut [u8],
) -> Result<(), Error> {
    let mut info = [0u8; 64];
    let mut encoder = CborEncoder::new(&mut info);
    encoder.array(5)?;
    encoder.bytes(id.as_slice())?;
    match id_context {
        Some(context) => encoder.bytes(context.as_slice())?,
        None => encoder.null()?,
    }
    encoder.int(aead_alg.cose_label())?;
    encoder.text(type_label)?;
    encoder.uint(out.len() as u64)?;
    let info_len = encoder.position();

    let okm = crypto.hkdf_expand(prk, &info[..info_len], out.len());
    out.copy_from_slice(&okm[..out.len()]);
    Ok(())
}
