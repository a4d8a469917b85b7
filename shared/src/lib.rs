//! Common data structures used by [tarn] and its dependent crates
//!
//! This crate is separate from tarn so that the OSCORE layer and the crypto
//! backends can share buffer types, the cipher suite table and the error
//! enum without depending on the protocol crate itself. Prefer using these
//! types through the public re-export in the main crate wherever possible.
//!
//! [tarn]: ../tarn/index.html
#![cfg_attr(not(test), no_std)]

pub use cbor::*;
pub use parser::*;

mod cbor;

mod crypto;
pub use crypto::Crypto;

mod cred;
pub use cred::*;

mod parser;

mod suites;
pub use suites::*;

use zeroize::Zeroize;

// Sized to hold message_2 with a full signature and a by-value credential,
// and the KDF context built over (ID_CRED, TH, CRED, EAD).
pub const MAX_MESSAGE_SIZE_LEN: usize = 384;

pub const MAX_SUITES_LEN: usize = 9;
pub const MAX_CONN_ID_LEN: usize = 8;
pub const MAX_EAD_SIZE_LEN: usize = 64;
pub const MAX_DIAGNOSTIC_LEN: usize = 32;

pub const P256_ELEM_LEN: usize = 32;
pub const ECDSA_SIG_LEN: usize = 64;
pub const SHA256_DIGEST_LEN: usize = 32;
pub const AES_CCM_KEY_LEN: usize = 16;
pub const AES_CCM_IV_LEN: usize = 13;

pub const MAX_BUFFER_LEN: usize = MAX_MESSAGE_SIZE_LEN;
// KDF context spans (ID_CRED, TH, CRED, EAD), which can exceed one message
pub const MAX_KDF_CONTEXT_LEN: usize = 2 * MAX_MESSAGE_SIZE_LEN;
pub const MAX_INFO_LEN: usize = MAX_KDF_CONTEXT_LEN + 8;

pub const CBOR_BYTE_STRING: u8 = 0x58u8;
pub const CBOR_TEXT_STRING: u8 = 0x78u8;
pub const CBOR_UINT_1BYTE: u8 = 0x18u8;
pub const CBOR_NEG_INT_1BYTE_START: u8 = 0x20u8;
pub const CBOR_NEG_INT_1BYTE_END: u8 = 0x37u8;
pub const CBOR_UINT_1BYTE_START: u8 = 0x0u8;
pub const CBOR_UINT_1BYTE_END: u8 = 0x17u8;
pub const CBOR_MAJOR_TEXT_STRING: u8 = 0x60u8;
pub const CBOR_MAJOR_BYTE_STRING: u8 = 0x40u8;
pub const CBOR_MAJOR_ARRAY: u8 = 0x80u8;
pub const CBOR_MAJOR_MAP: u8 = 0xA0u8;
pub const CBOR_NULL: u8 = 0xF6u8;

pub type BytesSuites = [u8; MAX_SUITES_LEN];
pub type BytesP256ElemLen = [u8; P256_ELEM_LEN];
pub type BytesEcdsaSig = [u8; ECDSA_SIG_LEN];
pub type BytesHashLen = [u8; SHA256_DIGEST_LEN];
pub type BytesCcmKeyLen = [u8; AES_CCM_KEY_LEN];
pub type BytesCcmIvLen = [u8; AES_CCM_IV_LEN];
pub type BytesMaxBuffer = [u8; MAX_BUFFER_LEN];
pub type BytesMaxInfoBuffer = [u8; MAX_INFO_LEN];

pub type BufferMessage1 = EdhocMessageBuffer;
pub type BufferMessage2 = EdhocMessageBuffer;
pub type BufferMessage3 = EdhocMessageBuffer;
pub type BufferMessage4 = EdhocMessageBuffer;
pub type BufferCiphertext2 = EdhocMessageBuffer;
pub type BufferCiphertext3 = EdhocMessageBuffer;
pub type BufferPlaintext2 = EdhocMessageBuffer;
pub type BufferPlaintext3 = EdhocMessageBuffer;
pub type BufferSigOrMac = EdhocMessageBuffer;

/// Stable error codes surfaced to callers.
///
/// The discriminants are part of the public contract and never reassigned:
/// 1..=5 crypto, 10..=14 wire, 20..=29 protocol and credentials,
/// 30..=32 replay, 40..=41 lifecycle.
#[repr(u8)]
#[derive(PartialEq, Debug, Clone, Copy)]
pub enum Error {
    HashFailed = 1,
    EcdhFailed = 2,
    AeadAuthFailed = 3,
    SignFailed = 4,
    VerifyFailed = 5,

    CborMalformed = 10,
    CborUnexpectedType = 11,
    CborTruncated = 12,
    CborTrailing = 13,
    BufferTooSmall = 14,

    UnsupportedMethod = 20,
    UnsupportedSuite = 21,
    SuiteMismatch(Suites) = 22,
    UnknownCredential = 23,
    AuthFailed = 24,
    ErrorMessageReceived(PeerError) = 25,
    CredNotFound = 26,
    CredAmbiguous = 27,
    CredFetchUnsupported = 28,
    CertInvalid = 29,

    ReplayDuplicate = 30,
    ReplayWindowStale = 31,
    NotificationOutOfOrder = 32,

    Cancelled = 40,
    TransportError = 41,
}

impl Error {
    /// The stable integer discriminant of this error kind.
    pub fn code(&self) -> u8 {
        // Sound for a #[repr(u8)] enum: the tag is the first byte.
        unsafe { *(self as *const Self as *const u8) }
    }
}

/// EDHOC error message codes as they appear on the wire.
pub const ERR_CODE_UNSPECIFIED: u8 = 1;
pub const ERR_CODE_WRONG_SELECTED_SUITE: u8 = 2;
pub const ERR_CODE_UNKNOWN_CREDENTIAL: u8 = 3;

/// A received `error(ERR_CODE, ERR_INFO)` message, surfaced verbatim.
#[derive(PartialEq, Debug, Clone, Copy)]
pub struct PeerError {
    pub code: u8,
    pub info: PeerErrorInfo,
}

#[derive(PartialEq, Debug, Clone, Copy)]
pub enum PeerErrorInfo {
    None,
    /// Diagnostic text from an `unspecified` error, possibly truncated.
    Diagnostic(Diagnostic),
    /// SUITES_R from a `wrong selected cipher suite` error.
    SuitesR(Suites),
}

#[derive(PartialEq, Debug, Clone, Copy)]
pub struct Diagnostic {
    content: [u8; MAX_DIAGNOSTIC_LEN],
    len: usize,
}

impl Diagnostic {
    pub fn from_slice(slice: &[u8]) -> Self {
        let mut content = [0u8; MAX_DIAGNOSTIC_LEN];
        let len = core::cmp::min(slice.len(), MAX_DIAGNOSTIC_LEN);
        content[..len].copy_from_slice(&slice[..len]);
        Diagnostic { content, len }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.content[..self.len]
    }
}

/// An ordered list of cipher suite labels, most preferred first; the last
/// element is the selected suite.
#[derive(PartialEq, Debug, Clone, Copy, Default)]
pub struct Suites {
    suites: BytesSuites,
    len: usize,
}

impl Suites {
    pub fn new() -> Self {
        Suites {
            suites: [0u8; MAX_SUITES_LEN],
            len: 0,
        }
    }

    pub fn from_slice(slice: &[u8]) -> Result<Self, Error> {
        if slice.len() > MAX_SUITES_LEN {
            return Err(Error::BufferTooSmall);
        }
        let mut suites = [0u8; MAX_SUITES_LEN];
        suites[..slice.len()].copy_from_slice(slice);
        Ok(Suites {
            suites,
            len: slice.len(),
        })
    }

    pub fn push(&mut self, label: u8) -> Result<(), Error> {
        if self.len == MAX_SUITES_LEN {
            return Err(Error::BufferTooSmall);
        }
        self.suites[self.len] = label;
        self.len += 1;
        Ok(())
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.suites[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The selected suite, i.e. the last element.
    pub fn selected(&self) -> Option<u8> {
        self.len.checked_sub(1).map(|i| self.suites[i])
    }

    pub fn contains(&self, label: u8) -> bool {
        self.as_slice().iter().any(|&s| s == label)
    }
}

/// Connection identifier `C_I`/`C_R`.
///
/// Small integers in -24..=23 travel as CBOR ints, everything else as a CBOR
/// byte string. Identifiers of different kinds never compare equal even when
/// a byte string holds the encoding of an integer.
#[derive(PartialEq, Debug, Clone, Copy)]
pub enum ConnId {
    Int(i32),
    Bstr(ConnIdBytes),
}

#[derive(PartialEq, Debug, Clone, Copy)]
pub struct ConnIdBytes {
    content: [u8; MAX_CONN_ID_LEN],
    len: usize,
}

impl ConnIdBytes {
    pub fn from_slice(slice: &[u8]) -> Result<Self, Error> {
        if slice.len() > MAX_CONN_ID_LEN {
            return Err(Error::BufferTooSmall);
        }
        let mut content = [0u8; MAX_CONN_ID_LEN];
        content[..slice.len()].copy_from_slice(slice);
        Ok(ConnIdBytes {
            content,
            len: slice.len(),
        })
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.content[..self.len]
    }
}

impl ConnId {
    pub fn from_int(value: i32) -> Self {
        ConnId::Int(value)
    }

    pub fn from_slice(slice: &[u8]) -> Result<Self, Error> {
        Ok(ConnId::Bstr(ConnIdBytes::from_slice(slice)?))
    }

    /// The identifier as raw bytes, for use as an OSCORE sender/recipient id.
    /// Integer identifiers map to their single-byte CBOR encoding.
    pub fn as_kid(&self) -> Result<ConnIdBytes, Error> {
        match self {
            ConnId::Int(value) => {
                let byte = encode_int_byte(*value)?;
                ConnIdBytes::from_slice(&[byte])
            }
            ConnId::Bstr(bytes) => Ok(*bytes),
        }
    }

    pub fn encode(&self, encoder: &mut CborEncoder) -> Result<(), Error> {
        match self {
            ConnId::Int(value) => {
                if !(-24..=23).contains(value) {
                    return Err(Error::CborMalformed);
                }
                encoder.int(*value as i64)?;
            }
            ConnId::Bstr(bytes) => {
                encoder.bytes(bytes.as_slice())?;
            }
        }
        Ok(())
    }

    pub fn decode(decoder: &mut CborDecoder) -> Result<Self, Error> {
        let b = decoder.current()?;
        if CborDecoder::is_int_byte(b) {
            let value = decoder.i8()? as i32;
            if !(-24..=23).contains(&value) {
                return Err(Error::CborMalformed);
            }
            Ok(ConnId::Int(value))
        } else if CborDecoder::type_of(b) == CBOR_MAJOR_BYTE_STRING {
            let bytes = decoder.bytes()?;
            // a 1-byte bstr holding the image of a small int must use the
            // int form instead
            if bytes.len() == 1 && CborDecoder::is_int_byte(bytes[0]) {
                return Err(Error::CborMalformed);
            }
            ConnId::from_slice(bytes)
        } else {
            Err(Error::CborUnexpectedType)
        }
    }
}

fn encode_int_byte(value: i32) -> Result<u8, Error> {
    if (0..=23).contains(&value) {
        Ok(value as u8)
    } else if (-24..=-1).contains(&value) {
        Ok(CBOR_NEG_INT_1BYTE_START + (-1 - value) as u8)
    } else {
        Err(Error::CborMalformed)
    }
}

#[derive(PartialEq, Debug)]
#[repr(C)]
pub enum MessageBufferError {
    BufferAlreadyFull,
    SliceTooLong,
}

/// An owned u8 vector of a limited length
///
/// It is used to represent the various messages in encrypted and in decrypted
/// form, as well as other data items. Its maximum length is
/// [MAX_MESSAGE_SIZE_LEN].
#[derive(PartialEq, Debug, Copy, Clone)]
pub struct EdhocMessageBuffer {
    pub content: [u8; MAX_MESSAGE_SIZE_LEN],
    pub len: usize,
}

impl Default for EdhocMessageBuffer {
    fn default() -> Self {
        EdhocMessageBuffer {
            content: [0; MAX_MESSAGE_SIZE_LEN],
            len: 0,
        }
    }
}

impl EdhocMessageBuffer {
    pub fn new() -> Self {
        EdhocMessageBuffer {
            content: [0u8; MAX_MESSAGE_SIZE_LEN],
            len: 0,
        }
    }

    pub fn new_from_slice(slice: &[u8]) -> Result<Self, MessageBufferError> {
        let mut buffer = Self::new();
        if buffer.fill_with_slice(slice).is_ok() {
            Ok(buffer)
        } else {
            Err(MessageBufferError::SliceTooLong)
        }
    }

    pub fn get(self, index: usize) -> Option<u8> {
        self.content.get(index).copied()
    }

    pub fn push(&mut self, item: u8) -> Result<(), MessageBufferError> {
        if self.len < self.content.len() {
            self.content[self.len] = item;
            self.len += 1;
            Ok(())
        } else {
            Err(MessageBufferError::BufferAlreadyFull)
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.content[0..self.len]
    }

    pub fn fill_with_slice(&mut self, slice: &[u8]) -> Result<(), MessageBufferError> {
        if slice.len() <= self.content.len() {
            self.len = slice.len();
            self.content[..self.len].copy_from_slice(slice);
            Ok(())
        } else {
            Err(MessageBufferError::SliceTooLong)
        }
    }

    pub fn extend_from_slice(&mut self, slice: &[u8]) -> Result<(), MessageBufferError> {
        if self.len + slice.len() <= self.content.len() {
            self.content[self.len..self.len + slice.len()].copy_from_slice(slice);
            self.len += slice.len();
            Ok(())
        } else {
            Err(MessageBufferError::SliceTooLong)
        }
    }

    pub fn from_hex(hex: &str) -> Self {
        let mut buffer = EdhocMessageBuffer::new();
        buffer.len = hex.len() / 2;
        for (i, chunk) in hex.as_bytes().chunks(2).enumerate() {
            let chunk_str = core::str::from_utf8(chunk).unwrap();
            buffer.content[i] = u8::from_str_radix(chunk_str, 16).unwrap();
        }
        buffer
    }
}

impl TryInto<EdhocMessageBuffer> for &[u8] {
    type Error = ();

    fn try_into(self) -> Result<EdhocMessageBuffer, Self::Error> {
        EdhocMessageBuffer::new_from_slice(self).map_err(|_| ())
    }
}

impl Zeroize for EdhocMessageBuffer {
    fn zeroize(&mut self) {
        self.content.zeroize();
        self.len = 0;
    }
}

/// EDHOC authentication method: which parties authenticate via a static DH
/// key instead of a signature.
#[repr(u8)]
#[derive(PartialEq, Debug, Clone, Copy)]
pub enum Method {
    SignSign = 0,
    SignStat = 1,
    StatSign = 2,
    StatStat = 3,
}

impl Method {
    pub fn from_u8(value: u8) -> Result<Self, Error> {
        match value {
            0 => Ok(Method::SignSign),
            1 => Ok(Method::SignStat),
            2 => Ok(Method::StatSign),
            3 => Ok(Method::StatStat),
            _ => Err(Error::UnsupportedMethod),
        }
    }

    pub fn initiator_static_dh(self) -> bool {
        matches!(self, Method::StatSign | Method::StatStat)
    }

    pub fn responder_static_dh(self) -> bool {
        matches!(self, Method::SignStat | Method::StatStat)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct EADItem {
    pub label: u8,
    pub is_critical: bool,
    pub value: Option<EdhocMessageBuffer>,
}

impl EADItem {
    pub fn new() -> Self {
        EADItem {
            label: 0,
            is_critical: false,
            value: None,
        }
    }
}

impl Default for EADItem {
    fn default() -> Self {
        Self::new()
    }
}

// Session state structs, one per protocol phase. Secret fields are wiped on
// drop; the typestate wrappers in the main crate move these along the
// handshake so an abandoned session wipes itself.

#[derive(Debug)]
pub struct InitiatorStart {
    pub method: Method,
    pub suites_i: Suites,
    pub x: BytesP256ElemLen,   // ephemeral private key of myself
    pub g_x: BytesP256ElemLen, // ephemeral public key of myself
}

impl Drop for InitiatorStart {
    fn drop(&mut self) {
        self.x.zeroize();
    }
}

#[derive(Debug)]
pub struct WaitM2 {
    pub method: Method,
    pub suites_i: Suites,
    pub x: BytesP256ElemLen, // ephemeral private key of the initiator
    pub message_1: BufferMessage1,
}

impl Drop for WaitM2 {
    fn drop(&mut self) {
        self.x.zeroize();
    }
}

#[derive(Debug)]
pub struct ProcessingM2 {
    pub method: Method,
    pub suite: CipherSuite,
    pub x: BytesP256ElemLen,
    pub g_y: BytesP256ElemLen,
    pub th_2: BytesHashLen,
    pub prk_2e: BytesHashLen,
    pub c_r: ConnId,
    pub id_cred_r: IdCred,
    pub sig_or_mac_2: BufferSigOrMac,
    pub ciphertext_2: BufferCiphertext2,
    pub ead_2: Option<EADItem>,
}

impl Drop for ProcessingM2 {
    fn drop(&mut self) {
        self.x.zeroize();
        self.prk_2e.zeroize();
    }
}

#[derive(Debug)]
pub struct ProcessedM2 {
    pub method: Method,
    pub suite: CipherSuite,
    pub prk_3e2m: BytesHashLen,
    pub prk_4e3m: BytesHashLen,
    pub th_3: BytesHashLen,
}

impl Drop for ProcessedM2 {
    fn drop(&mut self) {
        self.prk_3e2m.zeroize();
        self.prk_4e3m.zeroize();
    }
}

#[derive(Debug)]
pub struct ResponderStart {
    pub suites_r: Suites,
    pub y: BytesP256ElemLen,   // ephemeral private key of myself
    pub g_y: BytesP256ElemLen, // ephemeral public key of myself
}

impl Drop for ResponderStart {
    fn drop(&mut self) {
        self.y.zeroize();
    }
}

#[derive(Debug)]
pub struct ProcessingM1 {
    pub method: Method,
    pub suite: CipherSuite,
    pub y: BytesP256ElemLen,
    pub g_y: BytesP256ElemLen,
    pub g_x: BytesP256ElemLen, // ephemeral public key of the initiator
    pub c_i: ConnId,
    pub message_1: BufferMessage1,
}

impl Drop for ProcessingM1 {
    fn drop(&mut self) {
        self.y.zeroize();
    }
}

#[derive(Debug)]
pub struct WaitM3 {
    pub method: Method,
    pub suite: CipherSuite,
    pub y: BytesP256ElemLen, // ephemeral private key of the responder
    pub prk_3e2m: BytesHashLen,
    pub th_3: BytesHashLen,
}

impl Drop for WaitM3 {
    fn drop(&mut self) {
        self.y.zeroize();
        self.prk_3e2m.zeroize();
    }
}

#[derive(Debug)]
pub struct ProcessingM3 {
    pub method: Method,
    pub suite: CipherSuite,
    pub y: BytesP256ElemLen,
    pub prk_3e2m: BytesHashLen,
    pub th_3: BytesHashLen,
    pub id_cred_i: IdCred,
    pub sig_or_mac_3: BufferSigOrMac,
    pub ciphertext_3: BufferCiphertext3,
    pub ead_3: Option<EADItem>,
}

impl Drop for ProcessingM3 {
    fn drop(&mut self) {
        self.y.zeroize();
        self.prk_3e2m.zeroize();
    }
}

/// A session holding `prk_out` is complete; `prk_4e3m` and `th_4` stay
/// around only to seal/open the optional message_4.
#[derive(Debug)]
pub struct Completed {
    pub suite: CipherSuite,
    pub prk_out: BytesHashLen,
    pub prk_4e3m: BytesHashLen,
    pub th_4: BytesHashLen,
}

impl Drop for Completed {
    fn drop(&mut self) {
        self.prk_out.zeroize();
        self.prk_4e3m.zeroize();
    }
}
