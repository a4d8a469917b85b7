use super::*;

/// Interface between the protocol logic and the cryptographic backends.
///
/// All operations are deterministic given their inputs, except
/// [Self::p256_generate_key_pair] and [Self::get_random_byte] which draw on
/// the backend's RNG; [Self::p256_keypair_from_seed] is the deterministic
/// variant the test vectors use.
pub trait Crypto: core::fmt::Debug {
    fn sha256_digest(&mut self, message: &[u8]) -> BytesHashLen;

    fn hkdf_extract(&mut self, salt: &[u8], ikm: &[u8]) -> BytesHashLen;

    /// HKDF-Expand; the output is valid in its first `length` bytes.
    fn hkdf_expand(&mut self, prk: &BytesHashLen, info: &[u8], length: usize) -> BytesMaxBuffer;

    fn p256_generate_key_pair(&mut self) -> (BytesP256ElemLen, BytesP256ElemLen);

    /// Derive a keypair from a seed; the seed is the only source of
    /// randomness the protocol core depends on.
    fn p256_keypair_from_seed(
        &mut self,
        seed: &BytesP256ElemLen,
    ) -> Result<(BytesP256ElemLen, BytesP256ElemLen), Error>;

    /// ECDH over the x-coordinates, as used for G_XY, G_RX and G_IY.
    fn p256_ecdh(
        &mut self,
        private_key: &BytesP256ElemLen,
        public_key: &BytesP256ElemLen,
    ) -> Result<BytesP256ElemLen, Error>;

    fn ecdsa_sign(
        &mut self,
        private_key: &BytesP256ElemLen,
        message: &[u8],
    ) -> Result<BytesEcdsaSig, Error>;

    fn ecdsa_verify(
        &mut self,
        public_key: &BytesP256ElemLen,
        message: &[u8],
        signature: &BytesEcdsaSig,
    ) -> Result<(), Error>;

    /// AES-CCM seal; returns ciphertext with the tag appended.
    fn aes_ccm_encrypt(
        &mut self,
        key: &BytesCcmKeyLen,
        iv: &BytesCcmIvLen,
        tag_len: usize,
        ad: &[u8],
        plaintext: &[u8],
    ) -> Result<EdhocMessageBuffer, Error>;

    /// AES-CCM open; fails with [Error::AeadAuthFailed] on any mismatch.
    fn aes_ccm_decrypt_verify(
        &mut self,
        key: &BytesCcmKeyLen,
        iv: &BytesCcmIvLen,
        tag_len: usize,
        ad: &[u8],
        ciphertext: &[u8],
    ) -> Result<EdhocMessageBuffer, Error>;

    fn get_random_byte(&mut self) -> u8;
}
