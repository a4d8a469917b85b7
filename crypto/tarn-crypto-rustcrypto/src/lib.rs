//! Software implementation of the [Crypto] trait over the RustCrypto
//! crates: `p256` for ECDH and ES256, `sha2`, `hkdf`, and `aes`/`ccm` for
//! the AEAD.
#![no_std]

use ccm::aead::generic_array::GenericArray;
use ccm::aead::{AeadInPlace, KeyInit};
use ccm::consts::{U13, U16, U8};
use ccm::Ccm;
use hkdf::Hkdf;
use p256::ecdsa::signature::{Signer, Verifier};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use rand_core::{CryptoRng, RngCore};
use sha2::{Digest, Sha256};

use tarn_shared::{
    BytesCcmIvLen, BytesCcmKeyLen, BytesEcdsaSig, BytesHashLen, BytesMaxBuffer,
    BytesP256ElemLen, Crypto as CryptoTrait, EdhocMessageBuffer, Error, MAX_BUFFER_LEN,
};

type AesCcm16_64_128 = Ccm<aes::Aes128, U8, U13>;
type AesCcm16_128_128 = Ccm<aes::Aes128, U16, U13>;

pub struct Crypto<Rng: RngCore + CryptoRng> {
    rng: Rng,
}

impl<Rng: RngCore + CryptoRng> Crypto<Rng> {
    pub const fn new(rng: Rng) -> Self {
        Self { rng }
    }
}

impl<Rng: RngCore + CryptoRng> core::fmt::Debug for Crypto<Rng> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("tarn_crypto_rustcrypto::Crypto").finish()
    }
}

/// Lift an x-coordinate back onto the curve. The y parity is not carried on
/// the wire; ECDH is parity-invariant and verification tries both lifts.
fn public_key_from_x(x: &BytesP256ElemLen, tag: u8) -> Result<p256::PublicKey, Error> {
    let mut sec1 = [0u8; 1 + 32];
    sec1[0] = tag;
    sec1[1..].copy_from_slice(x);
    p256::PublicKey::from_sec1_bytes(&sec1).map_err(|_| Error::EcdhFailed)
}

fn secret_key_from_bytes(bytes: &BytesP256ElemLen) -> Result<p256::SecretKey, Error> {
    p256::SecretKey::from_bytes(p256::FieldBytes::from_slice(bytes))
        .map_err(|_| Error::EcdhFailed)
}

impl<Rng: RngCore + CryptoRng> CryptoTrait for Crypto<Rng> {
    fn sha256_digest(&mut self, message: &[u8]) -> BytesHashLen {
        Sha256::digest(message).into()
    }

    fn hkdf_extract(&mut self, salt: &[u8], ikm: &[u8]) -> BytesHashLen {
        let (prk, _) = Hkdf::<Sha256>::extract(Some(salt), ikm);
        prk.into()
    }

    fn hkdf_expand(&mut self, prk: &BytesHashLen, info: &[u8], length: usize) -> BytesMaxBuffer {
        let mut okm = [0u8; MAX_BUFFER_LEN];
        let hkdf = Hkdf::<Sha256>::from_prk(prk).expect("PRK is one hash long");
        hkdf.expand(info, &mut okm[..length])
            .expect("okm length fits 255 hash blocks");
        okm
    }

    fn p256_generate_key_pair(&mut self) -> (BytesP256ElemLen, BytesP256ElemLen) {
        let secret = p256::SecretKey::random(&mut self.rng);
        let public = secret.public_key().as_affine().to_encoded_point(false);

        let mut private_key = [0u8; 32];
        private_key.copy_from_slice(&secret.to_bytes());
        let mut public_key = [0u8; 32];
        public_key.copy_from_slice(public.x().expect("generated key is not at infinity"));

        (private_key, public_key)
    }

    fn p256_keypair_from_seed(
        &mut self,
        seed: &BytesP256ElemLen,
    ) -> Result<(BytesP256ElemLen, BytesP256ElemLen), Error> {
        let secret = secret_key_from_bytes(seed)?;
        let public = secret.public_key().as_affine().to_encoded_point(false);

        let mut public_key = [0u8; 32];
        public_key.copy_from_slice(public.x().ok_or(Error::EcdhFailed)?);
        Ok((*seed, public_key))
    }

    fn p256_ecdh(
        &mut self,
        private_key: &BytesP256ElemLen,
        public_key: &BytesP256ElemLen,
    ) -> Result<BytesP256ElemLen, Error> {
        let secret = secret_key_from_bytes(private_key)?;
        let public = public_key_from_x(public_key, 0x02)?;

        let shared =
            p256::ecdh::diffie_hellman(secret.to_nonzero_scalar(), public.as_affine());

        let mut shared_secret = [0u8; 32];
        shared_secret.copy_from_slice(shared.raw_secret_bytes());
        Ok(shared_secret)
    }

    fn ecdsa_sign(
        &mut self,
        private_key: &BytesP256ElemLen,
        message: &[u8],
    ) -> Result<BytesEcdsaSig, Error> {
        let signing_key =
            p256::ecdsa::SigningKey::from_bytes(p256::FieldBytes::from_slice(private_key))
                .map_err(|_| Error::SignFailed)?;
        let signature: p256::ecdsa::Signature = signing_key.sign(message);

        let mut out = [0u8; 64];
        out.copy_from_slice(&signature.to_bytes());
        Ok(out)
    }

    fn ecdsa_verify(
        &mut self,
        public_key: &BytesP256ElemLen,
        message: &[u8],
        signature: &BytesEcdsaSig,
    ) -> Result<(), Error> {
        let signature = p256::ecdsa::Signature::from_slice(signature)
            .map_err(|_| Error::VerifyFailed)?;

        for tag in [0x02, 0x03] {
            if let Ok(public) = public_key_from_x(public_key, tag) {
                let verifying_key = p256::ecdsa::VerifyingKey::from(public);
                if verifying_key.verify(message, &signature).is_ok() {
                    return Ok(());
                }
            }
        }
        Err(Error::VerifyFailed)
    }

    fn aes_ccm_encrypt(
        &mut self,
        key: &BytesCcmKeyLen,
        iv: &BytesCcmIvLen,
        tag_len: usize,
        ad: &[u8],
        plaintext: &[u8],
    ) -> Result<EdhocMessageBuffer, Error> {
        let mut buffer =
            EdhocMessageBuffer::new_from_slice(plaintext).map_err(|_| Error::BufferTooSmall)?;
        let nonce = GenericArray::from_slice(iv);

        let mut tag_bytes = [0u8; 16];
        match tag_len {
            8 => {
                let cipher = AesCcm16_64_128::new(GenericArray::from_slice(key));
                let tag = cipher
                    .encrypt_in_place_detached(nonce, ad, &mut buffer.content[..buffer.len])
                    .map_err(|_| Error::BufferTooSmall)?;
                tag_bytes[..8].copy_from_slice(&tag);
            }
            16 => {
                let cipher = AesCcm16_128_128::new(GenericArray::from_slice(key));
                let tag = cipher
                    .encrypt_in_place_detached(nonce, ad, &mut buffer.content[..buffer.len])
                    .map_err(|_| Error::BufferTooSmall)?;
                tag_bytes.copy_from_slice(&tag);
            }
            _ => return Err(Error::UnsupportedSuite),
        }

        buffer
            .extend_from_slice(&tag_bytes[..tag_len])
            .map_err(|_| Error::BufferTooSmall)?;
        Ok(buffer)
    }

    fn aes_ccm_decrypt_verify(
        &mut self,
        key: &BytesCcmKeyLen,
        iv: &BytesCcmIvLen,
        tag_len: usize,
        ad: &[u8],
        ciphertext: &[u8],
    ) -> Result<EdhocMessageBuffer, Error> {
        if ciphertext.len() < tag_len {
            return Err(Error::AeadAuthFailed);
        }
        let (body, tag) = ciphertext.split_at(ciphertext.len() - tag_len);
        let mut buffer =
            EdhocMessageBuffer::new_from_slice(body).map_err(|_| Error::BufferTooSmall)?;
        let nonce = GenericArray::from_slice(iv);

        let result = match tag_len {
            8 => AesCcm16_64_128::new(GenericArray::from_slice(key)).decrypt_in_place_detached(
                nonce,
                ad,
                &mut buffer.content[..buffer.len],
                GenericArray::from_slice(tag),
            ),
            16 => AesCcm16_128_128::new(GenericArray::from_slice(key)).decrypt_in_place_detached(
                nonce,
                ad,
                &mut buffer.content[..buffer.len],
                GenericArray::from_slice(tag),
            ),
            _ => return Err(Error::UnsupportedSuite),
        };
        result.map_err(|_| Error::AeadAuthFailed)?;
        Ok(buffer)
    }

    fn get_random_byte(&mut self) -> u8 {
        let mut byte = [0u8; 1];
        self.rng.fill_bytes(&mut byte);
        byte[0]
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use hexlit::hex;

    fn crypto() -> Crypto<rand_core::OsRng> {
        Crypto::new(rand_core::OsRng)
    }

    #[test]
    fn test_sha256() {
        // SHA-256 of the empty string
        assert_eq!(
            crypto().sha256_digest(&[]),
            hex!("e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855")
        );
    }

    #[test]
    fn test_hkdf_rfc5869_case_1() {
        let ikm = hex!("0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b");
        let salt = hex!("000102030405060708090a0b0c");
        let info = hex!("f0f1f2f3f4f5f6f7f8f9");

        let mut crypto = crypto();
        let prk = crypto.hkdf_extract(&salt, &ikm);
        assert_eq!(
            prk,
            hex!("077709362c2e32df0ddc3f0dc47bba6390b6c73bb50f9c3122ec844ad7c2b3e5")
        );

        let okm = crypto.hkdf_expand(&prk, &info, 42);
        assert_eq!(
            okm[..42],
            hex!("3cb25f25faacd57a90434f64d0362f2a2d2d0a90cf1a5a4c5db02d56ecc4c5bf34007208d5b887185865")
        );
    }

    #[test]
    fn test_ecdh_agreement() {
        let mut crypto = crypto();
        let (x, g_x) = crypto.p256_generate_key_pair();
        let (y, g_y) = crypto.p256_generate_key_pair();

        let g_xy = crypto.p256_ecdh(&x, &g_y).unwrap();
        let g_yx = crypto.p256_ecdh(&y, &g_x).unwrap();
        assert_eq!(g_xy, g_yx);
    }

    #[test]
    fn test_keypair_from_seed_is_deterministic() {
        let seed = hex!("fb13adeb6518cee5f88417660841142e830a81fe334380a953406a1305e8706b");
        let mut crypto = crypto();
        let (sk_a, pk_a) = crypto.p256_keypair_from_seed(&seed).unwrap();
        let (sk_b, pk_b) = crypto.p256_keypair_from_seed(&seed).unwrap();
        assert_eq!(sk_a, sk_b);
        assert_eq!(pk_a, pk_b);
        assert_eq!(sk_a, seed);
    }

    #[test]
    fn test_ecdsa_sign_verify() {
        let mut crypto = crypto();
        let (sk, pk) = crypto.p256_generate_key_pair();

        let message = b"message to be signed";
        let signature = crypto.ecdsa_sign(&sk, message).unwrap();
        assert!(crypto.ecdsa_verify(&pk, message, &signature).is_ok());

        // a different message must not verify
        assert_eq!(
            crypto
                .ecdsa_verify(&pk, b"another message", &signature)
                .unwrap_err(),
            Error::VerifyFailed
        );

        // neither does a corrupted signature
        let mut bad_signature = signature;
        bad_signature[17] ^= 0x40;
        assert!(crypto.ecdsa_verify(&pk, message, &bad_signature).is_err());
    }

    #[test]
    fn test_aes_ccm_roundtrip_and_tamper() {
        let key = hex!("000102030405060708090a0b0c0d0e0f");
        let iv = hex!("101112131415161718191a1b1c");
        let ad = hex!("0001020304050607");
        let plaintext = hex!("20212223");

        let mut crypto = crypto();
        for tag_len in [8usize, 16] {
            let sealed = crypto
                .aes_ccm_encrypt(&key, &iv, tag_len, &ad, &plaintext)
                .unwrap();
            assert_eq!(sealed.len, plaintext.len() + tag_len);

            let opened = crypto
                .aes_ccm_decrypt_verify(&key, &iv, tag_len, &ad, sealed.as_slice())
                .unwrap();
            assert_eq!(opened.as_slice(), &plaintext);

            // any bit flip in the ciphertext or tag must fail
            let mut tampered = sealed;
            tampered.content[1] ^= 0x01;
            assert_eq!(
                crypto
                    .aes_ccm_decrypt_verify(&key, &iv, tag_len, &ad, tampered.as_slice())
                    .unwrap_err(),
                Error::AeadAuthFailed
            );
        }
    }
}
