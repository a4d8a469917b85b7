//! Protocol internals: transcript hashes, the key schedule, the
//! signature-or-MAC engine, ciphertext handling, and the per-message
//! processing functions driven by the typestate API in the crate root.

use tarn_shared::*;
use zeroize::Zeroize;

// EDHOC-KDF labels. PRK_out shares label 7 with IV_4; the PRK argument
// disambiguates.
const LABEL_KEYSTREAM_2: u8 = 0;
const LABEL_MAC_2: u8 = 2;
const LABEL_K_3: u8 = 3;
const LABEL_IV_3: u8 = 4;
const LABEL_MAC_3: u8 = 5;
const LABEL_K_4: u8 = 6;
const LABEL_IV_4: u8 = 7;
const LABEL_PRK_OUT: u8 = 7;

/// Exporter labels for the OSCORE master secret and salt.
pub const EXPORTER_LABEL_OSCORE_SECRET: u8 = 0;
pub const EXPORTER_LABEL_OSCORE_SALT: u8 = 1;

pub const OSCORE_SECRET_LEN: usize = 16;
pub const OSCORE_SALT_LEN: usize = 8;

// to-be-signed and MAC context data span (ID_CRED, TH, CRED, EAD)
const MAX_SIG_INPUT_LEN: usize = MAX_KDF_CONTEXT_LEN;

/// `EDHOC-KDF(prk, label, context, len)`: HKDF-Expand with the CBOR
/// sequence `(label, bstr context, len)` as info.
pub fn edhoc_kdf<C: Crypto>(
    crypto: &mut C,
    prk: &BytesHashLen,
    label: u8,
    context: &[u8],
    length: usize,
) -> Result<BytesMaxBuffer, Error> {
    let mut info = [0u8; MAX_INFO_LEN];
    let mut encoder = CborEncoder::new(&mut info);
    encoder.uint(label as u64)?;
    encoder.bytes(context)?;
    encoder.uint(length as u64)?;
    let info_len = encoder.position();
    if length > MAX_BUFFER_LEN {
        return Err(Error::BufferTooSmall);
    }
    Ok(crypto.hkdf_expand(prk, &info[..info_len], length))
}

/// `TH_2 = H(G_Y || message_1)` over the raw bytes as sent.
pub fn compute_th_2<C: Crypto>(
    crypto: &mut C,
    g_y: &[u8],
    message_1: &[u8],
) -> Result<BytesHashLen, Error> {
    let mut input = [0u8; P256_ELEM_LEN + MAX_MESSAGE_SIZE_LEN];
    let len = g_y.len() + message_1.len();
    if len > input.len() {
        return Err(Error::BufferTooSmall);
    }
    input[..g_y.len()].copy_from_slice(g_y);
    input[g_y.len()..len].copy_from_slice(message_1);
    Ok(crypto.sha256_digest(&input[..len]))
}

/// `TH_3 = H(TH_2 || CIPHERTEXT_2)` and `TH_4 = H(TH_3 || CIPHERTEXT_3)`.
pub fn compute_th_3_4<C: Crypto>(
    crypto: &mut C,
    th: &BytesHashLen,
    ciphertext: &[u8],
) -> Result<BytesHashLen, Error> {
    let mut input = [0u8; SHA256_DIGEST_LEN + MAX_MESSAGE_SIZE_LEN];
    let len = th.len() + ciphertext.len();
    if len > input.len() {
        return Err(Error::BufferTooSmall);
    }
    input[..th.len()].copy_from_slice(th);
    input[th.len()..len].copy_from_slice(ciphertext);
    Ok(crypto.sha256_digest(&input[..len]))
}

pub fn compute_prk_2e<C: Crypto>(crypto: &mut C, g_xy: &BytesP256ElemLen) -> BytesHashLen {
    crypto.hkdf_extract(&[], g_xy)
}

fn compute_prk_out<C: Crypto>(
    crypto: &mut C,
    prk_4e3m: &BytesHashLen,
    th_4: &BytesHashLen,
) -> Result<BytesHashLen, Error> {
    let okm = edhoc_kdf(crypto, prk_4e3m, LABEL_PRK_OUT, th_4, SHA256_DIGEST_LEN)?;
    let mut prk_out = [0u8; SHA256_DIGEST_LEN];
    prk_out.copy_from_slice(&okm[..SHA256_DIGEST_LEN]);
    Ok(prk_out)
}

/// `MAC_X = EDHOC-KDF(prk, mac_label, (ID_CRED_X, TH_n, CRED_X, ?EAD_n), mac_len)`
fn compute_mac<C: Crypto>(
    crypto: &mut C,
    prk: &BytesHashLen,
    mac_label: u8,
    th: &BytesHashLen,
    id_cred: &IdCred,
    cred: &[u8],
    ead: &Option<EADItem>,
    mac_len: usize,
) -> Result<BufferSigOrMac, Error> {
    let mut context = [0u8; MAX_SIG_INPUT_LEN];
    let mut encoder = CborEncoder::new(&mut context);
    encoder.raw(id_cred.raw.as_slice())?;
    encoder.bytes(th)?;
    encoder.raw(cred)?;
    if let Some(ead) = ead {
        encode_ead_item(&mut encoder, ead)?;
    }
    let context_len = encoder.position();

    let okm = edhoc_kdf(crypto, prk, mac_label, &context[..context_len], mac_len)?;
    BufferSigOrMac::new_from_slice(&okm[..mac_len]).map_err(|_| Error::BufferTooSmall)
}

/// The detached COSE_Sign1 input: the sequence
/// `("Signature1", ID_CRED_X, TH_n, CRED_X, ?EAD_n)` as external data and
/// `MAC_X` as payload.
fn encode_to_be_signed(
    id_cred: &IdCred,
    th: &BytesHashLen,
    cred: &[u8],
    ead: &Option<EADItem>,
    mac: &[u8],
) -> Result<([u8; MAX_SIG_INPUT_LEN], usize), Error> {
    let mut to_be_signed = [0u8; MAX_SIG_INPUT_LEN];
    let mut encoder = CborEncoder::new(&mut to_be_signed);
    encoder.text("Signature1")?;
    encoder.raw(id_cred.raw.as_slice())?;
    encoder.bytes(th)?;
    encoder.raw(cred)?;
    if let Some(ead) = ead {
        encode_ead_item(&mut encoder, ead)?;
    }
    encoder.bytes(mac)?;
    let len = encoder.position();
    Ok((to_be_signed, len))
}

/// Compute `Signature_or_MAC_n`: the MAC verbatim for a static-DH
/// authenticator, a signature over the COSE_Sign1 input otherwise.
pub fn compute_signature_or_mac<C: Crypto>(
    crypto: &mut C,
    static_dh: bool,
    suite: &CipherSuite,
    sk: &BytesP256ElemLen,
    prk: &BytesHashLen,
    mac_label: u8,
    th: &BytesHashLen,
    id_cred: &IdCred,
    cred: &[u8],
    ead: &Option<EADItem>,
) -> Result<BufferSigOrMac, Error> {
    let mac = compute_mac(crypto, prk, mac_label, th, id_cred, cred, ead, suite.mac_len)?;
    if static_dh {
        Ok(mac)
    } else {
        let (to_be_signed, len) = encode_to_be_signed(id_cred, th, cred, ead, mac.as_slice())?;
        let signature = crypto.ecdsa_sign(sk, &to_be_signed[..len])?;
        BufferSigOrMac::new_from_slice(&signature).map_err(|_| Error::BufferTooSmall)
    }
}

pub fn verify_signature_or_mac<C: Crypto>(
    crypto: &mut C,
    static_dh: bool,
    suite: &CipherSuite,
    pk: &BytesP256ElemLen,
    prk: &BytesHashLen,
    mac_label: u8,
    th: &BytesHashLen,
    id_cred: &IdCred,
    cred: &[u8],
    ead: &Option<EADItem>,
    received: &BufferSigOrMac,
) -> Result<(), Error> {
    let mac = compute_mac(crypto, prk, mac_label, th, id_cred, cred, ead, suite.mac_len)?;
    if static_dh {
        if received.as_slice() == mac.as_slice() {
            Ok(())
        } else {
            Err(Error::AuthFailed)
        }
    } else {
        let (to_be_signed, len) = encode_to_be_signed(id_cred, th, cred, ead, mac.as_slice())?;
        let signature: BytesEcdsaSig = received
            .as_slice()
            .try_into()
            .map_err(|_| Error::AuthFailed)?;
        crypto
            .ecdsa_verify(pk, &to_be_signed[..len], &signature)
            .map_err(|_| Error::AuthFailed)
    }
}

/// CIPHERTEXT_2 is the plaintext XORed with `KEYSTREAM_2`; decryption is
/// the same operation.
fn xor_keystream_2<C: Crypto>(
    crypto: &mut C,
    prk_2e: &BytesHashLen,
    th_2: &BytesHashLen,
    input: &[u8],
) -> Result<EdhocMessageBuffer, Error> {
    let mut keystream = edhoc_kdf(crypto, prk_2e, LABEL_KEYSTREAM_2, th_2, input.len())?;
    let mut output = EdhocMessageBuffer::new();
    for (i, byte) in input.iter().enumerate() {
        output
            .push(byte ^ keystream[i])
            .map_err(|_| Error::BufferTooSmall)?;
    }
    keystream.zeroize();
    Ok(output)
}

/// `("Encrypt0", h'', TH_n)`, the external data for CIPHERTEXT_3/4.
fn encode_enc_structure(th: &BytesHashLen) -> Result<([u8; 48], usize), Error> {
    let mut enc_structure = [0u8; 48];
    let mut encoder = CborEncoder::new(&mut enc_structure);
    encoder.text("Encrypt0")?;
    encoder.bytes(&[])?;
    encoder.bytes(th)?;
    let len = encoder.position();
    Ok((enc_structure, len))
}

fn derive_aead_key_iv<C: Crypto>(
    crypto: &mut C,
    suite: &CipherSuite,
    prk: &BytesHashLen,
    th: &BytesHashLen,
    k_label: u8,
    iv_label: u8,
) -> Result<(BytesCcmKeyLen, BytesCcmIvLen), Error> {
    if !matches!(
        suite.aead,
        AeadAlg::AesCcm16_64_128 | AeadAlg::AesCcm16_128_128
    ) {
        return Err(Error::UnsupportedSuite);
    }
    let okm = edhoc_kdf(crypto, prk, k_label, th, suite.aead.key_len())?;
    let mut key = [0u8; AES_CCM_KEY_LEN];
    key.copy_from_slice(&okm[..AES_CCM_KEY_LEN]);
    let okm = edhoc_kdf(crypto, prk, iv_label, th, suite.aead.iv_len())?;
    let mut iv = [0u8; AES_CCM_IV_LEN];
    iv.copy_from_slice(&okm[..AES_CCM_IV_LEN]);
    Ok((key, iv))
}

fn encrypt_ciphertext_3_4<C: Crypto>(
    crypto: &mut C,
    suite: &CipherSuite,
    prk: &BytesHashLen,
    th: &BytesHashLen,
    k_label: u8,
    iv_label: u8,
    plaintext: &[u8],
) -> Result<EdhocMessageBuffer, Error> {
    let (mut key, iv) = derive_aead_key_iv(crypto, suite, prk, th, k_label, iv_label)?;
    let (enc_structure, enc_len) = encode_enc_structure(th)?;
    let result = crypto.aes_ccm_encrypt(
        &key,
        &iv,
        suite.aead.tag_len(),
        &enc_structure[..enc_len],
        plaintext,
    );
    key.zeroize();
    result
}

fn decrypt_ciphertext_3_4<C: Crypto>(
    crypto: &mut C,
    suite: &CipherSuite,
    prk: &BytesHashLen,
    th: &BytesHashLen,
    k_label: u8,
    iv_label: u8,
    ciphertext: &[u8],
) -> Result<EdhocMessageBuffer, Error> {
    let (mut key, iv) = derive_aead_key_iv(crypto, suite, prk, th, k_label, iv_label)?;
    let (enc_structure, enc_len) = encode_enc_structure(th)?;
    let result = crypto.aes_ccm_decrypt_verify(
        &key,
        &iv,
        suite.aead.tag_len(),
        &enc_structure[..enc_len],
        ciphertext,
    );
    key.zeroize();
    result
}

// --- plaintext and message encoding ---

/// ID_CRED on the wire: a `{4: kid}` map with a 1-byte kid collapses into
/// the bare int image of that byte.
fn encode_id_cred(encoder: &mut CborEncoder, id_cred: &IdCred) -> Result<(), Error> {
    if let IdCredKind::Kid(kid) = &id_cred.kind {
        let kid = kid.as_slice();
        if kid.len() == 1 && CborDecoder::is_int_byte(kid[0]) {
            return encoder.raw(&[kid[0]]);
        }
    }
    encoder.raw(id_cred.raw.as_slice())
}

pub fn encode_plaintext_2(
    c_r: &ConnId,
    id_cred_r: &IdCred,
    sig_or_mac_2: &BufferSigOrMac,
    ead_2: &Option<EADItem>,
) -> Result<BufferPlaintext2, Error> {
    let mut plaintext = [0u8; MAX_MESSAGE_SIZE_LEN];
    let mut encoder = CborEncoder::new(&mut plaintext);
    c_r.encode(&mut encoder)?;
    encode_id_cred(&mut encoder, id_cred_r)?;
    encoder.bytes(sig_or_mac_2.as_slice())?;
    if let Some(ead_2) = ead_2 {
        encode_ead_item(&mut encoder, ead_2)?;
    }
    let len = encoder.position();
    BufferPlaintext2::new_from_slice(&plaintext[..len]).map_err(|_| Error::BufferTooSmall)
}

pub fn encode_plaintext_3(
    id_cred_i: &IdCred,
    sig_or_mac_3: &BufferSigOrMac,
    ead_3: &Option<EADItem>,
) -> Result<BufferPlaintext3, Error> {
    let mut plaintext = [0u8; MAX_MESSAGE_SIZE_LEN];
    let mut encoder = CborEncoder::new(&mut plaintext);
    encode_id_cred(&mut encoder, id_cred_i)?;
    encoder.bytes(sig_or_mac_3.as_slice())?;
    if let Some(ead_3) = ead_3 {
        encode_ead_item(&mut encoder, ead_3)?;
    }
    let len = encoder.position();
    BufferPlaintext3::new_from_slice(&plaintext[..len]).map_err(|_| Error::BufferTooSmall)
}

pub fn encode_plaintext_4(ead_4: &Option<EADItem>) -> Result<EdhocMessageBuffer, Error> {
    let mut plaintext = [0u8; MAX_MESSAGE_SIZE_LEN];
    let mut encoder = CborEncoder::new(&mut plaintext);
    if let Some(ead_4) = ead_4 {
        encode_ead_item(&mut encoder, ead_4)?;
    }
    let len = encoder.position();
    EdhocMessageBuffer::new_from_slice(&plaintext[..len]).map_err(|_| Error::BufferTooSmall)
}

fn encode_suites(encoder: &mut CborEncoder, suites: &Suites) -> Result<(), Error> {
    if suites.len() == 1 {
        encoder.uint(suites.as_slice()[0] as u64)
    } else {
        encoder.array(suites.len())?;
        for &label in suites.as_slice() {
            encoder.uint(label as u64)?;
        }
        Ok(())
    }
}

pub fn encode_message_1(
    method: Method,
    suites_i: &Suites,
    g_x: &BytesP256ElemLen,
    c_i: &ConnId,
    ead_1: &Option<EADItem>,
) -> Result<BufferMessage1, Error> {
    let mut message = [0u8; MAX_MESSAGE_SIZE_LEN];
    let mut encoder = CborEncoder::new(&mut message);
    encoder.uint(method as u64)?;
    encode_suites(&mut encoder, suites_i)?;
    encoder.bytes(g_x)?;
    c_i.encode(&mut encoder)?;
    if let Some(ead_1) = ead_1 {
        encode_ead_item(&mut encoder, ead_1)?;
    }
    let len = encoder.position();
    BufferMessage1::new_from_slice(&message[..len]).map_err(|_| Error::BufferTooSmall)
}

pub fn encode_message_2(
    g_y: &BytesP256ElemLen,
    ciphertext_2: &[u8],
    c_r: &ConnId,
) -> Result<BufferMessage2, Error> {
    let mut message = [0u8; MAX_MESSAGE_SIZE_LEN];
    let mut encoder = CborEncoder::new(&mut message);
    encoder.bytes_header(g_y.len() + ciphertext_2.len())?;
    encoder.raw(g_y)?;
    encoder.raw(ciphertext_2)?;
    c_r.encode(&mut encoder)?;
    let len = encoder.position();
    BufferMessage2::new_from_slice(&message[..len]).map_err(|_| Error::BufferTooSmall)
}

pub fn encode_message_3(ciphertext_3: &[u8]) -> Result<BufferMessage3, Error> {
    let mut message = [0u8; MAX_MESSAGE_SIZE_LEN];
    let mut encoder = CborEncoder::new(&mut message);
    encoder.bytes(ciphertext_3)?;
    let len = encoder.position();
    BufferMessage3::new_from_slice(&message[..len]).map_err(|_| Error::BufferTooSmall)
}

pub fn encode_message_4(ciphertext_4: &[u8]) -> Result<BufferMessage4, Error> {
    encode_message_3(ciphertext_4)
}

pub fn encode_message_error(code: u8, info: &PeerErrorInfo) -> Result<EdhocMessageBuffer, Error> {
    let mut message = [0u8; MAX_MESSAGE_SIZE_LEN];
    let mut encoder = CborEncoder::new(&mut message);
    encoder.uint(code as u64)?;
    match info {
        PeerErrorInfo::None => {}
        PeerErrorInfo::Diagnostic(diagnostic) => {
            let text = core::str::from_utf8(diagnostic.as_slice())
                .map_err(|_| Error::CborMalformed)?;
            encoder.text(text)?;
        }
        PeerErrorInfo::SuitesR(suites) => encode_suites(&mut encoder, suites)?,
    }
    let len = encoder.position();
    EdhocMessageBuffer::new_from_slice(&message[..len]).map_err(|_| Error::BufferTooSmall)
}

fn fail_on_error_message(message: &[u8]) -> Result<(), Error> {
    if is_error_message(message) {
        Err(Error::ErrorMessageReceived(parse_message_error(message)?))
    } else {
        Ok(())
    }
}

// --- initiator side ---

pub fn i_prepare_message_1<C: Crypto>(
    state: &InitiatorStart,
    _crypto: &mut C,
    c_i: ConnId,
    ead_1: &Option<EADItem>,
) -> Result<(WaitM2, BufferMessage1), Error> {
    let selected = state.suites_i.selected().ok_or(Error::UnsupportedSuite)?;
    if !suite_supported(selected) {
        return Err(Error::UnsupportedSuite);
    }
    let message_1 = encode_message_1(state.method, &state.suites_i, &state.g_x, &c_i, ead_1)?;
    Ok((
        WaitM2 {
            method: state.method,
            suites_i: state.suites_i,
            x: state.x,
            message_1,
        },
        message_1,
    ))
}

pub fn i_parse_message_2<C: Crypto>(
    state: &WaitM2,
    crypto: &mut C,
    message_2: &BufferMessage2,
) -> Result<(ProcessingM2, ConnId, IdCred, Option<EADItem>), Error> {
    fail_on_error_message(message_2.as_slice())?;

    let selected = state.suites_i.selected().ok_or(Error::UnsupportedSuite)?;
    let suite = get_suite(selected)?;

    let (g_y_ciphertext_2, c_r) = parse_message_2(message_2)?;
    let g_y_len = suite.ecdh_curve.public_key_len();
    if g_y_ciphertext_2.len <= g_y_len {
        return Err(Error::CborMalformed);
    }
    let mut g_y = [0u8; P256_ELEM_LEN];
    g_y.copy_from_slice(&g_y_ciphertext_2.as_slice()[..g_y_len]);
    let ciphertext_2 = BufferCiphertext2::new_from_slice(&g_y_ciphertext_2.as_slice()[g_y_len..])
        .map_err(|_| Error::BufferTooSmall)?;

    let th_2 = compute_th_2(crypto, &g_y, state.message_1.as_slice())?;
    let mut g_xy = crypto.p256_ecdh(&state.x, &g_y)?;
    let prk_2e = compute_prk_2e(crypto, &g_xy);
    g_xy.zeroize();

    let plaintext_2 = xor_keystream_2(crypto, &prk_2e, &th_2, ciphertext_2.as_slice())?;
    let parsed = decode_plaintext_2(&plaintext_2)?;
    // the identifier repeats inside the protected plaintext; a mismatch
    // means someone tampered with the outer one
    if parsed.c_r != c_r {
        return Err(Error::AuthFailed);
    }

    Ok((
        ProcessingM2 {
            method: state.method,
            suite,
            x: state.x,
            g_y,
            th_2,
            prk_2e,
            c_r,
            id_cred_r: parsed.id_cred_r,
            sig_or_mac_2: parsed.sig_or_mac_2,
            ciphertext_2,
            ead_2: parsed.ead_2.clone(),
        },
        c_r,
        parsed.id_cred_r,
        parsed.ead_2,
    ))
}

pub fn i_verify_message_2<C: Crypto>(
    state: &ProcessingM2,
    crypto: &mut C,
    valid_cred_r: &Credential,
    i: &BytesP256ElemLen,
) -> Result<ProcessedM2, Error> {
    let prk_3e2m = if state.method.responder_static_dh() {
        let mut g_rx = crypto.p256_ecdh(&state.x, &valid_cred_r.public_key)?;
        let prk = crypto.hkdf_extract(&state.prk_2e, &g_rx);
        g_rx.zeroize();
        prk
    } else {
        state.prk_2e
    };

    verify_signature_or_mac(
        crypto,
        state.method.responder_static_dh(),
        &state.suite,
        &valid_cred_r.public_key,
        &prk_3e2m,
        LABEL_MAC_2,
        &state.th_2,
        &state.id_cred_r,
        valid_cred_r.value.as_slice(),
        &state.ead_2,
        &state.sig_or_mac_2,
    )?;

    let th_3 = compute_th_3_4(crypto, &state.th_2, state.ciphertext_2.as_slice())?;
    let prk_4e3m = if state.method.initiator_static_dh() {
        let mut g_iy = crypto.p256_ecdh(i, &state.g_y)?;
        let prk = crypto.hkdf_extract(&prk_3e2m, &g_iy);
        g_iy.zeroize();
        prk
    } else {
        prk_3e2m
    };

    Ok(ProcessedM2 {
        method: state.method,
        suite: state.suite,
        prk_3e2m,
        prk_4e3m,
        th_3,
    })
}

pub fn i_prepare_message_3<C: Crypto>(
    state: &ProcessedM2,
    crypto: &mut C,
    i: &BytesP256ElemLen,
    id_cred_i: &IdCred,
    cred_i: &Credential,
    ead_3: &Option<EADItem>,
) -> Result<(Completed, BufferMessage3, BytesHashLen), Error> {
    let sig_or_mac_3 = compute_signature_or_mac(
        crypto,
        state.method.initiator_static_dh(),
        &state.suite,
        i,
        &state.prk_4e3m,
        LABEL_MAC_3,
        &state.th_3,
        id_cred_i,
        cred_i.value.as_slice(),
        ead_3,
    )?;

    let plaintext_3 = encode_plaintext_3(id_cred_i, &sig_or_mac_3, ead_3)?;
    let ciphertext_3 = encrypt_ciphertext_3_4(
        crypto,
        &state.suite,
        &state.prk_3e2m,
        &state.th_3,
        LABEL_K_3,
        LABEL_IV_3,
        plaintext_3.as_slice(),
    )?;
    let message_3 = encode_message_3(ciphertext_3.as_slice())?;

    let th_4 = compute_th_3_4(crypto, &state.th_3, ciphertext_3.as_slice())?;
    let prk_out = compute_prk_out(crypto, &state.prk_4e3m, &th_4)?;

    Ok((
        Completed {
            suite: state.suite,
            prk_out,
            prk_4e3m: state.prk_4e3m,
            th_4,
        },
        message_3,
        prk_out,
    ))
}

pub fn i_process_message_4<C: Crypto>(
    state: &Completed,
    crypto: &mut C,
    message_4: &BufferMessage4,
) -> Result<Option<EADItem>, Error> {
    fail_on_error_message(message_4.as_slice())?;
    let ciphertext_4 = parse_message_4(message_4)?;
    let plaintext_4 = decrypt_ciphertext_3_4(
        crypto,
        &state.suite,
        &state.prk_4e3m,
        &state.th_4,
        LABEL_K_4,
        LABEL_IV_4,
        ciphertext_4.as_slice(),
    )?;
    decode_plaintext_4(&plaintext_4)
}

// --- responder side ---

pub fn r_process_message_1<C: Crypto>(
    state: &ResponderStart,
    _crypto: &mut C,
    message_1: &BufferMessage1,
) -> Result<(ProcessingM1, Option<EADItem>), Error> {
    let parsed = parse_message_1(message_1)?;
    let method = Method::from_u8(parsed.method)?;

    let selected = parsed.suites_i.selected().ok_or(Error::CborMalformed)?;
    if !state.suites_r.contains(selected) || !suite_supported(selected) {
        return Err(Error::SuiteMismatch(state.suites_r));
    }
    let suite = get_suite(selected)?;

    if parsed.g_x.len != suite.ecdh_curve.public_key_len() {
        return Err(Error::CborMalformed);
    }
    let mut g_x = [0u8; P256_ELEM_LEN];
    g_x.copy_from_slice(parsed.g_x.as_slice());

    Ok((
        ProcessingM1 {
            method,
            suite,
            y: state.y,
            g_y: state.g_y,
            g_x,
            c_i: parsed.c_i,
            message_1: *message_1,
        },
        parsed.ead_1,
    ))
}

pub fn r_prepare_message_2<C: Crypto>(
    state: &ProcessingM1,
    crypto: &mut C,
    cred_r: &Credential,
    id_cred_r: &IdCred,
    r: &BytesP256ElemLen,
    c_r: ConnId,
    ead_2: &Option<EADItem>,
) -> Result<(WaitM3, BufferMessage2), Error> {
    let th_2 = compute_th_2(crypto, &state.g_y, state.message_1.as_slice())?;
    let mut g_xy = crypto.p256_ecdh(&state.y, &state.g_x)?;
    let prk_2e = compute_prk_2e(crypto, &g_xy);
    g_xy.zeroize();

    let prk_3e2m = if state.method.responder_static_dh() {
        let mut g_rx = crypto.p256_ecdh(r, &state.g_x)?;
        let prk = crypto.hkdf_extract(&prk_2e, &g_rx);
        g_rx.zeroize();
        prk
    } else {
        prk_2e
    };

    let sig_or_mac_2 = compute_signature_or_mac(
        crypto,
        state.method.responder_static_dh(),
        &state.suite,
        r,
        &prk_3e2m,
        LABEL_MAC_2,
        &th_2,
        id_cred_r,
        cred_r.value.as_slice(),
        ead_2,
    )?;

    let plaintext_2 = encode_plaintext_2(&c_r, id_cred_r, &sig_or_mac_2, ead_2)?;
    let ciphertext_2 = xor_keystream_2(crypto, &prk_2e, &th_2, plaintext_2.as_slice())?;
    let message_2 = encode_message_2(&state.g_y, ciphertext_2.as_slice(), &c_r)?;

    let th_3 = compute_th_3_4(crypto, &th_2, ciphertext_2.as_slice())?;

    Ok((
        WaitM3 {
            method: state.method,
            suite: state.suite,
            y: state.y,
            prk_3e2m,
            th_3,
        },
        message_2,
    ))
}

pub fn r_parse_message_3<C: Crypto>(
    state: &WaitM3,
    crypto: &mut C,
    message_3: &BufferMessage3,
) -> Result<(ProcessingM3, IdCred, Option<EADItem>), Error> {
    fail_on_error_message(message_3.as_slice())?;
    let ciphertext_3 = parse_message_3(message_3)?;
    let plaintext_3 = decrypt_ciphertext_3_4(
        crypto,
        &state.suite,
        &state.prk_3e2m,
        &state.th_3,
        LABEL_K_3,
        LABEL_IV_3,
        ciphertext_3.as_slice(),
    )?;
    let parsed = decode_plaintext_3(&plaintext_3)?;

    Ok((
        ProcessingM3 {
            method: state.method,
            suite: state.suite,
            y: state.y,
            prk_3e2m: state.prk_3e2m,
            th_3: state.th_3,
            id_cred_i: parsed.id_cred_i,
            sig_or_mac_3: parsed.sig_or_mac_3,
            ciphertext_3,
            ead_3: parsed.ead_3.clone(),
        },
        parsed.id_cred_i,
        parsed.ead_3,
    ))
}

pub fn r_verify_message_3<C: Crypto>(
    state: &ProcessingM3,
    crypto: &mut C,
    valid_cred_i: &Credential,
) -> Result<(Completed, BytesHashLen), Error> {
    let prk_4e3m = if state.method.initiator_static_dh() {
        let mut g_iy = crypto.p256_ecdh(&state.y, &valid_cred_i.public_key)?;
        let prk = crypto.hkdf_extract(&state.prk_3e2m, &g_iy);
        g_iy.zeroize();
        prk
    } else {
        state.prk_3e2m
    };

    verify_signature_or_mac(
        crypto,
        state.method.initiator_static_dh(),
        &state.suite,
        &valid_cred_i.public_key,
        &prk_4e3m,
        LABEL_MAC_3,
        &state.th_3,
        &state.id_cred_i,
        valid_cred_i.value.as_slice(),
        &state.ead_3,
        &state.sig_or_mac_3,
    )?;

    let th_4 = compute_th_3_4(crypto, &state.th_3, state.ciphertext_3.as_slice())?;
    let prk_out = compute_prk_out(crypto, &prk_4e3m, &th_4)?;

    Ok((
        Completed {
            suite: state.suite,
            prk_out,
            prk_4e3m,
            th_4,
        },
        prk_out,
    ))
}

pub fn r_prepare_message_4<C: Crypto>(
    state: &Completed,
    crypto: &mut C,
    ead_4: &Option<EADItem>,
) -> Result<BufferMessage4, Error> {
    let plaintext_4 = encode_plaintext_4(ead_4)?;
    let ciphertext_4 = encrypt_ciphertext_3_4(
        crypto,
        &state.suite,
        &state.prk_4e3m,
        &state.th_4,
        LABEL_K_4,
        LABEL_IV_4,
        plaintext_4.as_slice(),
    )?;
    encode_message_4(ciphertext_4.as_slice())
}

// --- exporter ---

/// `EDHOC-Exporter(label, context, length)`, keyed by PRK_out alone.
pub fn edhoc_exporter<C: Crypto>(
    state: &Completed,
    crypto: &mut C,
    label: u8,
    context: &[u8],
    length: usize,
) -> Result<BytesMaxBuffer, Error> {
    edhoc_kdf(crypto, &state.prk_out, label, context, length)
}

/// Replace PRK_out with a derivation over the given context, e.g. for a
/// lightweight rekey without a new handshake.
pub fn edhoc_key_update<C: Crypto>(
    state: &mut Completed,
    crypto: &mut C,
    context: &[u8],
) -> Result<BytesHashLen, Error> {
    let okm = edhoc_kdf(crypto, &state.prk_out, LABEL_PRK_OUT, context, SHA256_DIGEST_LEN)?;
    state.prk_out.copy_from_slice(&okm[..SHA256_DIGEST_LEN]);
    Ok(state.prk_out)
}

#[cfg(test)]
mod test {
    use super::*;
    use hexlit::hex;

    #[test]
    fn test_kdf_info_encoding() {
        // info for label 7, a 2-byte context and length 32:
        // (7, h'ABCD', 32) as a CBOR sequence
        let mut info = [0u8; MAX_INFO_LEN];
        let mut encoder = CborEncoder::new(&mut info);
        encoder.uint(7).unwrap();
        encoder.bytes(&[0xAB, 0xCD]).unwrap();
        encoder.uint(32).unwrap();
        assert_eq!(encoder.as_slice(), &hex!("0742abcd1820"));
    }

    #[test]
    fn test_enc_structure() {
        let th = [0x22u8; SHA256_DIGEST_LEN];
        let (enc_structure, len) = encode_enc_structure(&th).unwrap();
        // "Encrypt0", h'', bstr th
        assert_eq!(&enc_structure[..9], &hex!("68456e637279707430"));
        assert_eq!(enc_structure[9], 0x40);
        assert_eq!(enc_structure[10], 0x58);
        assert_eq!(enc_structure[11], 32);
        assert_eq!(len, 12 + 32);
    }

    #[test]
    fn test_encode_message_1() {
        // reproduces the lake traces message_1 for method 3, suites [6, 2]
        let g_x: BytesP256ElemLen =
            hex!("8af6f430ebe18d34184017a9a11bf511c8dff8f834730b96c1b7c8dbca2fc3b6");
        let suites = Suites::from_slice(&[6, 2]).unwrap();
        let message_1 = encode_message_1(
            Method::StatStat,
            &suites,
            &g_x,
            &ConnId::Int(-24),
            &None,
        )
        .unwrap();
        assert_eq!(
            message_1.as_slice(),
            &hex!("0382060258208af6f430ebe18d34184017a9a11bf511c8dff8f834730b96c1b7c8dbca2fc3b637")
        );
    }

    #[test]
    fn test_encode_message_2_splits_back() {
        let g_y: BytesP256ElemLen = [0x5A; 32];
        let ciphertext_2 = [0xC2u8; 24];
        let c_r = ConnId::Int(8);
        let message_2 = encode_message_2(&g_y, &ciphertext_2, &c_r).unwrap();

        let (g_y_ciphertext_2, parsed_c_r) = parse_message_2(&message_2).unwrap();
        assert_eq!(parsed_c_r, c_r);
        assert_eq!(&g_y_ciphertext_2.as_slice()[..32], &g_y);
        assert_eq!(&g_y_ciphertext_2.as_slice()[32..], &ciphertext_2);
    }

    #[test]
    fn test_plaintext_2_roundtrip() {
        let c_r = ConnId::Int(-8);
        let id_cred_r = IdCred::from_kid(&hex!("32")).unwrap();
        let sig_or_mac = BufferSigOrMac::new_from_slice(&[0xAA; 8]).unwrap();
        let plaintext = encode_plaintext_2(&c_r, &id_cred_r, &sig_or_mac, &None).unwrap();

        // kid h'32' is the int -19 on the wire, a single byte
        assert_eq!(plaintext.as_slice()[1], 0x32);

        let parsed = decode_plaintext_2(&plaintext).unwrap();
        assert_eq!(parsed.c_r, c_r);
        assert_eq!(parsed.id_cred_r, id_cred_r);
        assert_eq!(parsed.sig_or_mac_2, sig_or_mac);
        assert!(parsed.ead_2.is_none());
    }

    #[test]
    fn test_plaintext_3_roundtrip_with_ead() {
        let id_cred_i = IdCred::from_kid(&hex!("a11f")).unwrap();
        let sig_or_mac = BufferSigOrMac::new_from_slice(&[0xBB; 64]).unwrap();
        let ead = EADItem {
            label: 2,
            is_critical: false,
            value: Some(EdhocMessageBuffer::new_from_slice(&hex!("43010203")).unwrap()),
        };
        let plaintext = encode_plaintext_3(&id_cred_i, &sig_or_mac, &Some(ead.clone())).unwrap();

        // a 2-byte kid keeps the full map form
        assert_eq!(plaintext.as_slice()[0], 0xa1);

        let parsed = decode_plaintext_3(&plaintext).unwrap();
        assert_eq!(parsed.id_cred_i, id_cred_i);
        assert_eq!(parsed.sig_or_mac_3, sig_or_mac);
        assert_eq!(parsed.ead_3, Some(ead));
    }

    #[test]
    fn test_error_message_roundtrip() {
        let suites = Suites::from_slice(&[0, 2]).unwrap();
        let message = encode_message_error(
            ERR_CODE_WRONG_SELECTED_SUITE,
            &PeerErrorInfo::SuitesR(suites),
        )
        .unwrap();
        assert_eq!(message.as_slice(), &hex!("02820002"));
        assert!(is_error_message(message.as_slice()));

        let parsed = parse_message_error(message.as_slice()).unwrap();
        assert_eq!(parsed.code, ERR_CODE_WRONG_SELECTED_SUITE);
        assert_eq!(parsed.info, PeerErrorInfo::SuitesR(suites));
    }
}
