//! The OSCORE message transformation: plaintext assembly, nonce and AAD
//! construction, and the protect/unprotect entry points for requests and
//! responses.

use crate::coap::{code, parse_options, serialize_options, CoapOption, CoapPacket, OptionList};
use crate::coap::{PayloadBuffer, PAYLOAD_MARKER};
use crate::option::{inner_outer_option_split, merge_inner_outer, option_class, OptionClass};
use crate::option::{OBSERVE, OSCORE};
use crate::replay::MAX_SEQ_NUM;
use crate::{OscoreId, SecurityContext};
use tarn_shared::{BytesCcmIvLen, Crypto, Error, AES_CCM_IV_LEN};

pub const OSCORE_VERSION: u64 = 1;

const MAX_PIV_LEN: usize = 5;
const MAX_AAD_LEN: usize = 128;
const MAX_PLAINTEXT_LEN: usize = 320;

/// A Partial IV: the minimal big-endian encoding of a sequence number.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Piv {
    bytes: [u8; MAX_PIV_LEN],
    len: usize,
}

impl Piv {
    pub fn from_seq(seq: u64) -> Result<Self, Error> {
        if seq > MAX_SEQ_NUM {
            return Err(Error::BufferTooSmall);
        }
        let mut bytes = [0u8; MAX_PIV_LEN];
        let mut len = 0;
        let mut rest = seq;
        loop {
            len += 1;
            rest >>= 8;
            if rest == 0 {
                break;
            }
        }
        for i in 0..len {
            bytes[len - 1 - i] = (seq >> (8 * i)) as u8;
        }
        Ok(Piv { bytes, len })
    }

    pub fn from_slice(slice: &[u8]) -> Result<Self, Error> {
        if slice.is_empty() || slice.len() > MAX_PIV_LEN {
            return Err(Error::CborMalformed);
        }
        let mut bytes = [0u8; MAX_PIV_LEN];
        bytes[..slice.len()].copy_from_slice(slice);
        Ok(Piv {
            bytes,
            len: slice.len(),
        })
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.len]
    }

    pub fn to_seq(&self) -> u64 {
        self.as_slice()
            .iter()
            .fold(0u64, |acc, &b| (acc << 8) | b as u64)
    }
}

/// The request identifiers a response is bound to: `request_kid` and
/// `request_piv` in the AAD, and the nonce fallback for responses that
/// carry no PIV of their own.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RequestMeta {
    pub kid: OscoreId,
    pub piv: Piv,
}

/// `nonce = common_iv XOR (len(ID_PIV) || padded ID_PIV || padded PIV)`.
pub fn build_nonce(common_iv: &BytesCcmIvLen, id: &OscoreId, piv: &Piv) -> BytesCcmIvLen {
    let mut nonce = [0u8; AES_CCM_IV_LEN];
    nonce[0] = id.as_slice().len() as u8;
    let id_end = 1 + (AES_CCM_IV_LEN - 6 - id.as_slice().len());
    nonce[id_end..id_end + id.as_slice().len()].copy_from_slice(id.as_slice());
    let piv_start = AES_CCM_IV_LEN - piv.as_slice().len();
    nonce[piv_start..].copy_from_slice(piv.as_slice());

    for (byte, iv_byte) in nonce.iter_mut().zip(common_iv.iter()) {
        *byte ^= iv_byte;
    }
    nonce
}

/// AAD sequence: `"Encrypt0", h'', (version, [alg], request_kid,
/// request_piv, h''), class-I options`.
fn build_aad(
    ctx: &SecurityContext,
    request_kid: &OscoreId,
    request_piv: &Piv,
    class_i: &OptionList,
) -> Result<([u8; MAX_AAD_LEN], usize), Error> {
    let mut aad = [0u8; MAX_AAD_LEN];
    let mut encoder = tarn_shared::CborEncoder::new(&mut aad);
    encoder.text("Encrypt0")?;
    encoder.bytes(&[])?;
    encoder.array(5)?;
    encoder.uint(OSCORE_VERSION)?;
    encoder.array(1)?;
    encoder.int(ctx.aead_alg.cose_label())?;
    encoder.bytes(request_kid.as_slice())?;
    encoder.bytes(request_piv.as_slice())?;
    encoder.bytes(&[])?;

    let mut options_buf = [0u8; 64];
    let options_len = serialize_options(class_i, &mut options_buf)?;
    encoder.raw(&options_buf[..options_len])?;

    let len = encoder.position();
    Ok((aad, len))
}

fn class_i_options(options: &OptionList) -> Result<OptionList, Error> {
    let mut result = OptionList::new();
    for option in options.as_slice() {
        if option.number != OSCORE && option_class(option.number) == OptionClass::ClassI {
            result.push(*option)?;
        }
    }
    Ok(result)
}

/// OSCORE option value: flag byte, then PIV, kid context and kid as flagged.
fn encode_oscore_option(
    piv: Option<&Piv>,
    kid_context: Option<&[u8]>,
    kid: Option<&OscoreId>,
) -> Result<CoapOption, Error> {
    let mut value = [0u8; 2 + MAX_PIV_LEN + 32 + 7];
    let mut flags = 0u8;
    let mut pos = 1;

    if let Some(piv) = piv {
        flags |= piv.as_slice().len() as u8;
        value[pos..pos + piv.as_slice().len()].copy_from_slice(piv.as_slice());
        pos += piv.as_slice().len();
    }
    if let Some(kid_context) = kid_context {
        flags |= 1 << 4;
        value[pos] = kid_context.len() as u8;
        pos += 1;
        value[pos..pos + kid_context.len()].copy_from_slice(kid_context);
        pos += kid_context.len();
    }
    if let Some(kid) = kid {
        flags |= 1 << 3;
        value[pos..pos + kid.as_slice().len()].copy_from_slice(kid.as_slice());
        pos += kid.as_slice().len();
    }
    value[0] = flags;

    // a completely empty option collapses to a zero-length value
    if flags == 0 {
        return CoapOption::new(OSCORE, &[]);
    }
    CoapOption::new(OSCORE, &value[..pos])
}

struct OscoreOptionValue {
    piv: Option<Piv>,
    kid_context: Option<[u8; 32]>,
    kid_context_len: usize,
    kid: Option<OscoreId>,
}

fn decode_oscore_option(value: &[u8]) -> Result<OscoreOptionValue, Error> {
    if value.is_empty() {
        return Ok(OscoreOptionValue {
            piv: None,
            kid_context: None,
            kid_context_len: 0,
            kid: None,
        });
    }
    let flags = value[0];
    if flags & 0b1110_0000 != 0 {
        return Err(Error::CborMalformed);
    }
    let mut pos = 1;

    let piv_len = (flags & 0b111) as usize;
    let piv = if piv_len > 0 {
        if piv_len > MAX_PIV_LEN {
            return Err(Error::CborMalformed);
        }
        let piv = Piv::from_slice(value.get(pos..pos + piv_len).ok_or(Error::CborTruncated)?)?;
        pos += piv_len;
        Some(piv)
    } else {
        None
    };

    let (kid_context, kid_context_len) = if flags & (1 << 4) != 0 {
        let len = *value.get(pos).ok_or(Error::CborTruncated)? as usize;
        pos += 1;
        if len > 32 {
            return Err(Error::CborMalformed);
        }
        let slice = value.get(pos..pos + len).ok_or(Error::CborTruncated)?;
        pos += len;
        let mut out = [0u8; 32];
        out[..len].copy_from_slice(slice);
        (Some(out), len)
    } else {
        (None, 0)
    };

    let kid = if flags & (1 << 3) != 0 {
        Some(OscoreId::from_slice(&value[pos..])?)
    } else {
        if pos != value.len() {
            return Err(Error::CborTrailing);
        }
        None
    };

    Ok(OscoreOptionValue {
        piv,
        kid_context,
        kid_context_len,
        kid,
    })
}

/// `code || inner options || 0xFF || payload`; the marker appears only when
/// a payload does.
fn assemble_plaintext(
    packet: &CoapPacket,
    inner: &OptionList,
) -> Result<([u8; MAX_PLAINTEXT_LEN], usize), Error> {
    let mut plaintext = [0u8; MAX_PLAINTEXT_LEN];
    plaintext[0] = packet.code;
    let mut pos = 1;
    pos += serialize_options(inner, &mut plaintext[pos..])?;
    if packet.payload.len > 0 {
        if pos + 1 + packet.payload.len > MAX_PLAINTEXT_LEN {
            return Err(Error::BufferTooSmall);
        }
        plaintext[pos] = PAYLOAD_MARKER;
        pos += 1;
        plaintext[pos..pos + packet.payload.len].copy_from_slice(packet.payload.as_slice());
        pos += packet.payload.len;
    }
    Ok((plaintext, pos))
}

fn disassemble_plaintext(plaintext: &[u8]) -> Result<(u8, OptionList, PayloadBuffer), Error> {
    let (&original_code, rest) = plaintext.split_first().ok_or(Error::CborTruncated)?;
    let (inner_options, consumed) = parse_options(rest)?;
    let mut payload = PayloadBuffer::new();
    if consumed < rest.len() {
        if rest.len() == consumed + 1 {
            return Err(Error::CborMalformed);
        }
        payload
            .fill_with_slice(&rest[consumed + 1..])
            .map_err(|_| Error::BufferTooSmall)?;
    }
    Ok((original_code, inner_options, payload))
}

fn seal<C: Crypto>(
    ctx: &SecurityContext,
    crypto: &mut C,
    packet: &CoapPacket,
    request: &RequestMeta,
    own_piv: Option<&Piv>,
    outer_code: u8,
) -> Result<CoapPacket, Error> {
    let split = inner_outer_option_split(packet)?;
    let (plaintext, plaintext_len) = assemble_plaintext(packet, &split.inner)?;

    let nonce = match own_piv {
        Some(piv) => build_nonce(&ctx.common_iv, &ctx.sender_id, piv),
        None => build_nonce(&ctx.common_iv, &request.kid, &request.piv),
    };
    let (aad, aad_len) = build_aad(ctx, &request.kid, &request.piv, &split.aad_only)?;

    let ciphertext = crypto.aes_ccm_encrypt(
        &ctx.sender_key,
        &nonce,
        ctx.aead_alg.tag_len(),
        &aad[..aad_len],
        &plaintext[..plaintext_len],
    )?;

    let mut outer = CoapPacket::new(packet.msg_type, outer_code, packet.message_id);
    outer.token = packet.token;
    outer.options = split.outer;

    let oscore_option = if code::is_request(packet.code) {
        encode_oscore_option(
            own_piv,
            ctx.id_context.as_ref().map(|c| c.as_slice()),
            Some(&ctx.sender_id),
        )?
    } else {
        encode_oscore_option(own_piv, None, None)?
    };
    outer.options.push(oscore_option)?;
    outer
        .payload
        .fill_with_slice(ciphertext.as_slice())
        .map_err(|_| Error::BufferTooSmall)?;
    Ok(outer)
}

/// Protect an outbound request. Consumes one sender sequence number and
/// returns the protected packet together with the request identifiers the
/// caller needs to unprotect the response.
pub fn protect_request<C: Crypto>(
    ctx: &mut SecurityContext,
    crypto: &mut C,
    packet: &CoapPacket,
) -> Result<(CoapPacket, RequestMeta), Error> {
    if !code::is_request(packet.code) {
        return Err(Error::CborMalformed);
    }
    let seq = ctx.next_sender_seq()?;
    let piv = Piv::from_seq(seq)?;
    let request = RequestMeta {
        kid: ctx.sender_id,
        piv,
    };
    let protected = seal(ctx, crypto, packet, &request, Some(&piv), code::FETCH)?;
    Ok((protected, request))
}

/// Protect an outbound response. Notifications (responses carrying
/// Observe) consume a sender sequence number and carry their own PIV;
/// plain responses reuse the request nonce.
pub fn protect_response<C: Crypto>(
    ctx: &mut SecurityContext,
    crypto: &mut C,
    packet: &CoapPacket,
    request: &RequestMeta,
) -> Result<CoapPacket, Error> {
    if !code::is_response(packet.code) {
        return Err(Error::CborMalformed);
    }
    let is_notification = packet.options.contains(OBSERVE);

    let outer_code = if code::class(packet.code) == 2 && is_notification {
        packet.code
    } else {
        code::CHANGED
    };

    if is_notification {
        let seq = ctx.next_sender_seq()?;
        let piv = Piv::from_seq(seq)?;
        seal(ctx, crypto, packet, request, Some(&piv), outer_code)
    } else {
        seal(ctx, crypto, packet, request, None, outer_code)
    }
}

fn open<C: Crypto>(
    ctx: &SecurityContext,
    crypto: &mut C,
    packet: &CoapPacket,
    nonce: &BytesCcmIvLen,
    request: &RequestMeta,
) -> Result<(u8, OptionList, PayloadBuffer), Error> {
    let class_i = class_i_options(&packet.options)?;
    let (aad, aad_len) = build_aad(ctx, &request.kid, &request.piv, &class_i)?;

    let plaintext = crypto.aes_ccm_decrypt_verify(
        &ctx.recipient_key,
        nonce,
        ctx.aead_alg.tag_len(),
        &aad[..aad_len],
        packet.payload.as_slice(),
    )?;
    disassemble_plaintext(plaintext.as_slice())
}

/// Unprotect an inbound request, gated by the replay window: the sequence
/// number is checked before the AEAD runs and recorded only after it
/// verifies.
pub fn unprotect_request<C: Crypto>(
    ctx: &mut SecurityContext,
    crypto: &mut C,
    packet: &CoapPacket,
) -> Result<(CoapPacket, RequestMeta), Error> {
    let oscore_option = packet.options.find(OSCORE).ok_or(Error::CborMalformed)?;
    let decoded = decode_oscore_option(oscore_option.value())?;

    let piv = decoded.piv.ok_or(Error::CborMalformed)?;
    let kid = decoded.kid.ok_or(Error::CborMalformed)?;
    if kid != ctx.recipient_id {
        return Err(Error::UnknownCredential);
    }
    match (&ctx.id_context, decoded.kid_context) {
        (None, None) => {}
        (Some(ours), Some(theirs)) => {
            if ours.as_slice() != &theirs[..decoded.kid_context_len] {
                return Err(Error::UnknownCredential);
            }
        }
        _ => return Err(Error::UnknownCredential),
    }

    let seq = piv.to_seq();
    ctx.replay.check(seq)?;

    let request = RequestMeta { kid, piv };
    let nonce = build_nonce(&ctx.common_iv, &kid, &piv);
    let (original_code, inner_options, payload) =
        open(ctx, crypto, packet, &nonce, &request)?;

    if !ctx.replay.update(seq) {
        return Err(Error::ReplayDuplicate);
    }

    if !code::is_request(original_code) {
        return Err(Error::CborMalformed);
    }
    let mut recovered = CoapPacket::new(packet.msg_type, original_code, packet.message_id);
    recovered.token = packet.token;
    recovered.options = merge_inner_outer(&inner_options, &packet.options)?;
    recovered.payload = payload;
    Ok((recovered, request))
}

/// Unprotect an inbound response bound to an earlier request. Notification
/// PIVs additionally pass the observe ordering check.
pub fn unprotect_response<C: Crypto>(
    ctx: &mut SecurityContext,
    crypto: &mut C,
    packet: &CoapPacket,
    request: &RequestMeta,
) -> Result<CoapPacket, Error> {
    let oscore_option = packet.options.find(OSCORE).ok_or(Error::CborMalformed)?;
    let decoded = decode_oscore_option(oscore_option.value())?;
    if decoded.kid.is_some() || decoded.kid_context.is_some() {
        // responses never identify the sender; the request binding does
        return Err(Error::CborMalformed);
    }

    let nonce = match &decoded.piv {
        Some(piv) => {
            ctx.notifications.check(piv.to_seq())?;
            build_nonce(&ctx.common_iv, &ctx.recipient_id, piv)
        }
        None => build_nonce(&ctx.common_iv, &request.kid, &request.piv),
    };

    let (original_code, inner_options, payload) = open(ctx, crypto, packet, &nonce, request)?;

    if let Some(piv) = &decoded.piv {
        ctx.notifications.update(piv.to_seq())?;
    }

    if !code::is_response(original_code) {
        return Err(Error::CborMalformed);
    }
    let mut recovered = CoapPacket::new(packet.msg_type, original_code, packet.message_id);
    recovered.token = packet.token;
    recovered.options = merge_inner_outer(&inner_options, &packet.options)?;
    recovered.payload = payload;
    Ok(recovered)
}

#[cfg(test)]
mod test {
    use super::*;
    use hexlit::hex;

    #[test]
    fn test_piv_minimal_encoding() {
        assert_eq!(Piv::from_seq(0).unwrap().as_slice(), &[0x00]);
        assert_eq!(Piv::from_seq(0x14).unwrap().as_slice(), &[0x14]);
        assert_eq!(Piv::from_seq(0x0100).unwrap().as_slice(), &[0x01, 0x00]);
        assert_eq!(
            Piv::from_seq(0xff_ffff_ffff).unwrap().as_slice(),
            &[0xff, 0xff, 0xff, 0xff, 0xff]
        );
        assert!(Piv::from_seq(1 << 40).is_err());

        assert_eq!(Piv::from_slice(&[0x01, 0x00]).unwrap().to_seq(), 0x0100);
    }

    #[test]
    fn test_nonce_construction() {
        // RFC 8613 C.4: common IV with empty sender ID and PIV 0x14
        let common_iv: BytesCcmIvLen = hex!("4622d4dd6d944168eefb54987c");
        let sender_id = OscoreId::from_slice(&[]).unwrap();
        let piv = Piv::from_seq(0x14).unwrap();
        let nonce = build_nonce(&common_iv, &sender_id, &piv);
        assert_eq!(nonce, hex!("4622d4dd6d944168eefb549868"));
    }

    #[test]
    fn test_oscore_option_roundtrip() {
        let piv = Piv::from_seq(0x14).unwrap();
        let kid = OscoreId::from_slice(&[0x01]).unwrap();
        let option = encode_oscore_option(Some(&piv), None, Some(&kid)).unwrap();
        assert_eq!(option.value(), &hex!("091401"));

        let decoded = decode_oscore_option(option.value()).unwrap();
        assert_eq!(decoded.piv, Some(piv));
        assert_eq!(decoded.kid, Some(kid));
        assert!(decoded.kid_context.is_none());

        // empty value: plain response option
        let option = encode_oscore_option(None, None, None).unwrap();
        assert_eq!(option.value(), &[]);
        let decoded = decode_oscore_option(option.value()).unwrap();
        assert!(decoded.piv.is_none() && decoded.kid.is_none());
    }

    #[test]
    fn test_oscore_option_with_kid_context() {
        let piv = Piv::from_seq(5).unwrap();
        let kid = OscoreId::from_slice(&[0x42]).unwrap();
        let option =
            encode_oscore_option(Some(&piv), Some(&hex!("37cbf3210017a2d3")), Some(&kid)).unwrap();
        // flags 0b0001_1001: piv len 1, kid context, kid
        assert_eq!(option.value()[0], 0x19);

        let decoded = decode_oscore_option(option.value()).unwrap();
        assert_eq!(decoded.kid_context_len, 8);
        assert_eq!(
            &decoded.kid_context.unwrap()[..8],
            &hex!("37cbf3210017a2d3")
        );
    }
}
