use super::*;

/// Wire-format parsing for the EDHOC messages. Encoding lives next to the
/// protocol logic in the main crate; decoding sits here so that both the
/// protocol crate and its tests can reuse it.

pub fn parse_ead(buffer: &[u8]) -> Result<Option<EADItem>, Error> {
    // the label is a single-byte integer, negative labels mark the item
    // critical
    if let Some((&label, tail)) = buffer.split_first() {
        let (label, is_critical) = if CborDecoder::is_u8(label) {
            (label, false)
        } else if CborDecoder::is_i8(label) {
            (label - (CBOR_NEG_INT_1BYTE_START - 1), true)
        } else {
            return Err(Error::CborUnexpectedType);
        };

        let value = if !tail.is_empty() {
            let mut value = EdhocMessageBuffer::new();
            value
                .fill_with_slice(tail)
                .map_err(|_| Error::BufferTooSmall)?;
            Some(value)
        } else {
            None
        };
        Ok(Some(EADItem {
            label,
            is_critical,
            value,
        }))
    } else {
        Err(Error::CborTruncated)
    }
}

pub fn encode_ead_item(encoder: &mut CborEncoder, ead: &EADItem) -> Result<(), Error> {
    if ead.label > 23 {
        return Err(Error::CborMalformed);
    }
    if ead.is_critical {
        encoder.int(-(ead.label as i64))?;
    } else {
        encoder.uint(ead.label as u64)?;
    }
    if let Some(value) = &ead.value {
        encoder.raw(value.as_slice())?;
    }
    Ok(())
}

/// SUITES_I / SUITES_R: a single int, or an array of at least two ints.
pub fn parse_suites(decoder: &mut CborDecoder) -> Result<Suites, Error> {
    let curr = decoder.current()?;
    if CborDecoder::type_of(curr) == CBOR_UINT_1BYTE_START {
        let mut suites = Suites::new();
        suites.push(decoder.u8()?)?;
        Ok(suites)
    } else if CborDecoder::type_of(curr) == CBOR_MAJOR_ARRAY {
        // arrays must be at least 2 items long, otherwise the compact
        // encoding (int) must be used
        let len = decoder.array()?;
        if len < 2 {
            return Err(Error::CborMalformed);
        }
        let mut suites = Suites::new();
        for _ in 0..len {
            suites.push(decoder.u8()?)?;
        }
        Ok(suites)
    } else {
        Err(Error::CborUnexpectedType)
    }
}

/// True when the buffer starts with a CBOR int, which no regular message
/// past message_1 does; used to spot `error(ERR_CODE, ERR_INFO)`.
pub fn is_error_message(buffer: &[u8]) -> bool {
    buffer
        .first()
        .map(|&b| {
            CborDecoder::type_of(b) == CBOR_UINT_1BYTE_START
                || CborDecoder::type_of(b) == CBOR_NEG_INT_1BYTE_START
        })
        .unwrap_or(false)
}

pub fn parse_message_error(buffer: &[u8]) -> Result<PeerError, Error> {
    let mut decoder = CborDecoder::new(buffer);
    let code = decoder.u8()?;
    let info = if decoder.finished() {
        PeerErrorInfo::None
    } else {
        match code {
            ERR_CODE_WRONG_SELECTED_SUITE => PeerErrorInfo::SuitesR(parse_suites(&mut decoder)?),
            ERR_CODE_UNSPECIFIED => PeerErrorInfo::Diagnostic(Diagnostic::from_slice(decoder.str()?)),
            _ => {
                decoder.skip_item()?;
                PeerErrorInfo::None
            }
        }
    };
    decoder.ensure_finished()?;
    Ok(PeerError { code, info })
}

pub struct ParsedMessage1 {
    pub method: u8,
    pub suites_i: Suites,
    pub g_x: EdhocMessageBuffer,
    pub c_i: ConnId,
    pub ead_1: Option<EADItem>,
}

pub fn parse_message_1(rcvd_message_1: &BufferMessage1) -> Result<ParsedMessage1, Error> {
    let mut decoder = CborDecoder::new(rcvd_message_1.as_slice());
    let method = decoder.u8()?;
    let suites_i = parse_suites(&mut decoder)?;

    let g_x: EdhocMessageBuffer = decoder
        .bytes()?
        .try_into()
        .map_err(|_| Error::BufferTooSmall)?;
    let c_i = ConnId::decode(&mut decoder)?;

    // anything left over is the EAD_1 item
    let ead_1 = if !decoder.finished() {
        parse_ead(decoder.remaining_buffer()?)?
    } else {
        None
    };

    Ok(ParsedMessage1 {
        method,
        suites_i,
        g_x,
        c_i,
        ead_1,
    })
}

/// message_2 is the sequence `(G_Y || CIPHERTEXT_2 : bstr, C_R)`; splitting
/// the concatenation needs the negotiated curve and happens in the caller.
pub fn parse_message_2(
    rcvd_message_2: &BufferMessage2,
) -> Result<(EdhocMessageBuffer, ConnId), Error> {
    let mut decoder = CborDecoder::new(rcvd_message_2.as_slice());
    let g_y_ciphertext_2: EdhocMessageBuffer = decoder
        .bytes()?
        .try_into()
        .map_err(|_| Error::BufferTooSmall)?;
    let c_r = ConnId::decode(&mut decoder)?;
    decoder.ensure_finished()?;
    Ok((g_y_ciphertext_2, c_r))
}

/// message_3 and message_4 are a single bstr holding the ciphertext.
pub fn parse_message_3(rcvd_message_3: &BufferMessage3) -> Result<BufferCiphertext3, Error> {
    let mut decoder = CborDecoder::new(rcvd_message_3.as_slice());
    let ciphertext: EdhocMessageBuffer = decoder
        .bytes()?
        .try_into()
        .map_err(|_| Error::BufferTooSmall)?;
    decoder.ensure_finished()?;
    Ok(ciphertext)
}

pub fn parse_message_4(rcvd_message_4: &BufferMessage4) -> Result<EdhocMessageBuffer, Error> {
    parse_message_3(rcvd_message_4)
}

/// ID_CRED as it appears inside a plaintext: either the full map, or the
/// compact int form of a 1-byte kid.
fn decode_id_cred(decoder: &mut CborDecoder) -> Result<IdCred, Error> {
    let curr = decoder.current()?;
    if CborDecoder::is_int_byte(curr) {
        let kid = decoder.int_raw()?;
        IdCred::from_kid(&[kid])
    } else if CborDecoder::type_of(curr) == CBOR_MAJOR_MAP {
        let start = decoder.position();
        decoder.skip_item()?;
        let end = decoder.position();
        let raw = decoder.window(start, end).ok_or(Error::CborMalformed)?;
        IdCred::from_encoded_map(raw)
    } else {
        Err(Error::CborUnexpectedType)
    }
}

pub struct ParsedPlaintext2 {
    pub c_r: ConnId,
    pub id_cred_r: IdCred,
    pub sig_or_mac_2: BufferSigOrMac,
    pub ead_2: Option<EADItem>,
}

pub fn decode_plaintext_2(plaintext_2: &BufferPlaintext2) -> Result<ParsedPlaintext2, Error> {
    let mut decoder = CborDecoder::new(plaintext_2.as_slice());

    let c_r = ConnId::decode(&mut decoder)?;
    let id_cred_r = decode_id_cred(&mut decoder)?;
    let sig_or_mac_2: BufferSigOrMac = decoder
        .bytes()?
        .try_into()
        .map_err(|_| Error::BufferTooSmall)?;

    let ead_2 = if !decoder.finished() {
        parse_ead(decoder.remaining_buffer()?)?
    } else {
        None
    };

    Ok(ParsedPlaintext2 {
        c_r,
        id_cred_r,
        sig_or_mac_2,
        ead_2,
    })
}

pub struct ParsedPlaintext3 {
    pub id_cred_i: IdCred,
    pub sig_or_mac_3: BufferSigOrMac,
    pub ead_3: Option<EADItem>,
}

pub fn decode_plaintext_3(plaintext_3: &BufferPlaintext3) -> Result<ParsedPlaintext3, Error> {
    let mut decoder = CborDecoder::new(plaintext_3.as_slice());

    let id_cred_i = decode_id_cred(&mut decoder)?;
    let sig_or_mac_3: BufferSigOrMac = decoder
        .bytes()?
        .try_into()
        .map_err(|_| Error::BufferTooSmall)?;

    let ead_3 = if !decoder.finished() {
        parse_ead(decoder.remaining_buffer()?)?
    } else {
        None
    };

    Ok(ParsedPlaintext3 {
        id_cred_i,
        sig_or_mac_3,
        ead_3,
    })
}

/// plaintext_4 is empty or a single EAD item.
pub fn decode_plaintext_4(plaintext_4: &EdhocMessageBuffer) -> Result<Option<EADItem>, Error> {
    if plaintext_4.len == 0 {
        Ok(None)
    } else {
        parse_ead(plaintext_4.as_slice())
    }
}
