//! CoAP option classification and the inner/outer partitioning that decides
//! what OSCORE encrypts, what stays visible to proxies, and what is only
//! integrity-protected through the AAD.

use crate::coap::{code, CoapOption, CoapPacket, OptionList};
use tarn_shared::Error;

pub const IF_MATCH: u16 = 1;
pub const URI_HOST: u16 = 3;
pub const ETAG: u16 = 4;
pub const IF_NONE_MATCH: u16 = 5;
pub const OBSERVE: u16 = 6;
pub const URI_PORT: u16 = 7;
pub const LOCATION_PATH: u16 = 8;
pub const OSCORE: u16 = 9;
pub const URI_PATH: u16 = 11;
pub const CONTENT_FORMAT: u16 = 12;
pub const MAX_AGE: u16 = 14;
pub const URI_QUERY: u16 = 15;
pub const ACCEPT: u16 = 17;
pub const LOCATION_QUERY: u16 = 20;
pub const BLOCK2: u16 = 23;
pub const BLOCK1: u16 = 27;
pub const SIZE2: u16 = 28;
pub const PROXY_URI: u16 = 35;
pub const PROXY_SCHEME: u16 = 39;
pub const SIZE1: u16 = 60;

#[derive(Clone, Copy, PartialEq, Debug)]
pub enum OptionClass {
    /// Encrypted and integrity protected: travels inside the plaintext.
    ClassE,
    /// Unprotected, visible to and mutable by proxies.
    ClassU,
    /// Unprotected but integrity protected through the AAD.
    ClassI,
}

/// Classification per RFC 8613 for the supported option numbers; Observe is
/// special-cased by the split itself. Unknown options default to class E.
pub fn option_class(number: u16) -> OptionClass {
    match number {
        URI_HOST | URI_PORT | OSCORE | PROXY_URI | PROXY_SCHEME => OptionClass::ClassU,
        _ => OptionClass::ClassE,
    }
}

#[derive(Debug, Default)]
pub struct OptionSplit {
    pub inner: OptionList,
    pub outer: OptionList,
    /// Class I options; empty for the supported option set but carried
    /// through to the AAD regardless.
    pub aad_only: OptionList,
}

/// Partition the options of a plaintext packet. Every input option lands in
/// exactly one of inner/outer/aad_only, except Observe which the transform
/// needs on both sides of the boundary.
pub fn inner_outer_option_split(packet: &CoapPacket) -> Result<OptionSplit, Error> {
    let mut split = OptionSplit::default();
    let is_response = code::is_response(packet.code);

    for option in packet.options.as_slice() {
        if option.number == OBSERVE {
            if is_response {
                // notifications: the sequence stays outer, the inner copy
                // is emptied (RFC 8613 4.1.3.5.2)
                split.inner.push(CoapOption::new(OBSERVE, &[])?)?;
                split.outer.push(*option)?;
            } else {
                split.inner.push(*option)?;
                split.outer.push(*option)?;
            }
            continue;
        }
        match option_class(option.number) {
            OptionClass::ClassE => split.inner.push(*option)?,
            OptionClass::ClassU => split.outer.push(*option)?,
            OptionClass::ClassI => split.aad_only.push(*option)?,
        }
    }
    Ok(split)
}

/// Merge decrypted inner options with the pass-through outer ones when
/// recovering the original packet.
pub fn merge_inner_outer(inner: &OptionList, outer: &OptionList) -> Result<OptionList, Error> {
    let mut merged = *inner;
    for option in outer.as_slice() {
        if option.number == OSCORE {
            continue;
        }
        if option.number == OBSERVE {
            // the observed sequence lives in the outer option; the inner
            // copy (empty in notifications) is replaced by it
            merged.remove(OBSERVE);
            merged.push(*option)?;
            continue;
        }
        if !merged.contains(option.number) {
            merged.push(*option)?;
        }
    }
    Ok(merged)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::coap::{CoapPacket, CoapType};

    /// Split without options that require special processing.
    #[test]
    fn test_split_no_special_options() {
        let mut packet = CoapPacket::new(CoapType::Confirmable, code::POST, 0);
        packet
            .options
            .push(CoapOption::new(IF_MATCH, &[]).unwrap())
            .unwrap();
        packet
            .options
            .push(CoapOption::new(ETAG, &[]).unwrap())
            .unwrap();
        packet
            .options
            .push(CoapOption::new(CONTENT_FORMAT, &[]).unwrap())
            .unwrap();
        packet
            .options
            .push(CoapOption::new(PROXY_URI, &[]).unwrap())
            .unwrap();

        let split = inner_outer_option_split(&packet).unwrap();

        let inner_numbers: [u16; 3] = [
            split.inner.as_slice()[0].number,
            split.inner.as_slice()[1].number,
            split.inner.as_slice()[2].number,
        ];
        assert_eq!(inner_numbers, [IF_MATCH, ETAG, CONTENT_FORMAT]);
        assert_eq!(split.outer.len(), 1);
        assert_eq!(split.outer.as_slice()[0].number, PROXY_URI);
        assert!(split.aad_only.is_empty());
    }

    /// The server preparing a notification: the Observe sequence stays in
    /// the outer packet, the inner copy is emptied.
    #[test]
    fn test_split_observe_notification() {
        let mut packet = CoapPacket::new(CoapType::Acknowledgement, code::CONTENT, 0);
        packet
            .options
            .push(CoapOption::new(OBSERVE, &[0x12]).unwrap())
            .unwrap();
        packet
            .options
            .push(CoapOption::new(CONTENT_FORMAT, &[]).unwrap())
            .unwrap();

        let split = inner_outer_option_split(&packet).unwrap();

        let inner_observe = split.inner.find(OBSERVE).unwrap();
        assert_eq!(inner_observe.value(), &[]);
        let outer_observe = split.outer.find(OBSERVE).unwrap();
        assert_eq!(outer_observe.value(), &[0x12]);
    }

    /// In a request the Observe value is kept on both sides.
    #[test]
    fn test_split_observe_request() {
        let mut packet = CoapPacket::new(CoapType::Confirmable, code::GET, 0);
        packet
            .options
            .push(CoapOption::new(OBSERVE, &[]).unwrap())
            .unwrap();
        packet
            .options
            .push(CoapOption::new(URI_PATH, b"r").unwrap())
            .unwrap();

        let split = inner_outer_option_split(&packet).unwrap();
        assert!(split.inner.contains(OBSERVE));
        assert!(split.outer.contains(OBSERVE));
        assert!(split.inner.contains(URI_PATH));
        assert!(!split.outer.contains(URI_PATH));
    }

    /// Every option ends up on exactly one side (Observe excepted).
    #[test]
    fn test_partition_is_exhaustive() {
        let all = [
            IF_MATCH,
            URI_HOST,
            ETAG,
            IF_NONE_MATCH,
            URI_PORT,
            LOCATION_PATH,
            URI_PATH,
            CONTENT_FORMAT,
            MAX_AGE,
            URI_QUERY,
            ACCEPT,
            LOCATION_QUERY,
            BLOCK1,
            PROXY_URI,
            PROXY_SCHEME,
        ];
        let mut packet = CoapPacket::new(CoapType::Confirmable, code::GET, 0);
        for number in all {
            packet
                .options
                .push(CoapOption::new(number, &[]).unwrap())
                .unwrap();
        }
        let split = inner_outer_option_split(&packet).unwrap();
        assert_eq!(
            split.inner.len() + split.outer.len() + split.aad_only.len(),
            all.len()
        );
        for number in all {
            let sides = [
                split.inner.contains(number),
                split.outer.contains(number),
                split.aad_only.contains(number),
            ];
            assert_eq!(sides.iter().filter(|&&present| present).count(), 1);
        }
    }
}
