//! Blocking handshake drivers over a caller-supplied transport.
//!
//! The state machine suspends only inside [Transport::tx], [Transport::rx]
//! and the crypto provider; a transport that fails with
//! [Error::Cancelled] aborts the handshake and the dropped session state
//! wipes its secrets.

use crate::edhoc::*;
use tarn_shared::*;

/// Caller-supplied message transport. `rx` fills the buffer with one
/// complete EDHOC message and reports its length.
pub trait Transport {
    fn tx(&mut self, data: &[u8]) -> Result<(), Error>;
    fn rx(&mut self, buffer: &mut [u8]) -> Result<usize, Error>;
}

#[derive(Debug, Default)]
pub struct InitiatorOptions {
    pub c_i: Option<ConnId>,
    pub ead_1: Option<EADItem>,
    pub ead_3: Option<EADItem>,
    /// Wait for and process message_4 after sending message_3.
    pub expect_message_4: bool,
}

#[derive(Debug, Default)]
pub struct ResponderOptions {
    pub c_r: Option<ConnId>,
    pub ead_2: Option<EADItem>,
    pub ead_4: Option<EADItem>,
    /// Send message_4 after verifying message_3.
    pub send_message_4: bool,
}

// a suite renegotiation restarts the handshake at most this many times
const MAX_SUITE_RETRIES: usize = 2;

fn receive<T: Transport>(transport: &mut T) -> Result<EdhocMessageBuffer, Error> {
    let mut buffer = [0u8; MAX_MESSAGE_SIZE_LEN];
    let len = transport.rx(&mut buffer)?;
    if len > buffer.len() {
        return Err(Error::BufferTooSmall);
    }
    EdhocMessageBuffer::new_from_slice(&buffer[..len]).map_err(|_| Error::BufferTooSmall)
}

/// Run the full initiator side: send message_1, process message_2, send
/// message_3 and optionally process message_4. A `wrong selected cipher
/// suite` error from the peer restarts the handshake with the suite list
/// extended by the responder's selection, after the downgrade guard.
pub fn initiator_run<C: Crypto, T: Transport, V: ChainVerifier>(
    crypto: &mut C,
    transport: &mut T,
    resolver: &mut CredentialResolver<'_, V>,
    options: &InitiatorOptions,
    method: Method,
    i: &BytesP256ElemLen,
    id_cred_i: &IdCred,
    cred_i: &Credential,
) -> Result<(Completed, ConnId), Error> {
    let mut suites_i = Suites::new();
    suites_i.push(EDHOC_SUPPORTED_SUITES[0])?;

    for _ in 0..=MAX_SUITE_RETRIES {
        let (x, g_x) = crypto.p256_generate_key_pair();
        let start = InitiatorStart {
            method,
            suites_i,
            x,
            g_x,
        };
        let c_i = match options.c_i {
            Some(c_i) => c_i,
            None => crate::generate_connection_identifier(crypto),
        };

        let (wait_m2, message_1) = i_prepare_message_1(&start, crypto, c_i, &options.ead_1)?;
        transport.tx(message_1.as_slice())?;

        let message_2 = receive(transport)?;
        let (processing_m2, c_r, id_cred_r, _ead_2) =
            match i_parse_message_2(&wait_m2, crypto, &message_2) {
                Ok(result) => result,
                Err(Error::ErrorMessageReceived(peer_error))
                    if peer_error.code == ERR_CODE_WRONG_SELECTED_SUITE =>
                {
                    let suites_r = match peer_error.info {
                        PeerErrorInfo::SuitesR(suites_r) => suites_r,
                        _ => return Err(Error::ErrorMessageReceived(peer_error)),
                    };
                    // downgrade guard: the responder rejected our selected
                    // suite, so SUITES_R claiming to support it is a lie
                    let selected = suites_i.selected().ok_or(Error::UnsupportedSuite)?;
                    if suites_r.contains(selected) {
                        return Err(Error::AuthFailed);
                    }
                    let new_selected = suites_r.selected().ok_or(Error::CborMalformed)?;
                    if !suite_supported(new_selected) {
                        return Err(Error::UnsupportedSuite);
                    }
                    // restart, keeping the attempted suites on the wire
                    suites_i.push(new_selected)?;
                    continue;
                }
                Err(error) => return Err(error),
            };

        let valid_cred_r = resolver.resolve(crypto, &id_cred_r)?;
        let processed_m2 = i_verify_message_2(&processing_m2, crypto, &valid_cred_r, i)?;
        let (completed, message_3, _prk_out) =
            i_prepare_message_3(&processed_m2, crypto, i, id_cred_i, cred_i, &options.ead_3)?;
        transport.tx(message_3.as_slice())?;

        if options.expect_message_4 {
            let message_4 = receive(transport)?;
            i_process_message_4(&completed, crypto, &message_4)?;
        }

        return Ok((completed, c_r));
    }

    Err(Error::UnsupportedSuite)
}

/// Run one responder handshake: process message_1, send message_2, verify
/// message_3 and optionally send message_4. On a cipher suite mismatch the
/// wire error is sent before the mismatch surfaces to the caller, who may
/// simply call again to serve the initiator's restart.
pub fn responder_run<C: Crypto, T: Transport, V: ChainVerifier>(
    crypto: &mut C,
    transport: &mut T,
    resolver: &mut CredentialResolver<'_, V>,
    options: &ResponderOptions,
    suites_r: &Suites,
    r: &BytesP256ElemLen,
    id_cred_r: &IdCred,
    cred_r: &Credential,
) -> Result<(Completed, ConnId), Error> {
    let message_1 = receive(transport)?;

    let (y, g_y) = crypto.p256_generate_key_pair();
    let start = ResponderStart {
        suites_r: *suites_r,
        y,
        g_y,
    };

    let (processing_m1, _ead_1) = match r_process_message_1(&start, crypto, &message_1) {
        Ok(result) => result,
        Err(Error::SuiteMismatch(suites_r)) => {
            let error_message = encode_message_error(
                ERR_CODE_WRONG_SELECTED_SUITE,
                &PeerErrorInfo::SuitesR(suites_r),
            )?;
            transport.tx(error_message.as_slice())?;
            return Err(Error::SuiteMismatch(suites_r));
        }
        Err(error) => return Err(error),
    };

    let c_r = match options.c_r {
        Some(c_r) => c_r,
        None => crate::generate_connection_identifier(crypto),
    };
    let (wait_m3, message_2) = r_prepare_message_2(
        &processing_m1,
        crypto,
        cred_r,
        id_cred_r,
        r,
        c_r,
        &options.ead_2,
    )?;
    transport.tx(message_2.as_slice())?;

    let message_3 = receive(transport)?;
    let (processing_m3, id_cred_i, _ead_3) = r_parse_message_3(&wait_m3, crypto, &message_3)?;

    let valid_cred_i = match resolver.resolve(crypto, &id_cred_i) {
        Ok(cred) => cred,
        Err(error) => {
            let error_message =
                encode_message_error(ERR_CODE_UNKNOWN_CREDENTIAL, &PeerErrorInfo::None)?;
            transport.tx(error_message.as_slice())?;
            return Err(error);
        }
    };
    let (completed, _prk_out) = r_verify_message_3(&processing_m3, crypto, &valid_cred_i)?;

    if options.send_message_4 {
        let message_4 = r_prepare_message_4(&completed, crypto, &options.ead_4)?;
        transport.tx(message_4.as_slice())?;
    }

    Ok((completed, c_r))
}

#[cfg(test)]
mod test {
    use super::*;
    use hexlit::hex;
    use tarn_crypto::default_crypto;

    const CRED_I: &[u8] = &hex!("A2027734322D35302D33312D46462D45462D33372D33322D333908A101A5010202412B2001215820AC75E9ECE3E50BFC8ED60399889522405C47BF16DF96660A41298CB4307F7EB62258206E5DE611388A4B8A8211334AC7D37ECB52A387D257E6DB3C2A93DF21FF3AFFC8");
    const G_I: &[u8] = &hex!("ac75e9ece3e50bfc8ed60399889522405c47bf16df96660a41298cb4307f7eb6");
    const I: &[u8] = &hex!("fb13adeb6518cee5f88417660841142e830a81fe334380a953406a1305e8706b");
    const CRED_R: &[u8] = &hex!("A2026008A101A5010202410A2001215820BBC34960526EA4D32E940CAD2A234148DDC21791A12AFBCBAC93622046DD44F02258204519E257236B2A0CE2023F0931F1F386CA7AFDA64FCDE0108C224C51EABF6072");
    const G_R: &[u8] = &hex!("bbc34960526ea4d32e940cad2a234148ddc21791a12afbcbac93622046dd44f0");
    const R: &[u8] = &hex!("72cc4761dbd4c78f758931aa589d348d1ef874a7e303ede2f140dcf3e6aa4aac");

    /// In-memory transport: everything the initiator sends is handed to a
    /// scripted responder, whose replies are queued for `rx`.
    struct LoopbackTransport {
        peer_inbox: Option<EdhocMessageBuffer>,
        reply_queue: [Option<EdhocMessageBuffer>; 2],
    }

    impl LoopbackTransport {
        fn new() -> Self {
            LoopbackTransport {
                peer_inbox: None,
                reply_queue: [None, None],
            }
        }

        fn push_reply(&mut self, message: EdhocMessageBuffer) {
            if self.reply_queue[0].is_none() {
                self.reply_queue[0] = Some(message);
            } else {
                self.reply_queue[1] = Some(message);
            }
        }

        fn pop_reply(&mut self) -> Option<EdhocMessageBuffer> {
            let head = self.reply_queue[0].take();
            self.reply_queue[0] = self.reply_queue[1].take();
            head
        }
    }

    impl Transport for LoopbackTransport {
        fn tx(&mut self, data: &[u8]) -> Result<(), Error> {
            self.peer_inbox =
                Some(EdhocMessageBuffer::new_from_slice(data).map_err(|_| Error::TransportError)?);
            Ok(())
        }

        fn rx(&mut self, buffer: &mut [u8]) -> Result<usize, Error> {
            let message = self.pop_reply().ok_or(Error::TransportError)?;
            buffer[..message.len].copy_from_slice(message.as_slice());
            Ok(message.len)
        }
    }

    #[test]
    fn test_initiator_run_against_inline_responder() {
        // Drive the runner against a responder implemented directly on the
        // low-level functions, so both sides stay observable.
        struct InlineResponder {
            inner: LoopbackTransport,
            wait_m3: Option<crate::WaitM3>,
            done: bool,
        }

        impl Transport for InlineResponder {
            fn tx(&mut self, data: &[u8]) -> Result<(), Error> {
                let message =
                    EdhocMessageBuffer::new_from_slice(data).map_err(|_| Error::TransportError)?;
                let mut crypto = default_crypto();
                if self.wait_m3.is_none() {
                    let (y, g_y) = crypto.p256_generate_key_pair();
                    let start = ResponderStart {
                        suites_r: Suites::from_slice(&EDHOC_SUPPORTED_SUITES).unwrap(),
                        y,
                        g_y,
                    };
                    let (processing_m1, _ead_1) =
                        r_process_message_1(&start, &mut crypto, &message)?;
                    let cred_r =
                        Credential::new(CRED_R, G_R.try_into().unwrap(), Some(&hex!("0a")))
                            .unwrap();
                    let id_cred_r = IdCred::from_kid(&hex!("0a")).unwrap();
                    let (wait_m3, message_2) = r_prepare_message_2(
                        &processing_m1,
                        &mut crypto,
                        &cred_r,
                        &id_cred_r,
                        &R.try_into().unwrap(),
                        ConnId::Int(8),
                        &None,
                    )?;
                    self.wait_m3 = Some(wait_m3);
                    self.inner.push_reply(message_2);
                } else {
                    let wait_m3 = self.wait_m3.take().unwrap();
                    let (processing_m3, id_cred_i, _ead_3) =
                        r_parse_message_3(&wait_m3, &mut crypto, &message)?;
                    let cred_i =
                        Credential::new(CRED_I, G_I.try_into().unwrap(), Some(&hex!("2b")))
                            .unwrap();
                    let known = [cred_i];
                    let mut resolver = CredentialResolver::new(&known, NoChainVerifier);
                    let valid_cred_i = resolver.resolve(&mut crypto, &id_cred_i)?;
                    let (completed, _prk_out) =
                        r_verify_message_3(&processing_m3, &mut crypto, &valid_cred_i)?;
                    let message_4 = r_prepare_message_4(&completed, &mut crypto, &None)?;
                    self.inner.push_reply(message_4);
                    self.done = true;
                }
                Ok(())
            }

            fn rx(&mut self, buffer: &mut [u8]) -> Result<usize, Error> {
                self.inner.rx(buffer)
            }
        }

        let mut crypto = default_crypto();
        let mut transport = InlineResponder {
            inner: LoopbackTransport::new(),
            wait_m3: None,
            done: false,
        };
        let cred_r = Credential::new(CRED_R, G_R.try_into().unwrap(), Some(&hex!("0a"))).unwrap();
        let known = [cred_r];
        let mut resolver = CredentialResolver::new(&known, NoChainVerifier);

        let cred_i = Credential::new(CRED_I, G_I.try_into().unwrap(), Some(&hex!("2b"))).unwrap();
        let id_cred_i = IdCred::from_kid(&hex!("2b")).unwrap();
        let options = InitiatorOptions {
            expect_message_4: true,
            ..Default::default()
        };

        let (completed, c_r) = initiator_run(
            &mut crypto,
            &mut transport,
            &mut resolver,
            &options,
            Method::StatStat,
            &I.try_into().unwrap(),
            &id_cred_i,
            &cred_i,
        )
        .unwrap();

        assert!(transport.done);
        assert_eq!(c_r, ConnId::Int(8));
        // the session is usable for key export
        let (secret, salt) =
            crate::oscore_material(&completed, &mut crypto).unwrap();
        assert_eq!(secret.len(), OSCORE_SECRET_LEN);
        assert_eq!(salt.len(), OSCORE_SALT_LEN);
    }

    #[test]
    fn test_suite_negotiation_restart() {
        // Initiator proposing an unsupported suite gets error(2, SUITES_R)
        // and restarts with the responder's selection appended.
        struct NegotiatingResponder {
            inner: LoopbackTransport,
            sent_error: bool,
            second_message_1: Option<EdhocMessageBuffer>,
        }

        impl Transport for NegotiatingResponder {
            fn tx(&mut self, data: &[u8]) -> Result<(), Error> {
                let message =
                    EdhocMessageBuffer::new_from_slice(data).map_err(|_| Error::TransportError)?;
                if !self.sent_error {
                    // reject whatever was selected
                    let suites_r = Suites::from_slice(&[0, 2]).unwrap();
                    let error_message = encode_message_error(
                        ERR_CODE_WRONG_SELECTED_SUITE,
                        &PeerErrorInfo::SuitesR(suites_r),
                    )?;
                    self.inner.push_reply(error_message);
                    self.sent_error = true;
                } else {
                    self.second_message_1 = Some(message);
                    // stop the run here; the restart is what is under test
                    return Err(Error::Cancelled);
                }
                Ok(())
            }

            fn rx(&mut self, buffer: &mut [u8]) -> Result<usize, Error> {
                self.inner.rx(buffer)
            }
        }

        let mut crypto = default_crypto();
        let mut transport = NegotiatingResponder {
            inner: LoopbackTransport::new(),
            sent_error: false,
            second_message_1: None,
        };
        let known: [Credential; 0] = [];
        let mut resolver = CredentialResolver::new(&known, NoChainVerifier);
        let cred_i = Credential::new(CRED_I, G_I.try_into().unwrap(), Some(&hex!("2b"))).unwrap();
        let id_cred_i = IdCred::from_kid(&hex!("2b")).unwrap();

        let result = initiator_run(
            &mut crypto,
            &mut transport,
            &mut resolver,
            &InitiatorOptions::default(),
            Method::StatStat,
            &I.try_into().unwrap(),
            &id_cred_i,
            &cred_i,
        );
        assert_eq!(result.unwrap_err(), Error::Cancelled);

        // the restarted message_1 carries the negotiation history [3, 2]
        let message_1 = transport.second_message_1.unwrap();
        let parsed = parse_message_1(&message_1).unwrap();
        assert_eq!(parsed.suites_i.as_slice(), &[EDHOC_SUPPORTED_SUITES[0], 2]);
    }

    #[test]
    fn test_suite_downgrade_guard() {
        // SUITES_R that contains the suite it just rejected is a downgrade
        // attempt and must abort the handshake.
        struct LyingResponder {
            inner: LoopbackTransport,
        }

        impl Transport for LyingResponder {
            fn tx(&mut self, _data: &[u8]) -> Result<(), Error> {
                let mut suites_r = Suites::from_slice(&[2]).unwrap();
                suites_r.push(EDHOC_SUPPORTED_SUITES[0]).unwrap();
                // claims to support our selected suite while rejecting it
                let error_message = encode_message_error(
                    ERR_CODE_WRONG_SELECTED_SUITE,
                    &PeerErrorInfo::SuitesR(suites_r),
                )?;
                self.inner.push_reply(error_message);
                Ok(())
            }

            fn rx(&mut self, buffer: &mut [u8]) -> Result<usize, Error> {
                self.inner.rx(buffer)
            }
        }

        let mut crypto = default_crypto();
        let mut transport = LyingResponder {
            inner: LoopbackTransport::new(),
        };
        let known: [Credential; 0] = [];
        let mut resolver = CredentialResolver::new(&known, NoChainVerifier);
        let cred_i = Credential::new(CRED_I, G_I.try_into().unwrap(), Some(&hex!("2b"))).unwrap();
        let id_cred_i = IdCred::from_kid(&hex!("2b")).unwrap();

        let result = initiator_run(
            &mut crypto,
            &mut transport,
            &mut resolver,
            &InitiatorOptions::default(),
            Method::StatStat,
            &I.try_into().unwrap(),
            &id_cred_i,
            &cred_i,
        );
        assert_eq!(result.unwrap_err(), Error::AuthFailed);
    }

    #[test]
    fn test_responder_run_reports_suite_mismatch() {
        // a responder served message_1 with an unsupported selected suite
        // sends error(2, SUITES_R) before surfacing the mismatch
        struct ScriptedInitiator {
            inner: LoopbackTransport,
            error_seen: Option<EdhocMessageBuffer>,
        }

        impl Transport for ScriptedInitiator {
            fn tx(&mut self, data: &[u8]) -> Result<(), Error> {
                self.error_seen =
                    Some(EdhocMessageBuffer::new_from_slice(data).map_err(|_| Error::TransportError)?);
                Ok(())
            }

            fn rx(&mut self, buffer: &mut [u8]) -> Result<usize, Error> {
                self.inner.rx(buffer)
            }
        }

        let mut crypto = default_crypto();
        let mut transport = ScriptedInitiator {
            inner: LoopbackTransport::new(),
            error_seen: None,
        };
        // message_1 selecting suite 6, which the responder does not support
        transport
            .inner
            .push_reply(EdhocMessageBuffer::from_hex(
                "03065820741a13d7ba048fbb615e94386aa3b61bea5b3d8f65f32620b749bee8d278efa90e",
            ));

        let cred_r = Credential::new(CRED_R, G_R.try_into().unwrap(), Some(&hex!("0a"))).unwrap();
        let id_cred_r = IdCred::from_kid(&hex!("0a")).unwrap();
        let known: [Credential; 0] = [];
        let mut resolver = CredentialResolver::new(&known, NoChainVerifier);
        let suites_r = Suites::from_slice(&EDHOC_SUPPORTED_SUITES).unwrap();

        let result = responder_run(
            &mut crypto,
            &mut transport,
            &mut resolver,
            &ResponderOptions::default(),
            &suites_r,
            &R.try_into().unwrap(),
            &id_cred_r,
            &cred_r,
        );
        match result.unwrap_err() {
            Error::SuiteMismatch(reported) => {
                assert_eq!(reported.as_slice(), &EDHOC_SUPPORTED_SUITES)
            }
            other => panic!("unexpected error {:?}", other),
        }

        let error_message = transport.error_seen.unwrap();
        let peer_error = parse_message_error(error_message.as_slice()).unwrap();
        assert_eq!(peer_error.code, ERR_CODE_WRONG_SELECTED_SUITE);
    }
}
