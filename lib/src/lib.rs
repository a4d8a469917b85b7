//! Implementation of [EDHOC] (Ephemeral Diffie-Hellman Over COSE), a lightweight authenticated key
//! exchange for the Internet of Things, together with the key export needed
//! to seed an OSCORE security context.
//!
//! The crate provides a high-level interface through the [EdhocInitiator] and the [EdhocResponder]
//! structs, which wrap the lower level state structs driven by the functions in the `edhoc`
//! module. Both are used in a type stated way: following the protocol they generate (or process)
//! messages, progressively provide more information about their peer, and eventually devolve into
//! an [EdhocInitiatorDone] and [EdhocResponderDone], respectively, through which the EDHOC key
//! material can be obtained.
//!
//! For callers that just want the handshake run to completion over a byte
//! transport, the [transport] module drives the same states over a caller
//! supplied `tx`/`rx` pair, including the error-message and cipher suite
//! negotiation paths.
//!
//! [EDHOC]: https://datatracker.ietf.org/doc/draft-ietf-lake-edhoc/
#![cfg_attr(not(test), no_std)]

pub use {tarn_shared::Crypto as CryptoTrait, tarn_shared::*};

mod edhoc;
pub use edhoc::*;

pub mod transport;
pub use transport::{initiator_run, responder_run, InitiatorOptions, ResponderOptions, Transport};

/// Starting point for performing EDHOC in the role of the Initiator.
#[derive(Debug)]
pub struct EdhocInitiator<Crypto: CryptoTrait> {
    state: InitiatorStart, // opaque state
    crypto: Crypto,
}

#[derive(Debug)]
pub struct EdhocInitiatorWaitM2<Crypto: CryptoTrait> {
    state: WaitM2, // opaque state
    crypto: Crypto,
}

#[derive(Debug)]
pub struct EdhocInitiatorProcessingM2<Crypto: CryptoTrait> {
    state: ProcessingM2, // opaque state
    crypto: Crypto,
}

#[derive(Debug)]
pub struct EdhocInitiatorProcessedM2<Crypto: CryptoTrait> {
    state: ProcessedM2, // opaque state
    crypto: Crypto,
}

#[derive(Debug)]
pub struct EdhocInitiatorDone<Crypto: CryptoTrait> {
    state: Completed,
    crypto: Crypto,
}

/// Starting point for performing EDHOC in the role of the Responder.
#[derive(Debug)]
pub struct EdhocResponder<'a, Crypto: CryptoTrait> {
    state: ResponderStart, // opaque state
    r: &'a [u8],           // private authentication key of R
    cred_r: Credential,    // R's full credential
    id_cred_r: IdCred,
    crypto: Crypto,
}

#[derive(Debug)]
pub struct EdhocResponderProcessedM1<'a, Crypto: CryptoTrait> {
    state: ProcessingM1, // opaque state
    r: &'a [u8],
    cred_r: Credential,
    id_cred_r: IdCred,
    crypto: Crypto,
}

#[derive(Debug)]
pub struct EdhocResponderWaitM3<Crypto: CryptoTrait> {
    state: WaitM3, // opaque state
    crypto: Crypto,
}

#[derive(Debug)]
pub struct EdhocResponderProcessingM3<Crypto: CryptoTrait> {
    state: ProcessingM3, // opaque state
    crypto: Crypto,
}

#[derive(Debug)]
pub struct EdhocResponderDone<Crypto: CryptoTrait> {
    state: Completed,
    crypto: Crypto,
}

impl<'a, Crypto: CryptoTrait> EdhocResponder<'a, Crypto> {
    pub fn new(
        mut crypto: Crypto,
        suites_r: &[u8],
        r: &'a [u8],
        cred_r: Credential,
        id_cred_r: IdCred,
    ) -> Result<Self, Error> {
        assert!(r.len() == P256_ELEM_LEN);
        let (y, g_y) = crypto.p256_generate_key_pair();

        Ok(EdhocResponder {
            state: ResponderStart {
                suites_r: Suites::from_slice(suites_r)?,
                y,
                g_y,
            },
            r,
            cred_r,
            id_cred_r,
            crypto,
        })
    }

    pub fn process_message_1(
        mut self,
        message_1: &BufferMessage1,
    ) -> Result<(EdhocResponderProcessedM1<'a, Crypto>, Option<EADItem>), Error> {
        let (state, ead_1) = r_process_message_1(&self.state, &mut self.crypto, message_1)?;

        Ok((
            EdhocResponderProcessedM1 {
                state,
                r: self.r,
                cred_r: self.cred_r,
                id_cred_r: self.id_cred_r,
                crypto: self.crypto,
            },
            ead_1,
        ))
    }

    /// SUITES_R, as it would be reported in a negotiation error.
    pub fn suites_r(&self) -> Suites {
        self.state.suites_r
    }
}

impl<'a, Crypto: CryptoTrait> EdhocResponderProcessedM1<'a, Crypto> {
    pub fn prepare_message_2(
        mut self,
        c_r: Option<ConnId>,
        ead_2: &Option<EADItem>,
    ) -> Result<(EdhocResponderWaitM3<Crypto>, BufferMessage2), Error> {
        let c_r = match c_r {
            Some(c_r) => c_r,
            None => generate_connection_identifier(&mut self.crypto),
        };
        let r = self.r.try_into().expect("Wrong length of private key");

        match r_prepare_message_2(
            &self.state,
            &mut self.crypto,
            &self.cred_r,
            &self.id_cred_r,
            &r,
            c_r,
            ead_2,
        ) {
            Ok((state, message_2)) => Ok((
                EdhocResponderWaitM3 {
                    state,
                    crypto: self.crypto,
                },
                message_2,
            )),
            Err(error) => Err(error),
        }
    }
}

impl<Crypto: CryptoTrait> EdhocResponderWaitM3<Crypto> {
    pub fn parse_message_3(
        mut self,
        message_3: &BufferMessage3,
    ) -> Result<(EdhocResponderProcessingM3<Crypto>, IdCred, Option<EADItem>), Error> {
        match r_parse_message_3(&self.state, &mut self.crypto, message_3) {
            Ok((state, id_cred_i, ead_3)) => Ok((
                EdhocResponderProcessingM3 {
                    state,
                    crypto: self.crypto,
                },
                id_cred_i,
                ead_3,
            )),
            Err(error) => Err(error),
        }
    }
}

impl<Crypto: CryptoTrait> EdhocResponderProcessingM3<Crypto> {
    pub fn verify_message_3(
        mut self,
        valid_cred_i: &Credential,
    ) -> Result<(EdhocResponderDone<Crypto>, BytesHashLen), Error> {
        match r_verify_message_3(&self.state, &mut self.crypto, valid_cred_i) {
            Ok((state, prk_out)) => Ok((
                EdhocResponderDone {
                    state,
                    crypto: self.crypto,
                },
                prk_out,
            )),
            Err(error) => Err(error),
        }
    }
}

impl<Crypto: CryptoTrait> EdhocResponderDone<Crypto> {
    pub fn prepare_message_4(&mut self, ead_4: &Option<EADItem>) -> Result<BufferMessage4, Error> {
        r_prepare_message_4(&self.state, &mut self.crypto, ead_4)
    }

    pub fn edhoc_exporter(
        &mut self,
        label: u8,
        context: &[u8],
        length: usize,
    ) -> Result<BytesMaxBuffer, Error> {
        edhoc_exporter(&self.state, &mut self.crypto, label, context, length)
    }

    pub fn edhoc_key_update(&mut self, context: &[u8]) -> Result<BytesHashLen, Error> {
        edhoc_key_update(&mut self.state, &mut self.crypto, context)
    }

    /// The OSCORE master secret and master salt for this session.
    pub fn oscore_material(
        &mut self,
    ) -> Result<([u8; OSCORE_SECRET_LEN], [u8; OSCORE_SALT_LEN]), Error> {
        oscore_material(&self.state, &mut self.crypto)
    }
}

impl<Crypto: CryptoTrait> EdhocInitiator<Crypto> {
    pub fn new(crypto: Crypto, method: Method) -> Self {
        // start from the preferred suite; negotiation may extend the list
        let mut suites_i = Suites::new();
        suites_i.push(EDHOC_SUPPORTED_SUITES[0]).unwrap();
        Self::new_with_suites(crypto, method, suites_i)
    }

    pub fn new_with_suites(mut crypto: Crypto, method: Method, suites_i: Suites) -> Self {
        let (x, g_x) = crypto.p256_generate_key_pair();

        EdhocInitiator {
            state: InitiatorStart {
                method,
                suites_i,
                x,
                g_x,
            },
            crypto,
        }
    }

    pub fn prepare_message_1(
        mut self,
        c_i: Option<ConnId>,
        ead_1: &Option<EADItem>,
    ) -> Result<(EdhocInitiatorWaitM2<Crypto>, BufferMessage1), Error> {
        let c_i = match c_i {
            Some(c_i) => c_i,
            None => generate_connection_identifier(&mut self.crypto),
        };

        match i_prepare_message_1(&self.state, &mut self.crypto, c_i, ead_1) {
            Ok((state, message_1)) => Ok((
                EdhocInitiatorWaitM2 {
                    state,
                    crypto: self.crypto,
                },
                message_1,
            )),
            Err(error) => Err(error),
        }
    }

    pub fn selected_cipher_suite(&self) -> Option<u8> {
        self.state.suites_i.selected()
    }
}

impl<Crypto: CryptoTrait> EdhocInitiatorWaitM2<Crypto> {
    pub fn parse_message_2(
        mut self,
        message_2: &BufferMessage2,
    ) -> Result<
        (
            EdhocInitiatorProcessingM2<Crypto>,
            ConnId,
            IdCred,
            Option<EADItem>,
        ),
        Error,
    > {
        match i_parse_message_2(&self.state, &mut self.crypto, message_2) {
            Ok((state, c_r, id_cred_r, ead_2)) => Ok((
                EdhocInitiatorProcessingM2 {
                    state,
                    crypto: self.crypto,
                },
                c_r,
                id_cred_r,
                ead_2,
            )),
            Err(error) => Err(error),
        }
    }
}

impl<Crypto: CryptoTrait> EdhocInitiatorProcessingM2<Crypto> {
    pub fn verify_message_2(
        mut self,
        i: &[u8],
        valid_cred_r: &Credential,
    ) -> Result<EdhocInitiatorProcessedM2<Crypto>, Error> {
        match i_verify_message_2(
            &self.state,
            &mut self.crypto,
            valid_cred_r,
            &i.try_into().expect("Wrong length of initiator private key"),
        ) {
            Ok(state) => Ok(EdhocInitiatorProcessedM2 {
                state,
                crypto: self.crypto,
            }),
            Err(error) => Err(error),
        }
    }
}

impl<Crypto: CryptoTrait> EdhocInitiatorProcessedM2<Crypto> {
    pub fn prepare_message_3(
        mut self,
        i: &[u8],
        id_cred_i: &IdCred,
        cred_i: &Credential,
        ead_3: &Option<EADItem>,
    ) -> Result<(EdhocInitiatorDone<Crypto>, BufferMessage3, BytesHashLen), Error> {
        match i_prepare_message_3(
            &self.state,
            &mut self.crypto,
            &i.try_into().expect("Wrong length of initiator private key"),
            id_cred_i,
            cred_i,
            ead_3,
        ) {
            Ok((state, message_3, prk_out)) => Ok((
                EdhocInitiatorDone {
                    state,
                    crypto: self.crypto,
                },
                message_3,
                prk_out,
            )),
            Err(error) => Err(error),
        }
    }
}

impl<Crypto: CryptoTrait> EdhocInitiatorDone<Crypto> {
    pub fn process_message_4(
        &mut self,
        message_4: &BufferMessage4,
    ) -> Result<Option<EADItem>, Error> {
        i_process_message_4(&self.state, &mut self.crypto, message_4)
    }

    pub fn edhoc_exporter(
        &mut self,
        label: u8,
        context: &[u8],
        length: usize,
    ) -> Result<BytesMaxBuffer, Error> {
        edhoc_exporter(&self.state, &mut self.crypto, label, context, length)
    }

    pub fn edhoc_key_update(&mut self, context: &[u8]) -> Result<BytesHashLen, Error> {
        edhoc_key_update(&mut self.state, &mut self.crypto, context)
    }

    /// The OSCORE master secret and master salt for this session.
    pub fn oscore_material(
        &mut self,
    ) -> Result<([u8; OSCORE_SECRET_LEN], [u8; OSCORE_SALT_LEN]), Error> {
        oscore_material(&self.state, &mut self.crypto)
    }
}

/// Derive the OSCORE master secret and salt from a completed session.
pub fn oscore_material<Crypto: CryptoTrait>(
    state: &Completed,
    crypto: &mut Crypto,
) -> Result<([u8; OSCORE_SECRET_LEN], [u8; OSCORE_SALT_LEN]), Error> {
    let okm = edhoc_exporter(
        state,
        crypto,
        EXPORTER_LABEL_OSCORE_SECRET,
        &[],
        OSCORE_SECRET_LEN,
    )?;
    let mut secret = [0u8; OSCORE_SECRET_LEN];
    secret.copy_from_slice(&okm[..OSCORE_SECRET_LEN]);

    let okm = edhoc_exporter(
        state,
        crypto,
        EXPORTER_LABEL_OSCORE_SALT,
        &[],
        OSCORE_SALT_LEN,
    )?;
    let mut salt = [0u8; OSCORE_SALT_LEN];
    salt.copy_from_slice(&okm[..OSCORE_SALT_LEN]);

    Ok((secret, salt))
}

/// Generates an identifier that can be serialized as a single CBOR integer,
/// i.e. -24 <= x <= 23.
pub fn generate_connection_identifier<Crypto: CryptoTrait>(crypto: &mut Crypto) -> ConnId {
    let mut conn_id = crypto.get_random_byte() as i8;
    while !(-24..=23).contains(&conn_id) {
        conn_id = crypto.get_random_byte() as i8;
    }
    ConnId::Int(conn_id as i32)
}

/// Checks a received ID_CRED against the peer credential the application
/// expects, or accepts the resolved one when nothing was pinned.
pub fn credential_check_or_fetch<C: CryptoTrait, V: ChainVerifier>(
    crypto: &mut C,
    resolver: &mut CredentialResolver<'_, V>,
    cred_expected: Option<&Credential>,
    id_cred_received: &IdCred,
) -> Result<Credential, Error> {
    let resolved = resolver.resolve(crypto, id_cred_received)?;
    if let Some(cred_expected) = cred_expected {
        if resolved != *cred_expected {
            return Err(Error::UnknownCredential);
        }
    }
    Ok(resolved)
}

#[cfg(test)]
mod test_vectors_common {
    use hexlit::hex;

    pub const CRED_I: &[u8] = &hex!("A2027734322D35302D33312D46462D45462D33372D33322D333908A101A5010202412B2001215820AC75E9ECE3E50BFC8ED60399889522405C47BF16DF96660A41298CB4307F7EB62258206E5DE611388A4B8A8211334AC7D37ECB52A387D257E6DB3C2A93DF21FF3AFFC8");
    pub const G_I: &[u8] = &hex!("ac75e9ece3e50bfc8ed60399889522405c47bf16df96660a41298cb4307f7eb6");
    pub const KID_I: &[u8] = &hex!("2b");
    pub const I: &[u8] = &hex!("fb13adeb6518cee5f88417660841142e830a81fe334380a953406a1305e8706b");

    pub const CRED_R: &[u8] = &hex!("A2026008A101A5010202410A2001215820BBC34960526EA4D32E940CAD2A234148DDC21791A12AFBCBAC93622046DD44F02258204519E257236B2A0CE2023F0931F1F386CA7AFDA64FCDE0108C224C51EABF6072");
    pub const G_R: &[u8] = &hex!("bbc34960526ea4d32e940cad2a234148ddc21791a12afbcbac93622046dd44f0");
    pub const KID_R: &[u8] = &hex!("0a");
    pub const R: &[u8] = &hex!("72cc4761dbd4c78f758931aa589d348d1ef874a7e303ede2f140dcf3e6aa4aac");

    pub const MESSAGE_1_TV_FIRST_TIME: &str =
        "03065820741a13d7ba048fbb615e94386aa3b61bea5b3d8f65f32620b749bee8d278efa90e";
    pub const MESSAGE_1_TV: &str =
        "0382060258208af6f430ebe18d34184017a9a11bf511c8dff8f834730b96c1b7c8dbca2fc3b637";

    // Full static-DH handshake vectors for suite 2 and method 3, with both
    // ephemerals pinned through the seeded keypair derivation. C_I is -24,
    // C_R is -8, no EAD. Any change to the transcript-hash chain, the KDF
    // info encoding, the MAC context or the plaintext layouts shows up as
    // a byte mismatch here.
    pub const X_SEED_STAT_TV: [u8; 32] =
        hex!("a0a1a2a3a4a5a6a7a8a9aaabacadaeafb0b1b2b3b4b5b6b7b8b9babbbcbdbebf");
    pub const Y_SEED_STAT_TV: [u8; 32] =
        hex!("c0c1c2c3c4c5c6c7c8c9cacbcccdcecfd0d1d2d3d4d5d6d7d8d9dadbdcdddedf");
    pub const G_X_STAT_TV: [u8; 32] =
        hex!("0d0918a04198474605615b6df90fdcb34791fb3ecb822f4b26eb6e4fc4511b9d");
    pub const G_Y_STAT_TV: [u8; 32] =
        hex!("73a56eced343896b8adeea1d0a26b196f4e0ebb4209c601a46ef6a27c5477451");
    pub const MESSAGE_1_STAT_TV: &str =
        "030258200d0918a04198474605615b6df90fdcb34791fb3ecb822f4b26eb6e4fc4511b9d37";
    pub const MESSAGE_2_STAT_TV: &str =
        "582b73a56eced343896b8adeea1d0a26b196f4e0ebb4209c601a46ef6a27c54774515fa7e55ba6ca49143021ca27";
    pub const MESSAGE_3_STAT_TV: &str = "52d7626b90cb71a43304fa946a64a761e8f47c";
    pub const PRK_OUT_STAT_TV: [u8; 32] =
        hex!("1edd57f707884b308b8b1ce8e842160fd5b6a12e18a4f8d59b00c55a28f305f8");
}
