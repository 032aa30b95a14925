//! Per-connection session state machine.
//!
//! A session consumes input in 16-byte blocks and emits output in
//! 16-byte blocks, with at most one generated block buffered at a time —
//! that single block is the only coupling to the transport's send
//! window. Three events drive it: accept, bytes received, and
//! writability. The service owns the socket; the session never sees it,
//! only a [`BlockSink`].
//!
//! ```text
//!        cleartext handshake                encrypted channel
//! ┌─────────────────────────────┐  ┌────────────────────────────────┐
//! │ SEND_GREETING               │  │ EXPECT_ENC_REQUEST_HEADER ◀──┐ │
//! │   ▼ EXPECT_REQUEST          │  │   ▼ EXPECT_ENC_REQUEST_PAYLOAD │
//! │   ▼ SEND_CHALLENGE          │  │   ▼ (dispatch)                 │
//! │   ▼ EXPECT_AUTHENTICATION   │  │   ▼ SEND_ENC_REPLY_HEADER ───┘ │
//! │   ▼ SEND_AUTHENTICATION     │  │   ▼ SEND_ENC_REPLY_PAYLOAD ──┘ │
//! │   ▼ EXPECT_ACKNOWLEDGE ─────┼──▶   or ..._WITH_COMMIT           │
//! └─────────────────────────────┘  │   ▼ EXECUTE_COMMIT (after      │
//!   errors: one cleartext block    │     the reply hits the wire)   │
//!   then DISCONNECT                └────────────────────────────────┘
//! ```
//!
//! Error replies sent from handshake states are a single cleartext
//! block; from encrypted states they are encrypted zero-length headers.
//! Either way the session disconnects immediately afterwards.

use log::{info, warn};

use super::crypto::{self, CbcState, SecretState, AES_KEY_SIZE};
use super::header::MessageHeader;
use super::registry::{HandlerCtx, HandlerIo, HandlerTable};
use super::{
    BLOCK_SIZE, CHALLENGE_SIZE, ID_ACKNOWLEDGE, ID_AUTHENTICATION, ID_AUTH_ERROR,
    ID_BAD_HANDLER_ERROR, ID_BAD_MSG_ERROR, ID_BAD_PARAM_ERROR, ID_CHALLENGE, ID_CORRUPT_ERROR,
    ID_GREETING, ID_NO_SECRET_ERROR, ID_OK, ID_REQUEST, ID_RESPONSE, MAX_DATA_SIZE,
    PROTOCOL_VERSION,
};

// ── Transport-facing types ───────────────────────────────────

/// Result of offering one block to the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Accepted; the session may generate the next block.
    Sent,
    /// No buffer space; keep the block and retry on writability.
    Full,
    /// Transport failure; the session disconnects.
    Error,
}

/// Where outbound blocks go. Implemented over the TCP stream by the
/// service and over plain buffers by tests.
pub trait BlockSink {
    fn write_block(&mut self, block: &[u8; BLOCK_SIZE]) -> WriteOutcome;
}

/// What the service must do after delivering an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// Keep the connection open.
    Continue,
    /// Close the connection and drop the session.
    CloseNow,
    /// Close the connection first, then call [`Session::run_commit`].
    CloseAndRunCommit,
}

/// The per-dispatch dependencies, split so the handler table and the
/// handler context can be borrowed independently of the session.
pub struct SessionDeps<'a> {
    pub handlers: &'a mut HandlerTable,
    pub ctx: HandlerCtx<'a>,
}

// ── State machine ────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    // Handshake (cleartext).
    SendGreeting,
    ExpectRequest,
    SendChallenge,
    ExpectAuthentication,
    SendAuthentication,
    ExpectAcknowledge,
    SendBadMsgError,
    SendAuthError,
    SendNoSecretError,
    // Encrypted channel.
    ExpectEncRequestHeader,
    ExpectEncRequestPayload,
    SendEncReplyHeader,
    SendEncReplyPayload,
    SendCorruptError,
    SendBadParamError,
    SendBadHandlerError,
    SendEncReplyHeaderWithCommit,
    ExecuteCommit,
    // Terminal.
    Disconnect,
}

/// One TCP connection's worth of protocol state. Created on accept,
/// dropped on close.
pub struct Session {
    state: SessionState,
    data: Box<[u8; MAX_DATA_SIZE]>,
    data_index: usize,

    client_challenge: [u8; CHALLENGE_SIZE],
    server_challenge: [u8; CHALLENGE_SIZE],
    encrypt: Option<CbcState>,
    decrypt: Option<CbcState>,

    request_header: MessageHeader,
    reply_header: MessageHeader,

    input_block: [u8; BLOCK_SIZE],
    input_fill: usize,
    output_block: [u8; BLOCK_SIZE],
    output_ready: bool,
}

impl Session {
    /// Build a session with the greeting staged in the data buffer.
    pub fn new(board_id_hex: &str) -> Self {
        let mut session = Self {
            state: SessionState::SendGreeting,
            data: Box::new([0u8; MAX_DATA_SIZE]),
            data_index: 0,
            client_challenge: [0; CHALLENGE_SIZE],
            server_challenge: [0; CHALLENGE_SIZE],
            encrypt: None,
            decrypt: None,
            request_header: MessageHeader::default(),
            reply_header: MessageHeader::default(),
            input_block: [0; BLOCK_SIZE],
            input_fill: 0,
            output_block: [0; BLOCK_SIZE],
            output_ready: false,
        };

        let text = format!(
            "xxx\r{board_id_hex}\rwifi-settings version {}\r\n",
            env!("CARGO_PKG_VERSION")
        );
        let text = text.as_bytes();
        session.data[..text.len()].copy_from_slice(text);
        // Bytes 0..3 are fixed fields; 4..20 hold the board id placed by
        // the format string, and the rest is printable version text.
        session.data[0] = ID_GREETING;
        session.data[1] = PROTOCOL_VERSION;
        let blocks = text.len().div_ceil(BLOCK_SIZE) as u8;
        session.data[2] = blocks;
        session.reply_header.data_size = u32::from(blocks) * BLOCK_SIZE as u32;
        session
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Whether a generated block is still waiting for transport space.
    pub fn has_pending_output(&self) -> bool {
        self.output_ready
    }

    // ── Events ───────────────────────────────────────────────

    /// The connection was just accepted: send the greeting.
    pub fn on_accept(&mut self, deps: &mut SessionDeps<'_>, sink: &mut dyn BlockSink) -> SessionEvent {
        self.pump(deps, sink);
        self.event_after_pump()
    }

    /// Bytes arrived from the network.
    pub fn on_receive(
        &mut self,
        bytes: &[u8],
        deps: &mut SessionDeps<'_>,
        sink: &mut dyn BlockSink,
    ) -> SessionEvent {
        let mut input_overflow = false;
        for &byte in bytes {
            self.input_block[self.input_fill] = byte;
            self.input_fill += 1;
            if self.input_fill >= BLOCK_SIZE {
                if !self.handle_input_block(deps) {
                    // The current state cannot accept input; there is
                    // nowhere to buffer the rest of this packet.
                    input_overflow = true;
                    break;
                }
                self.input_fill = 0;
            }
        }

        if self.state == SessionState::Disconnect {
            // Input handling demanded an immediate close: drop the
            // connection before emitting anything further.
            return SessionEvent::CloseNow;
        }

        self.pump(deps, sink);
        if input_overflow {
            warn!("remote session: input overflow, disconnecting");
            self.state = SessionState::Disconnect;
        }
        self.event_after_pump()
    }

    /// The transport reported room for more output.
    pub fn on_writable(
        &mut self,
        deps: &mut SessionDeps<'_>,
        sink: &mut dyn BlockSink,
    ) -> SessionEvent {
        self.pump(deps, sink);
        self.event_after_pump()
    }

    /// Run the pending commit stage. Only valid after
    /// [`SessionEvent::CloseAndRunCommit`], with the socket closed.
    pub fn run_commit(&mut self, deps: &mut SessionDeps<'_>) {
        let msg_type = self.request_header.msg_type;
        let mut io = HandlerIo {
            data: &mut self.data,
            input_size: self.request_header.data_size as usize,
            parameter: self.request_header.parameter_or_result,
            output_size: 0,
        };
        deps.handlers.run_commit(&mut deps.ctx, msg_type, &mut io);
    }

    fn event_after_pump(&self) -> SessionEvent {
        match self.state {
            SessionState::Disconnect if !self.output_ready => SessionEvent::CloseNow,
            SessionState::ExecuteCommit if !self.output_ready => SessionEvent::CloseAndRunCommit,
            _ => SessionEvent::Continue,
        }
    }

    // ── Output side ──────────────────────────────────────────

    /// Generate-and-send until the transport fills or there is nothing
    /// left to say. The one-block buffer survives a full transport and
    /// is retried on the next writability event.
    fn pump(&mut self, deps: &mut SessionDeps<'_>, sink: &mut dyn BlockSink) {
        loop {
            if !self.output_ready {
                if !self.generate_output_block(deps.ctx.secret) {
                    return;
                }
                self.output_ready = true;
            }
            match sink.write_block(&self.output_block) {
                WriteOutcome::Sent => self.output_ready = false,
                WriteOutcome::Full => return,
                WriteOutcome::Error => {
                    self.state = SessionState::Disconnect;
                    return;
                }
            }
        }
    }

    /// Produce the next outbound block for the current state, if the
    /// state has one to send.
    fn generate_output_block(&mut self, secret: &SecretState) -> bool {
        match self.state {
            SessionState::SendGreeting => {
                let at = self.data_index;
                self.output_block
                    .copy_from_slice(&self.data[at..at + BLOCK_SIZE]);
                self.data_index += BLOCK_SIZE;
                if self.data_index >= self.reply_header.data_size as usize {
                    self.state = SessionState::ExpectRequest;
                }
                true
            }
            SessionState::SendChallenge => {
                crypto::fill_random(&mut self.server_challenge);
                self.output_block = [0; BLOCK_SIZE];
                self.output_block[0] = ID_CHALLENGE;
                self.output_block[1..].copy_from_slice(&self.server_challenge);
                self.state = SessionState::ExpectAuthentication;
                true
            }
            SessionState::SendAuthentication => {
                self.output_block = [0; BLOCK_SIZE];
                self.output_block[0] = ID_RESPONSE;
                crypto::generate_auth(
                    secret.hashed_key(),
                    &self.client_challenge,
                    &self.server_challenge,
                    b"SA",
                    &mut self.output_block[1..],
                );
                self.state = SessionState::ExpectAcknowledge;
                true
            }
            SessionState::SendBadMsgError => self.clear_error_block(ID_BAD_MSG_ERROR),
            SessionState::SendAuthError => self.clear_error_block(ID_AUTH_ERROR),
            SessionState::SendNoSecretError => self.clear_error_block(ID_NO_SECRET_ERROR),
            SessionState::SendCorruptError => self.encrypted_error_block(ID_CORRUPT_ERROR),
            SessionState::SendBadParamError => self.encrypted_error_block(ID_BAD_PARAM_ERROR),
            SessionState::SendBadHandlerError => self.encrypted_error_block(ID_BAD_HANDLER_ERROR),
            SessionState::SendEncReplyHeader => {
                let block = self.reply_header.encode();
                if !self.encrypt_into_output(&block) {
                    return false;
                }
                self.state = if self.reply_header.data_size == 0 {
                    SessionState::ExpectEncRequestHeader
                } else {
                    SessionState::SendEncReplyPayload
                };
                true
            }
            SessionState::SendEncReplyPayload => {
                let at = self.data_index;
                let mut block = [0u8; BLOCK_SIZE];
                block.copy_from_slice(&self.data[at..at + BLOCK_SIZE]);
                if !self.encrypt_into_output(&block) {
                    return false;
                }
                self.data_index += BLOCK_SIZE;
                if self.data_index >= self.reply_header.data_size as usize {
                    self.state = SessionState::ExpectEncRequestHeader;
                }
                true
            }
            SessionState::SendEncReplyHeaderWithCommit => {
                let block = self.reply_header.encode();
                if !self.encrypt_into_output(&block) {
                    return false;
                }
                self.state = SessionState::ExecuteCommit;
                true
            }
            _ => false,
        }
    }

    /// A handshake-stage error: one cleartext block, then disconnect.
    fn clear_error_block(&mut self, id: u8) -> bool {
        self.output_block = [0; BLOCK_SIZE];
        self.output_block[0] = id;
        self.state = SessionState::Disconnect;
        true
    }

    /// An encrypted-stage error: a zero-length header carrying the error
    /// id, sealed and encrypted, then disconnect.
    fn encrypted_error_block(&mut self, id: u8) -> bool {
        self.reply_header = MessageHeader {
            msg_type: id,
            ..MessageHeader::default()
        };
        self.reply_header.seal(&[]);
        let block = self.reply_header.encode();
        let ok = self.encrypt_into_output(&block);
        self.state = SessionState::Disconnect;
        ok
    }

    fn encrypt_into_output(&mut self, plaintext: &[u8; BLOCK_SIZE]) -> bool {
        let Some(encrypt) = self.encrypt.as_mut() else {
            // Key material missing in an encrypted state: unreachable by
            // construction, treated as a fatal protocol error.
            self.state = SessionState::Disconnect;
            return false;
        };
        self.output_block = encrypt.encrypt_block(plaintext);
        true
    }

    // ── Input side ───────────────────────────────────────────

    /// Consume one assembled input block. Returns `false` when the
    /// current state cannot accept input.
    fn handle_input_block(&mut self, deps: &mut SessionDeps<'_>) -> bool {
        match self.state {
            SessionState::ExpectRequest => {
                if self.input_block[0] != ID_REQUEST {
                    self.state = SessionState::SendBadMsgError;
                } else if !deps.ctx.secret.is_valid() {
                    info!("remote session refused: no update_secret configured");
                    self.state = SessionState::SendNoSecretError;
                } else {
                    self.client_challenge
                        .copy_from_slice(&self.input_block[1..]);
                    self.state = SessionState::SendChallenge;
                }
                true
            }
            SessionState::ExpectAuthentication => {
                if self.input_block[0] != ID_AUTHENTICATION {
                    self.state = SessionState::SendBadMsgError;
                } else {
                    let mut expected = [0u8; CHALLENGE_SIZE];
                    crypto::generate_auth(
                        deps.ctx.secret.hashed_key(),
                        &self.client_challenge,
                        &self.server_challenge,
                        b"CA",
                        &mut expected,
                    );
                    if crypto::constant_time_eq(&expected, &self.input_block[1..]) {
                        self.state = SessionState::SendAuthentication;
                    } else {
                        warn!("remote session: client authentication failed");
                        self.state = SessionState::SendAuthError;
                    }
                }
                true
            }
            SessionState::ExpectAcknowledge => {
                if self.input_block[0] != ID_ACKNOWLEDGE {
                    self.state = SessionState::SendBadMsgError;
                } else {
                    self.derive_session_keys(deps.ctx.secret);
                    info!("remote session authenticated");
                    self.state = SessionState::ExpectEncRequestHeader;
                }
                true
            }
            SessionState::ExpectEncRequestHeader => {
                self.start_encrypted_request(deps);
                true
            }
            SessionState::ExpectEncRequestPayload => {
                let Some(block) = self.decrypt_input_block() else {
                    return true;
                };
                let at = self.data_index;
                self.data[at..at + BLOCK_SIZE].copy_from_slice(&block);
                self.data_index += BLOCK_SIZE;
                if self.data_index >= self.request_header.data_size as usize {
                    self.finish_encrypted_request(deps);
                }
                true
            }
            // Every send-side and terminal state: input cannot land.
            _ => false,
        }
    }

    fn derive_session_keys(&mut self, secret: &SecretState) {
        let mut key = [0u8; AES_KEY_SIZE];
        crypto::generate_auth(
            secret.hashed_key(),
            &self.client_challenge,
            &self.server_challenge,
            b"SK",
            &mut key,
        );
        self.encrypt = Some(CbcState::new(&key));
        crypto::generate_auth(
            secret.hashed_key(),
            &self.client_challenge,
            &self.server_challenge,
            b"CK",
            &mut key,
        );
        self.decrypt = Some(CbcState::new(&key));
        key.fill(0);
    }

    fn decrypt_input_block(&mut self) -> Option<[u8; BLOCK_SIZE]> {
        let Some(decrypt) = self.decrypt.as_mut() else {
            self.state = SessionState::Disconnect;
            return None;
        };
        Some(decrypt.decrypt_block(&self.input_block))
    }

    fn start_encrypted_request(&mut self, deps: &mut SessionDeps<'_>) {
        let Some(block) = self.decrypt_input_block() else {
            return;
        };
        self.request_header = MessageHeader::decode(&block);

        if !deps.handlers.is_registered(self.request_header.msg_type) {
            warn!(
                "remote request for unregistered handler {}",
                self.request_header.msg_type
            );
            self.state = SessionState::SendBadHandlerError;
            return;
        }
        if self.request_header.data_size as usize > MAX_DATA_SIZE {
            self.state = SessionState::SendBadParamError;
            return;
        }

        self.data_index = 0;
        if self.request_header.data_size == 0 {
            self.finish_encrypted_request(deps);
        } else {
            self.state = SessionState::ExpectEncRequestPayload;
        }
    }

    fn finish_encrypted_request(&mut self, deps: &mut SessionDeps<'_>) {
        let request = self.request_header;
        if !request.verify(&self.data[..request.data_size as usize]) {
            warn!("remote request failed its integrity check");
            self.state = SessionState::SendCorruptError;
            return;
        }

        let mut io = HandlerIo {
            data: &mut self.data,
            input_size: request.data_size as usize,
            parameter: request.parameter_or_result,
            output_size: 0,
        };
        // The registration may have changed since the header check.
        let Some(outcome) = deps.handlers.dispatch(&mut deps.ctx, request.msg_type, &mut io)
        else {
            self.state = SessionState::SendBadHandlerError;
            return;
        };

        self.data_index = 0;
        self.reply_header = MessageHeader {
            msg_type: ID_OK,
            parameter_or_result: outcome.result,
            ..MessageHeader::default()
        };

        if outcome.commit_pending {
            // Header-only reply; the produced buffer and result are kept
            // for the commit stage instead of the network.
            self.reply_header.data_size = 0;
            self.request_header.data_size = outcome.output_size as u32;
            self.request_header.parameter_or_result = outcome.result;
            self.state = SessionState::SendEncReplyHeaderWithCommit;
        } else {
            self.reply_header.data_size = outcome.output_size as u32;
            self.state = SessionState::SendEncReplyHeader;
        }
        let payload_size = self.reply_header.data_size as usize;
        let (reply_header, data) = (&mut self.reply_header, &self.data);
        reply_header.seal(&data[..payload_size]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::device_id::{board_id_hex, read_board_id};
    use crate::adapters::flash::SimFlash;
    use crate::adapters::system::SimSystem;
    use crate::adapters::wifi::SimWifi;
    use crate::error::Error;
    use crate::flash::storage::SettingsFile;
    use crate::ports::FlashPort;
    use crate::remote::crypto::stretch_secret;
    use crate::remote::handlers::install_builtin_handlers;
    use crate::remote::{
        ID_INFO_HANDLER, ID_UPDATE_HANDLER, ID_UPDATE_REBOOT_HANDLER,
    };

    const SECRET: &[u8] = b"test-update-secret";

    // ── Harness ──────────────────────────────────────────────

    struct World {
        flash: SimFlash,
        system: SimSystem,
        wifi: SimWifi,
        secret: SecretState,
        handlers: HandlerTable,
    }

    impl World {
        fn new(settings_text: &[u8]) -> Self {
            let mut flash = SimFlash::new();
            flash.seed_settings(settings_text);
            let mut secret = SecretState::empty();
            secret.refresh(&SettingsFile::load(&flash).unwrap());
            let mut handlers = HandlerTable::new();
            install_builtin_handlers(&mut handlers).unwrap();
            Self {
                flash,
                system: SimSystem::new(),
                wifi: SimWifi::new(),
                secret,
                handlers,
            }
        }

        fn with_secret() -> Self {
            Self::new(b"update_secret=test-update-secret\nname=rig\n")
        }

        fn deps(&mut self) -> SessionDeps<'_> {
            SessionDeps {
                handlers: &mut self.handlers,
                ctx: HandlerCtx {
                    flash: &mut self.flash,
                    system: &mut self.system,
                    wifi: &mut self.wifi,
                    secret: &mut self.secret,
                    board_id: read_board_id(),
                },
            }
        }
    }

    struct VecSink {
        blocks: Vec<[u8; BLOCK_SIZE]>,
        mode: WriteOutcome,
    }

    impl VecSink {
        fn new() -> Self {
            Self {
                blocks: Vec::new(),
                mode: WriteOutcome::Sent,
            }
        }

        fn drain(&mut self) -> Vec<[u8; BLOCK_SIZE]> {
            std::mem::take(&mut self.blocks)
        }

        fn take_single(&mut self) -> [u8; BLOCK_SIZE] {
            let blocks = self.drain();
            assert_eq!(blocks.len(), 1, "expected exactly one block");
            blocks[0]
        }
    }

    impl BlockSink for VecSink {
        fn write_block(&mut self, block: &[u8; BLOCK_SIZE]) -> WriteOutcome {
            if self.mode == WriteOutcome::Sent {
                self.blocks.push(*block);
            }
            self.mode
        }
    }

    fn block(id: u8, rest: &[u8]) -> [u8; BLOCK_SIZE] {
        let mut out = [0u8; BLOCK_SIZE];
        out[0] = id;
        out[1..1 + rest.len()].copy_from_slice(rest);
        out
    }

    fn board_hex() -> String {
        board_id_hex(&read_board_id()).as_str().to_string()
    }

    /// The client's half of the encrypted channel.
    struct ClientChannel {
        encrypt: CbcState,
        decrypt: CbcState,
    }

    impl ClientChannel {
        fn request_bytes(
            &mut self,
            msg_type: u8,
            parameter: i32,
            payload: &[u8],
            tamper_hash: bool,
        ) -> Vec<u8> {
            let mut header = MessageHeader {
                data_size: payload.len() as u32,
                parameter_or_result: parameter,
                msg_type,
                ..MessageHeader::default()
            };
            header.seal(payload);
            if tamper_hash {
                header.data_hash[2] ^= 0x10;
            }

            let mut bytes = Vec::new();
            bytes.extend_from_slice(&self.encrypt.encrypt_block(&header.encode()));
            for chunk in payload.chunks(BLOCK_SIZE) {
                let mut plain = [0u8; BLOCK_SIZE];
                plain[..chunk.len()].copy_from_slice(chunk);
                bytes.extend_from_slice(&self.encrypt.encrypt_block(&plain));
            }
            bytes
        }

        fn decode_reply(&mut self, blocks: &[[u8; BLOCK_SIZE]]) -> (MessageHeader, Vec<u8>) {
            let header = MessageHeader::decode(&self.decrypt.decrypt_block(&blocks[0]));
            let mut payload = Vec::new();
            for b in &blocks[1..] {
                payload.extend_from_slice(&self.decrypt.decrypt_block(b));
            }
            payload.truncate(header.data_size as usize);
            assert_eq!(
                blocks.len() - 1,
                (header.data_size as usize).div_ceil(BLOCK_SIZE)
            );
            (header, payload)
        }
    }

    /// Run the whole handshake; returns the authenticated session and
    /// the client-side cipher states.
    fn authenticate(world: &mut World) -> (Session, VecSink, ClientChannel) {
        let mut session = Session::new(&board_hex());
        let mut sink = VecSink::new();

        assert_eq!(
            session.on_accept(&mut world.deps(), &mut sink),
            SessionEvent::Continue
        );
        let greeting: Vec<u8> = sink.drain().concat();
        assert_eq!(greeting[0], ID_GREETING);
        assert_eq!(greeting[1], PROTOCOL_VERSION);
        assert_eq!(greeting.len(), greeting[2] as usize * BLOCK_SIZE);
        assert_eq!(&greeting[4..20], board_hex().as_bytes());

        let client_challenge = [0x42u8; CHALLENGE_SIZE];
        let ev = session.on_receive(
            &block(ID_REQUEST, &client_challenge),
            &mut world.deps(),
            &mut sink,
        );
        assert_eq!(ev, SessionEvent::Continue);
        let challenge_block = sink.take_single();
        assert_eq!(challenge_block[0], ID_CHALLENGE);
        let mut server_challenge = [0u8; CHALLENGE_SIZE];
        server_challenge.copy_from_slice(&challenge_block[1..]);

        let key = stretch_secret(SECRET);
        let mut client_auth = [0u8; CHALLENGE_SIZE];
        crypto::generate_auth(
            &key,
            &client_challenge,
            &server_challenge,
            b"CA",
            &mut client_auth,
        );
        let ev = session.on_receive(
            &block(ID_AUTHENTICATION, &client_auth),
            &mut world.deps(),
            &mut sink,
        );
        assert_eq!(ev, SessionEvent::Continue);
        let response = sink.take_single();
        assert_eq!(response[0], ID_RESPONSE);
        let mut expected_server_auth = [0u8; CHALLENGE_SIZE];
        crypto::generate_auth(
            &key,
            &client_challenge,
            &server_challenge,
            b"SA",
            &mut expected_server_auth,
        );
        assert_eq!(&response[1..], &expected_server_auth);

        let ev = session.on_receive(&block(ID_ACKNOWLEDGE, &[]), &mut world.deps(), &mut sink);
        assert_eq!(ev, SessionEvent::Continue);
        assert_eq!(session.state(), SessionState::ExpectEncRequestHeader);

        let mut client_to_server = [0u8; AES_KEY_SIZE];
        let mut server_to_client = [0u8; AES_KEY_SIZE];
        crypto::generate_auth(
            &key,
            &client_challenge,
            &server_challenge,
            b"CK",
            &mut client_to_server,
        );
        crypto::generate_auth(
            &key,
            &client_challenge,
            &server_challenge,
            b"SK",
            &mut server_to_client,
        );
        let channel = ClientChannel {
            encrypt: CbcState::new(&client_to_server),
            decrypt: CbcState::new(&server_to_client),
        };
        (session, sink, channel)
    }

    // ── Handshake ────────────────────────────────────────────

    #[test]
    fn handshake_with_valid_secret_reaches_the_encrypted_channel() {
        let mut world = World::with_secret();
        let _ = authenticate(&mut world);
    }

    #[test]
    fn no_secret_is_reported_in_cleartext() {
        let mut world = World::new(b"ssid1=Net\n");
        let mut session = Session::new(&board_hex());
        let mut sink = VecSink::new();
        session.on_accept(&mut world.deps(), &mut sink);
        sink.drain();

        let ev = session.on_receive(
            &block(ID_REQUEST, &[0x42; CHALLENGE_SIZE]),
            &mut world.deps(),
            &mut sink,
        );
        assert_eq!(ev, SessionEvent::CloseNow);
        assert_eq!(sink.take_single(), block(ID_NO_SECRET_ERROR, &[]));
    }

    #[test]
    fn unexpected_first_byte_is_a_bad_message() {
        let mut world = World::with_secret();
        let mut session = Session::new(&board_hex());
        let mut sink = VecSink::new();
        session.on_accept(&mut world.deps(), &mut sink);
        sink.drain();

        let ev = session.on_receive(&block(0x55, &[]), &mut world.deps(), &mut sink);
        assert_eq!(ev, SessionEvent::CloseNow);
        assert_eq!(sink.take_single(), block(ID_BAD_MSG_ERROR, &[]));
    }

    #[test]
    fn wrong_client_authentication_is_rejected() {
        let mut world = World::with_secret();
        let mut session = Session::new(&board_hex());
        let mut sink = VecSink::new();
        session.on_accept(&mut world.deps(), &mut sink);
        sink.drain();

        session.on_receive(
            &block(ID_REQUEST, &[0x42; CHALLENGE_SIZE]),
            &mut world.deps(),
            &mut sink,
        );
        sink.drain();

        // A proof computed with the wrong tag never matches.
        let ev = session.on_receive(
            &block(ID_AUTHENTICATION, &[0xEE; CHALLENGE_SIZE]),
            &mut world.deps(),
            &mut sink,
        );
        assert_eq!(ev, SessionEvent::CloseNow);
        assert_eq!(sink.take_single(), block(ID_AUTH_ERROR, &[]));
    }

    #[test]
    fn wrong_acknowledge_byte_is_a_bad_message() {
        let mut world = World::with_secret();
        let mut session = Session::new(&board_hex());
        let mut sink = VecSink::new();
        session.on_accept(&mut world.deps(), &mut sink);
        sink.drain();

        session.on_receive(
            &block(ID_REQUEST, &[0x42; CHALLENGE_SIZE]),
            &mut world.deps(),
            &mut sink,
        );
        let challenge_block = sink.take_single();
        let mut server_challenge = [0u8; CHALLENGE_SIZE];
        server_challenge.copy_from_slice(&challenge_block[1..]);
        let key = stretch_secret(SECRET);
        let mut client_auth = [0u8; CHALLENGE_SIZE];
        crypto::generate_auth(
            &key,
            &[0x42; CHALLENGE_SIZE],
            &server_challenge,
            b"CA",
            &mut client_auth,
        );
        session.on_receive(
            &block(ID_AUTHENTICATION, &client_auth),
            &mut world.deps(),
            &mut sink,
        );
        sink.drain();

        let ev = session.on_receive(&block(ID_REQUEST, &[]), &mut world.deps(), &mut sink);
        assert_eq!(ev, SessionEvent::CloseNow);
        assert_eq!(sink.take_single(), block(ID_BAD_MSG_ERROR, &[]));
    }

    // ── Encrypted requests ───────────────────────────────────

    #[test]
    fn info_request_round_trip() {
        let mut world = World::with_secret();
        let (mut session, mut sink, mut channel) = authenticate(&mut world);

        let bytes = channel.request_bytes(ID_INFO_HANDLER, 0, b"", false);
        let ev = session.on_receive(&bytes, &mut world.deps(), &mut sink);
        assert_eq!(ev, SessionEvent::Continue);

        let (header, payload) = channel.decode_reply(&sink.drain());
        assert_eq!(header.msg_type, ID_OK);
        assert_eq!(header.parameter_or_result, 0);
        assert!(header.verify(&payload));
        let text = String::from_utf8(payload).unwrap();
        assert!(text.contains(&format!("board_id={}\n", board_hex())));
        assert_eq!(session.state(), SessionState::ExpectEncRequestHeader);
    }

    #[test]
    fn settings_update_request_writes_flash_and_keeps_the_session() {
        let mut world = World::with_secret();
        let (mut session, mut sink, mut channel) = authenticate(&mut world);

        let file = b"update_secret=rotated\nssid1=NewNet\n";
        let bytes = channel.request_bytes(ID_UPDATE_HANDLER, 0, file, false);
        let ev = session.on_receive(&bytes, &mut world.deps(), &mut sink);
        assert_eq!(ev, SessionEvent::Continue);

        let (header, payload) = channel.decode_reply(&sink.drain());
        assert_eq!(header.msg_type, ID_OK);
        assert_eq!(header.parameter_or_result, file.len() as i32);
        assert!(payload.is_empty());

        let region = world.flash.layout().settings_file();
        assert_eq!(world.flash.contents(region.start, file.len()), file.as_slice());
        assert_eq!(world.secret.hashed_key(), &stretch_secret(b"rotated"));

        // The channel stays usable for the next request.
        let bytes = channel.request_bytes(ID_INFO_HANDLER, 0, b"", false);
        let ev = session.on_receive(&bytes, &mut world.deps(), &mut sink);
        assert_eq!(ev, SessionEvent::Continue);
        let (header, _) = channel.decode_reply(&sink.drain());
        assert_eq!(header.msg_type, ID_OK);
    }

    #[test]
    fn tampered_data_hash_is_a_corrupt_error() {
        let mut world = World::with_secret();
        let (mut session, mut sink, mut channel) = authenticate(&mut world);

        let bytes = channel.request_bytes(ID_UPDATE_HANDLER, 0, b"ssid1=X\n", true);
        let ev = session.on_receive(&bytes, &mut world.deps(), &mut sink);
        assert_eq!(ev, SessionEvent::CloseNow);

        let (header, payload) = channel.decode_reply(&sink.drain());
        assert_eq!(header.msg_type, ID_CORRUPT_ERROR);
        assert_eq!(header.data_size, 0);
        assert!(payload.is_empty());
        assert!(world.flash.ops().is_empty());
    }

    #[test]
    fn unregistered_message_type_is_a_bad_handler_error() {
        let mut world = World::with_secret();
        let (mut session, mut sink, mut channel) = authenticate(&mut world);

        let bytes = channel.request_bytes(140, 0, b"", false);
        let ev = session.on_receive(&bytes, &mut world.deps(), &mut sink);
        assert_eq!(ev, SessionEvent::CloseNow);
        let (header, _) = channel.decode_reply(&sink.drain());
        assert_eq!(header.msg_type, ID_BAD_HANDLER_ERROR);
    }

    #[test]
    fn oversized_request_is_a_bad_param_error() {
        let mut world = World::with_secret();
        let (mut session, mut sink, mut channel) = authenticate(&mut world);

        let mut header = MessageHeader {
            data_size: (MAX_DATA_SIZE + 1) as u32,
            parameter_or_result: 0,
            msg_type: ID_INFO_HANDLER,
            ..MessageHeader::default()
        };
        header.seal(&[]);
        let bytes = channel.encrypt.encrypt_block(&header.encode());
        let ev = session.on_receive(&bytes, &mut world.deps(), &mut sink);
        assert_eq!(ev, SessionEvent::CloseNow);
        let (reply, _) = channel.decode_reply(&sink.drain());
        assert_eq!(reply.msg_type, ID_BAD_PARAM_ERROR);
    }

    #[test]
    fn user_handler_receives_its_request() {
        let mut world = World::with_secret();
        world
            .handlers
            .set_handler(
                130,
                Box::new(|_, _, io| {
                    let doubled: Vec<u8> = io.input().iter().map(|b| b.wrapping_mul(2)).collect();
                    io.set_output(&doubled);
                    io.input_size as i32
                }),
            )
            .unwrap();
        let (mut session, mut sink, mut channel) = authenticate(&mut world);

        let bytes = channel.request_bytes(130, 0, &[1, 2, 3, 40], false);
        session.on_receive(&bytes, &mut world.deps(), &mut sink);
        let (header, payload) = channel.decode_reply(&sink.drain());
        assert_eq!(header.parameter_or_result, 4);
        assert_eq!(payload, vec![2, 4, 6, 80]);
    }

    // ── Two-stage handlers ───────────────────────────────────

    #[test]
    fn update_reboot_acknowledges_then_commits() {
        let mut world = World::with_secret();
        let (mut session, mut sink, mut channel) = authenticate(&mut world);

        let file = b"ssid1=AfterReboot\n";
        let bytes = channel.request_bytes(ID_UPDATE_REBOOT_HANDLER, 0, file, false);
        let ev = session.on_receive(&bytes, &mut world.deps(), &mut sink);
        assert_eq!(ev, SessionEvent::CloseAndRunCommit);

        // Header-only acknowledgment, and nothing destructive yet.
        let (header, payload) = channel.decode_reply(&sink.drain());
        assert_eq!(header.msg_type, ID_OK);
        assert_eq!(header.data_size, 0);
        assert!(payload.is_empty());
        assert!(!world.system.rebooted());
        assert!(world.flash.ops().is_empty());

        // The service closes the socket, then runs the commit.
        session.run_commit(&mut world.deps());
        assert!(world.system.rebooted());
        let region = world.flash.layout().settings_file();
        assert_eq!(world.flash.contents(region.start, file.len()), file.as_slice());
    }

    #[cfg(feature = "memory-access")]
    #[test]
    fn ota_verify_failure_still_acknowledges_without_committing() {
        use crate::remote::memory_access::OtaRequest;
        use crate::remote::ID_OTA_FIRMWARE_UPDATE_HANDLER;

        let mut world = World::with_secret();
        let (mut session, mut sink, mut channel) = authenticate(&mut world);

        // Unaligned garbage request: verify fails, commit must refuse.
        let request = OtaRequest {
            copy_from: crate::flash::range::FlashRange { start: 3, size: 5 },
            copy_to: crate::flash::range::FlashRange { start: 9, size: 5 },
            sha256: [0; 32],
        };
        let bytes =
            channel.request_bytes(ID_OTA_FIRMWARE_UPDATE_HANDLER, 0, &request.encode(), false);
        let ev = session.on_receive(&bytes, &mut world.deps(), &mut sink);
        assert_eq!(ev, SessionEvent::CloseAndRunCommit);

        let (header, _) = channel.decode_reply(&sink.drain());
        assert_eq!(header.parameter_or_result, Error::BadAlignment.code());

        session.run_commit(&mut world.deps());
        assert!(!world.system.rebooted());
        assert!(world.flash.ops().is_empty());
    }

    // ── Flow control ─────────────────────────────────────────

    #[test]
    fn full_transport_keeps_one_block_and_resumes() {
        let mut world = World::with_secret();
        let mut session = Session::new(&board_hex());
        let mut sink = VecSink::new();
        sink.mode = WriteOutcome::Full;

        let ev = session.on_accept(&mut world.deps(), &mut sink);
        assert_eq!(ev, SessionEvent::Continue);
        assert!(session.has_pending_output());
        assert!(sink.blocks.is_empty());

        sink.mode = WriteOutcome::Sent;
        let ev = session.on_writable(&mut world.deps(), &mut sink);
        assert_eq!(ev, SessionEvent::Continue);
        assert!(!session.has_pending_output());
        let greeting: Vec<u8> = sink.drain().concat();
        assert_eq!(greeting[0], ID_GREETING);
        assert_eq!(session.state(), SessionState::ExpectRequest);
    }

    #[test]
    fn transport_error_disconnects() {
        let mut world = World::with_secret();
        let mut session = Session::new(&board_hex());
        let mut sink = VecSink::new();
        sink.mode = WriteOutcome::Error;

        let ev = session.on_accept(&mut world.deps(), &mut sink);
        assert_eq!(ev, SessionEvent::CloseNow);
    }

    #[test]
    fn input_during_a_blocked_send_overflows_and_disconnects() {
        let mut world = World::with_secret();
        let mut session = Session::new(&board_hex());
        let mut sink = VecSink::new();
        sink.mode = WriteOutcome::Full;
        session.on_accept(&mut world.deps(), &mut sink);

        // The greeting is still being sent; a full input block cannot be
        // consumed, so the session flushes and then disconnects.
        let ev = session.on_receive(&[0u8; BLOCK_SIZE], &mut world.deps(), &mut sink);
        assert_eq!(ev, SessionEvent::Continue);

        sink.mode = WriteOutcome::Sent;
        let ev = session.on_writable(&mut world.deps(), &mut sink);
        assert_eq!(ev, SessionEvent::CloseNow);
    }

    #[test]
    fn partial_input_blocks_are_assembled() {
        let mut world = World::with_secret();
        let mut session = Session::new(&board_hex());
        let mut sink = VecSink::new();
        session.on_accept(&mut world.deps(), &mut sink);
        sink.drain();

        let request = block(ID_REQUEST, &[0x42; CHALLENGE_SIZE]);
        for chunk in request.chunks(5) {
            session.on_receive(chunk, &mut world.deps(), &mut sink);
        }
        let challenge = sink.take_single();
        assert_eq!(challenge[0], ID_CHALLENGE);
    }
}
