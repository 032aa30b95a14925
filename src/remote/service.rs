//! The remote-control service: listener, discovery responder, and the
//! event pump gluing sockets to the session state machine.
//!
//! Networking is `std::net` in non-blocking mode — identical on ESP-IDF
//! and the host, so the whole service (not a mock of it) runs under the
//! integration tests. The embedding application calls [`RemoteService::poll`]
//! from its event loop; nothing here blocks.
//!
//! One client at a time by design: a second connection is accepted and
//! immediately dropped, which surfaces as a clean close on the client
//! side rather than a hang in a backlog queue.

use std::io::{Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream, UdpSocket};

use log::{info, warn};

use crate::adapters::device_id::{board_id_hex, read_board_id, BoardId};
use crate::error::{Error, Result};
use crate::flash::storage::SettingsFile;
use crate::ports::{FlashPort, SystemPort, WifiPort};

use super::crypto::SecretState;
use super::handlers::install_builtin_handlers;
use super::registry::{HandlerCtx, HandlerTable, Stage1Fn, Stage2Fn};
use super::session::{BlockSink, Session, SessionDeps, SessionEvent, WriteOutcome};
use super::{discovery, BLOCK_SIZE, REMOTE_PORT};

/// Bytes read from the socket per pump iteration.
const READ_CHUNK: usize = 512;

struct ActiveConnection {
    stream: TcpStream,
    session: Session,
    /// Unsent tail of a block the socket only partially accepted.
    pending: Vec<u8>,
}

/// The remote service singleton. Construct with [`Self::init`] once the
/// network is up, then drive with [`Self::poll`].
pub struct RemoteService {
    listener: TcpListener,
    responder: UdpSocket,
    handlers: HandlerTable,
    secret: SecretState,
    board_id: BoardId,
    board_id_hex: String,
    active: Option<ActiveConnection>,
}

impl RemoteService {
    /// Bind both sockets on [`REMOTE_PORT`] and load the secret.
    pub fn init(flash: &dyn FlashPort) -> Result<Self> {
        Self::init_on_port(flash, REMOTE_PORT)
    }

    /// Bind on a specific port (0 picks an ephemeral port; the UDP
    /// responder follows whatever the listener got).
    pub fn init_on_port(flash: &dyn FlashPort, port: u16) -> Result<Self> {
        let listener =
            TcpListener::bind(("0.0.0.0", port)).map_err(|_| Error::ResourceInUse)?;
        listener.set_nonblocking(true).map_err(|_| Error::Generic)?;
        let port = listener
            .local_addr()
            .map_err(|_| Error::Generic)?
            .port();
        let responder = UdpSocket::bind(("0.0.0.0", port)).map_err(|_| Error::ResourceInUse)?;
        responder.set_nonblocking(true).map_err(|_| Error::Generic)?;

        let mut secret = SecretState::empty();
        secret.refresh(&SettingsFile::load(flash)?);

        let mut handlers = HandlerTable::new();
        install_builtin_handlers(&mut handlers)?;

        let board_id = read_board_id();
        let board_id_hex = board_id_hex(&board_id).as_str().to_string();
        info!("remote service listening on port {port} as {board_id_hex}");

        Ok(Self {
            listener,
            responder,
            handlers,
            secret,
            board_id,
            board_id_hex,
            active: None,
        })
    }

    /// The bound port (useful with ephemeral binding in tests).
    pub fn local_port(&self) -> u16 {
        self.listener.local_addr().map(|a| a.port()).unwrap_or(0)
    }

    /// Register a user handler (message types 128..=143).
    pub fn set_handler(&mut self, msg_type: u8, stage1: Stage1Fn) -> Result<()> {
        self.handlers.set_handler(msg_type, stage1)
    }

    /// Register a two-stage user handler.
    pub fn set_two_stage_handler(
        &mut self,
        msg_type: u8,
        verify: Option<Stage1Fn>,
        commit: Stage2Fn,
    ) -> Result<()> {
        self.handlers.set_two_stage_handler(msg_type, verify, commit)
    }

    /// Re-read `update_secret` from flash, e.g. after an out-of-band
    /// settings change.
    pub fn update_secret(&mut self, flash: &dyn FlashPort) -> Result<()> {
        self.secret.refresh(&SettingsFile::load(flash)?);
        Ok(())
    }

    /// Whether a client connection is currently open.
    pub fn has_active_session(&self) -> bool {
        self.active.is_some()
    }

    /// One event-loop iteration: accept, pump the session, answer
    /// discovery queries.
    pub fn poll(
        &mut self,
        flash: &mut dyn FlashPort,
        system: &mut dyn SystemPort,
        wifi: &mut dyn WifiPort,
    ) {
        let Self {
            listener,
            responder,
            handlers,
            secret,
            board_id,
            board_id_hex,
            active,
        } = self;
        let mut deps = SessionDeps {
            handlers,
            ctx: HandlerCtx {
                flash,
                system,
                wifi,
                secret,
                board_id: *board_id,
            },
        };

        accept_connections(listener, active, board_id_hex, &mut deps);
        pump_session(active, &mut deps);
        answer_discovery(responder, board_id_hex);
    }
}

fn accept_connections(
    listener: &TcpListener,
    active: &mut Option<ActiveConnection>,
    board_id_hex: &str,
    deps: &mut SessionDeps<'_>,
) {
    loop {
        match listener.accept() {
            Ok((stream, peer)) => {
                if active.is_some() {
                    // One session at a time; refuse the newcomer cleanly.
                    info!("remote: rejecting second client {peer}");
                    let _ = stream.shutdown(Shutdown::Both);
                    continue;
                }
                if stream.set_nonblocking(true).is_err() {
                    continue;
                }
                let _ = stream.set_nodelay(true);
                info!("remote: client {peer} connected");

                let mut conn = ActiveConnection {
                    stream,
                    session: Session::new(board_id_hex),
                    pending: Vec::new(),
                };
                let event = {
                    let mut sink = StreamSink {
                        stream: &mut conn.stream,
                        pending: &mut conn.pending,
                    };
                    conn.session.on_accept(deps, &mut sink)
                };
                *active = Some(conn);
                conclude(active, event, deps);
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return,
            Err(e) => {
                warn!("remote: accept failed: {e}");
                return;
            }
        }
    }
}

fn pump_session(active: &mut Option<ActiveConnection>, deps: &mut SessionDeps<'_>) {
    // Retry any block the transport refused earlier.
    if let Some(conn) = active.as_mut() {
        if conn.session.has_pending_output() || !conn.pending.is_empty() {
            let event = {
                let mut sink = StreamSink {
                    stream: &mut conn.stream,
                    pending: &mut conn.pending,
                };
                conn.session.on_writable(deps, &mut sink)
            };
            conclude(active, event, deps);
        }
    }

    let mut buf = [0u8; READ_CHUNK];
    while let Some(conn) = active.as_mut() {
        match conn.stream.read(&mut buf) {
            Ok(0) => {
                info!("remote: client closed the connection");
                *active = None;
            }
            Ok(n) => {
                let event = {
                    let mut sink = StreamSink {
                        stream: &mut conn.stream,
                        pending: &mut conn.pending,
                    };
                    conn.session.on_receive(&buf[..n], deps, &mut sink)
                };
                let closed = event != SessionEvent::Continue;
                conclude(active, event, deps);
                if closed {
                    return;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => {
                warn!("remote: read failed: {e}");
                *active = None;
            }
        }
    }
}

/// Apply a session event to the connection slot.
fn conclude(
    active: &mut Option<ActiveConnection>,
    event: SessionEvent,
    deps: &mut SessionDeps<'_>,
) {
    match event {
        SessionEvent::Continue => {}
        SessionEvent::CloseNow => {
            if let Some(conn) = active.take() {
                let _ = conn.stream.shutdown(Shutdown::Both);
            }
        }
        SessionEvent::CloseAndRunCommit => {
            if let Some(conn) = active.take() {
                let ActiveConnection {
                    stream,
                    mut session,
                    ..
                } = conn;
                // The commit may reboot; the acknowledgment must be out
                // of the door first.
                let _ = stream.shutdown(Shutdown::Both);
                drop(stream);
                session.run_commit(deps);
            }
        }
    }
}

fn answer_discovery(responder: &UdpSocket, board_id_hex: &str) {
    let mut packet = [0u8; 64];
    loop {
        match responder.recv_from(&mut packet) {
            Ok((n, peer)) => {
                if let Some(reply) = discovery::handle_packet(board_id_hex, &packet[..n]) {
                    info!("discovery: answering {peer}");
                    let _ = responder.send_to(&reply, peer);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return,
            Err(_) => return,
        }
    }
}

// ── Socket-backed block sink ─────────────────────────────────

/// Adapts the non-blocking stream to the session's one-block contract.
/// A partially-written block is owned here (`pending`) and flushed
/// before anything else goes out, so block order is preserved.
struct StreamSink<'a> {
    stream: &'a mut TcpStream,
    pending: &'a mut Vec<u8>,
}

impl StreamSink<'_> {
    /// Returns `Ok(true)` when the pending tail is fully flushed.
    fn flush_pending(&mut self) -> std::io::Result<bool> {
        while !self.pending.is_empty() {
            match self.stream.write(self.pending) {
                Ok(0) => return Err(std::io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    self.pending.drain(..n);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }
}

impl BlockSink for StreamSink<'_> {
    fn write_block(&mut self, block: &[u8; BLOCK_SIZE]) -> WriteOutcome {
        match self.flush_pending() {
            Ok(true) => {}
            Ok(false) => return WriteOutcome::Full,
            Err(_) => return WriteOutcome::Error,
        }
        match self.stream.write(block) {
            Ok(n) if n == BLOCK_SIZE => WriteOutcome::Sent,
            Ok(n) => {
                // The block is accepted from the session's point of
                // view; the tail is ours to deliver.
                self.pending.extend_from_slice(&block[n..]);
                WriteOutcome::Sent
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => WriteOutcome::Full,
            Err(_) => WriteOutcome::Error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::flash::SimFlash;
    use crate::adapters::system::SimSystem;
    use crate::adapters::wifi::SimWifi;
    use crate::remote::{ID_GREETING, PROTOCOL_VERSION};
    use std::time::Duration;

    struct Fixture {
        service: RemoteService,
        flash: SimFlash,
        system: SimSystem,
        wifi: SimWifi,
    }

    impl Fixture {
        fn new() -> Self {
            let _ = env_logger::builder().is_test(true).try_init();
            let mut flash = SimFlash::new();
            flash.seed_settings(b"update_secret=abc\n");
            let service = RemoteService::init_on_port(&flash, 0).unwrap();
            Self {
                service,
                flash,
                system: SimSystem::new(),
                wifi: SimWifi::new(),
            }
        }

        fn poll(&mut self) {
            self.service
                .poll(&mut self.flash, &mut self.system, &mut self.wifi);
        }

        fn poll_times(&mut self, times: usize) {
            for _ in 0..times {
                self.poll();
                std::thread::sleep(Duration::from_millis(2));
            }
        }

        fn connect(&mut self) -> TcpStream {
            let stream =
                TcpStream::connect(("127.0.0.1", self.service.local_port())).unwrap();
            stream
                .set_read_timeout(Some(Duration::from_millis(500)))
                .unwrap();
            stream
        }
    }

    #[test]
    fn greeting_arrives_on_connect() {
        let mut fixture = Fixture::new();
        let mut client = fixture.connect();
        fixture.poll_times(3);

        let mut greeting = [0u8; 64];
        client.read_exact(&mut greeting).unwrap();
        assert_eq!(greeting[0], ID_GREETING);
        assert_eq!(greeting[1], PROTOCOL_VERSION);
        assert_eq!(greeting[2], 4);
        assert!(fixture.service.has_active_session());
    }

    #[test]
    fn second_client_is_rejected_cleanly() {
        let mut fixture = Fixture::new();
        let _first = fixture.connect();
        fixture.poll_times(2);
        assert!(fixture.service.has_active_session());

        let mut second = fixture.connect();
        fixture.poll_times(3);
        // The rejected socket reads EOF, not a hang.
        let mut buf = [0u8; 16];
        assert_eq!(second.read(&mut buf).unwrap_or(0), 0);
        assert!(fixture.service.has_active_session());
    }

    #[test]
    fn client_disconnect_frees_the_slot() {
        let mut fixture = Fixture::new();
        let client = fixture.connect();
        fixture.poll_times(2);
        assert!(fixture.service.has_active_session());

        drop(client);
        fixture.poll_times(3);
        assert!(!fixture.service.has_active_session());

        // A new client can connect afterwards.
        let _client = fixture.connect();
        fixture.poll_times(2);
        assert!(fixture.service.has_active_session());
    }

    #[test]
    fn discovery_answers_matching_queries() {
        let mut fixture = Fixture::new();
        let client = UdpSocket::bind(("127.0.0.1", 0)).unwrap();
        client
            .set_read_timeout(Some(Duration::from_millis(500)))
            .unwrap();
        let target = ("127.0.0.1", fixture.service.local_port());

        let mut query = b"PWS?E6614854".to_vec();
        query.push(0);
        client.send_to(&query, target).unwrap();
        fixture.poll_times(3);

        let mut reply = [0u8; 64];
        let (n, _) = client.recv_from(&mut reply).unwrap();
        assert_eq!(n, discovery::PACKET_SIZE);
        assert_eq!(&reply[..4], b"PWS:");
        assert_eq!(&reply[4..20], b"E6614854D3885D30");
    }

    #[test]
    fn discovery_ignores_foreign_queries() {
        let mut fixture = Fixture::new();
        let client = UdpSocket::bind(("127.0.0.1", 0)).unwrap();
        client
            .set_read_timeout(Some(Duration::from_millis(100)))
            .unwrap();
        let target = ("127.0.0.1", fixture.service.local_port());

        let mut query = b"PWS?DEADBEEF".to_vec();
        query.push(0);
        client.send_to(&query, target).unwrap();
        fixture.poll_times(3);

        let mut reply = [0u8; 64];
        assert!(client.recv_from(&mut reply).is_err());
    }

    #[test]
    fn binding_the_same_port_twice_fails() {
        let fixture = Fixture::new();
        let flash = SimFlash::new();
        assert_eq!(
            RemoteService::init_on_port(&flash, fixture.service.local_port()).err(),
            Some(Error::ResourceInUse)
        );
    }
}
