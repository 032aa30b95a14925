//! Fuzz the remote session with arbitrary network bytes: the state
//! machine must never panic regardless of what a client sends, in any
//! split of the byte stream.

#![no_main]

use libfuzzer_sys::fuzz_target;

use wifi_settings::adapters::device_id::read_board_id;
use wifi_settings::adapters::flash::SimFlash;
use wifi_settings::adapters::system::SimSystem;
use wifi_settings::adapters::wifi::SimWifi;
use wifi_settings::flash::storage::SettingsFile;
use wifi_settings::remote::crypto::SecretState;
use wifi_settings::remote::handlers::install_builtin_handlers;
use wifi_settings::remote::registry::{HandlerCtx, HandlerTable};
use wifi_settings::remote::session::{
    BlockSink, Session, SessionDeps, SessionEvent, WriteOutcome,
};
use wifi_settings::remote::BLOCK_SIZE;

struct NullSink;

impl BlockSink for NullSink {
    fn write_block(&mut self, _block: &[u8; BLOCK_SIZE]) -> WriteOutcome {
        WriteOutcome::Sent
    }
}

fuzz_target!(|input: &[u8]| {
    let mut flash = SimFlash::new();
    flash.seed_settings(b"update_secret=fuzzing\n");
    let mut system = SimSystem::new();
    let mut wifi = SimWifi::new();
    let mut secret = SecretState::empty();
    secret.refresh(&SettingsFile::load(&flash).unwrap());
    let mut handlers = HandlerTable::new();
    install_builtin_handlers(&mut handlers).unwrap();

    let mut session = Session::new("E6614854D3885D30");
    let mut sink = NullSink;

    let mut deps = SessionDeps {
        handlers: &mut handlers,
        ctx: HandlerCtx {
            flash: &mut flash,
            system: &mut system,
            wifi: &mut wifi,
            secret: &mut secret,
            board_id: read_board_id(),
        },
    };

    if session.on_accept(&mut deps, &mut sink) != SessionEvent::Continue {
        return;
    }
    for chunk in input.chunks(7) {
        match session.on_receive(chunk, &mut deps, &mut sink) {
            SessionEvent::Continue => {}
            SessionEvent::CloseNow => return,
            SessionEvent::CloseAndRunCommit => {
                session.run_commit(&mut deps);
                return;
            }
        }
    }
});
