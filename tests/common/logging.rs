use std::{io, sync::Once, thread};

use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine};
use log::LevelFilter;
use raft_chain::types::data_types::{CryptoHash, RaftId};

static LOGGER_INIT: Once = Once::new();

// Set up a logger that logs all log messages with `level` and above.
pub(crate) fn setup_logger(level: LevelFilter) {
    LOGGER_INIT.call_once(|| {
        fern::Dispatch::new()
            .format(|out, message, record| {
                out.finish(format_args!(
                    "[{:?}][{}][{}] {}",
                    thread::current().id(),
                    record.level(),
                    record.target(),
                    message
                ))
            })
            .level(level)
            // raft-rs is chatty at debug.
            .level_for("raft", LevelFilter::Info)
            .chain(io::stdout())
            .apply()
            .unwrap();
    })
}

// Get a more readable representation of a hash by base64-encoding it and taking the first 7 characters.
pub(crate) fn short(hash: &CryptoHash) -> String {
    let encoded = STANDARD_NO_PAD.encode(hash.bytes());
    encoded[0..7].to_string()
}

pub(crate) fn log_with_context(raft_id: RaftId, content: &str) {
    log::debug!("node {}: {}", raft_id, content);
}
