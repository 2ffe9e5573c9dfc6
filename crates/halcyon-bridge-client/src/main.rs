//! Bridge child binary. Spawned by the host to run one plugin in isolation.
//!
//! Invocation: `halcyon-bridge <plugin-type> <filename|(none)> <label>
//! <uniqueId>`, with the shared-memory suffixes in `ENGINE_BRIDGE_SHM_IDS`.

use halcyon_bridge::protocol::{PluginType, ENV_SHM_IDS, NO_FILENAME};
use halcyon_bridge_client::{create_handler, signals, ClientBridge};
use std::path::PathBuf;
use std::process::ExitCode;

fn main() -> ExitCode {
    tracing_subscriber::fmt::init();
    signals::install();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let [plugin_type, filename, label, unique_id] = match args.as_slice() {
        [a, b, c, d] => [a, b, c, d],
        _ => {
            eprintln!("usage: halcyon-bridge <plugin-type> <filename|(none)> <label> <uniqueId>");
            return ExitCode::FAILURE;
        }
    };

    let Some(plugin_type) = PluginType::from_str_tag(plugin_type) else {
        tracing::error!("unknown plugin type '{plugin_type}'");
        return ExitCode::FAILURE;
    };
    let filename = if filename.as_str() == NO_FILENAME {
        PathBuf::new()
    } else {
        PathBuf::from(filename)
    };
    let unique_id: i64 = unique_id.parse().unwrap_or(0);

    let Ok(shm_ids) = std::env::var(ENV_SHM_IDS) else {
        tracing::error!("{ENV_SHM_IDS} is not set; this binary is meant to be spawned by a host");
        return ExitCode::FAILURE;
    };

    let handler = match create_handler(plugin_type, &filename, label, unique_id) {
        Ok(handler) => handler,
        Err(e) => {
            tracing::error!("cannot load plugin: {e}");
            return ExitCode::FAILURE;
        }
    };

    let mut bridge = match ClientBridge::connect(&shm_ids, handler) {
        Ok(bridge) => bridge,
        Err(e) => {
            tracing::error!("cannot connect to host: {e}");
            return ExitCode::FAILURE;
        }
    };

    match bridge.run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("bridge terminated: {e}");
            ExitCode::FAILURE
        }
    }
}
