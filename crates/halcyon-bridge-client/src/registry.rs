//! Maps the child argv's (plugin type, label) pair to a handler.
//!
//! Real format wrappers register here as they are ported into the child
//! binary; until then only the internal plugins resolve and every other
//! format reports a clean startup error to the host instead of crashing.

use crate::builtin::{GainPlugin, ProbePlugin};
use crate::handler::PluginHandler;
use halcyon_bridge::error::{BridgeError, Result};
use halcyon_bridge::protocol::PluginType;
use std::path::Path;

pub fn create_handler(
    plugin_type: PluginType,
    filename: &Path,
    label: &str,
    unique_id: i64,
) -> Result<Box<dyn PluginHandler>> {
    let _ = (filename, unique_id);
    match plugin_type {
        PluginType::Internal => match label {
            "gain" => Ok(Box::new(GainPlugin::new())),
            "probe" => Ok(Box::new(ProbePlugin::new())),
            other => Err(BridgeError::InvalidArgument(format!(
                "unknown internal plugin '{other}'"
            ))),
        },
        other => Err(BridgeError::InvalidArgument(format!(
            "no {} wrapper compiled into this bridge",
            other.as_str()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_internal_plugins_resolve() {
        assert!(create_handler(PluginType::Internal, Path::new(""), "gain", 0).is_ok());
        assert!(create_handler(PluginType::Internal, Path::new(""), "probe", 0).is_ok());
        assert!(create_handler(PluginType::Internal, Path::new(""), "nope", 0).is_err());
    }

    #[test]
    fn test_unported_formats_fail_cleanly() {
        let err = create_handler(PluginType::Vst3, Path::new("/x.vst3"), "", 0).unwrap_err();
        assert!(err.to_string().contains("VST3"));
    }
}
