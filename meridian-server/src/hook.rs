//! Named fence subscriptions with delivery endpoints.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::endpoint::Endpoint;
use crate::fence::FenceSpec;

/// A persistent fence: a geometric query bound to a collection key, with
/// the endpoints its events are delivered to. Installed by SETHOOK,
/// removed by DELHOOK or FLUSHDB.
#[derive(Debug)]
pub struct Hook {
    pub name: String,
    pub key: String,
    pub endpoints: Vec<Endpoint>,
    pub spec: FenceSpec,
    /// The canonical SETHOOK argument vector, for HOOKS output, shrink
    /// rewrites, and idempotency comparison.
    pub message: Vec<String>,
    /// (key, id) -> group id, correlating an object's enter..exit arc.
    pub groups: Mutex<HashMap<(String, String), u64>>,
}

impl Hook {
    /// Idempotency rule: same name, endpoints, and canonical command form
    /// means SETHOOK leaves the registry untouched.
    pub fn same_as(&self, other: &Hook) -> bool {
        self.name == other.name
            && self.key == other.key
            && self.endpoints == other.endpoints
            && self.message == other.message
    }

    #[cfg(test)]
    pub fn for_tests(name: &str, key: &str) -> Hook {
        Hook {
            name: name.to_string(),
            key: key.to_string(),
            endpoints: Vec::new(),
            spec: FenceSpec {
                cmd: crate::fence::FenceCmd::Nearby,
                key: key.to_string(),
                glob: String::new(),
                wheres: Vec::new(),
                nofields: false,
                detect: None,
                commands: None,
                output: crate::args::SearchOutput::Objects,
                area: crate::fence::FenceArea::Center {
                    lat: 0.0,
                    lon: 0.0,
                    meters: 1000.0,
                },
            },
            message: vec!["SETHOOK".to_string(), name.to_string()],
            groups: Mutex::new(HashMap::new()),
        }
    }
}
