//! Who gets heard, and whose events get relayed
//!
//! A [`RoutingPolicy`] is never edited in place.  Every change builds a new policy with a
//! bumped version and the session swaps it in, so the per-frame filter always reads one
//! consistent policy.
use serde::Serialize;
use serde_json::{json, Value};
use simple_error::SimpleError;
use std::{collections::BTreeSet, fmt, str::FromStr};

/// how the solo set is read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterMode {
    /// empty set hears everybody, otherwise only the members
    Solo,
    /// only the members, empty set hears nobody
    AllowList,
}

impl FromStr for FilterMode {
    type Err = SimpleError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "solo" => Ok(FilterMode::Solo),
            "allow_list" | "allowlist" => Ok(FilterMode::AllowList),
            _ => Err(SimpleError::new(format!("unknown filter mode: {}", s))),
        }
    }
}

impl fmt::Display for FilterMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FilterMode::Solo => write!(f, "solo"),
            FilterMode::AllowList => write!(f, "allow_list"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RoutingPolicy {
    pub mode: FilterMode,
    pub solo_set: BTreeSet<String>,
    pub broadcast_target: Option<String>,
    pub relay_enabled: bool,
    pub version: u64,
}

impl Default for RoutingPolicy {
    fn default() -> Self {
        RoutingPolicy {
            mode: FilterMode::Solo,
            solo_set: BTreeSet::new(),
            broadcast_target: None,
            relay_enabled: false,
            version: 0,
        }
    }
}

impl RoutingPolicy {
    pub fn new(mode: FilterMode, relay_enabled: bool) -> RoutingPolicy {
        RoutingPolicy {
            mode,
            relay_enabled,
            ..Default::default()
        }
    }
    /// should a frame from `sender` be played locally
    pub fn admits(&self, sender: &str) -> bool {
        match self.mode {
            FilterMode::Solo => self.solo_set.is_empty() || self.solo_set.contains(sender),
            FilterMode::AllowList => self.solo_set.contains(sender),
        }
    }
    /// should the master pass a frame from `sender` on to everybody else
    pub fn should_relay(&self, sender: &str) -> bool {
        self.relay_enabled && self.broadcast_target.as_deref() == Some(sender)
    }
    fn next(&self) -> RoutingPolicy {
        RoutingPolicy {
            version: self.version + 1,
            ..self.clone()
        }
    }
    pub fn with_solo_set<I, S>(&self, ids: I) -> RoutingPolicy
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        RoutingPolicy {
            solo_set: ids.into_iter().map(Into::into).collect(),
            ..self.next()
        }
    }
    pub fn with_broadcast_target(&self, target: Option<&str>) -> RoutingPolicy {
        RoutingPolicy {
            broadcast_target: target.map(String::from),
            ..self.next()
        }
    }
    pub fn with_relay(&self, relay_enabled: bool) -> RoutingPolicy {
        RoutingPolicy {
            relay_enabled,
            ..self.next()
        }
    }
    pub fn with_mode(&self, mode: FilterMode) -> RoutingPolicy {
        RoutingPolicy { mode, ..self.next() }
    }
    pub fn as_json(&self) -> Value {
        json!({
            "mode": self.mode,
            "soloSet": self.solo_set,
            "broadcastTarget": self.broadcast_target,
            "relayEnabled": self.relay_enabled,
            "version": self.version,
        })
    }
}

impl fmt::Display for RoutingPolicy {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{{ mode: {}, solo: {:?}, on_air: {:?}, relay: {}, v{} }}",
            self.mode, self.solo_set, self.broadcast_target, self.relay_enabled, self.version
        )
    }
}
