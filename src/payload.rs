// src/payload.rs

//! Typed views of the JSON documents the engine exchanges.
//!
//! Both documents carry their entries as one-key objects in an array,
//! closed by an `{"eof": null}` marker:
//!
//! ```json
//! {"version":"1.2.1","build":{"date":"...","time":"..."},
//!  "profiles":[{"rfc_ml_sc":{"description":"side channel","state":"active"}},{"eof":null}]}
//! {"configurations":[{"rfc_ml_sc":{"max_detections":1200}},{"eof":null}]}
//! ```
//!
//! The marker is skipped when parsing and never produced when serialising.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use thiserror::Error;

const EOF_KEY: &str = "eof";

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("entry must be an object with exactly one key, got {0}")]
    MalformedEntry(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProfileState {
    Active,
    Inactive,
}

impl fmt::Display for ProfileState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ProfileState::Active => "active",
            ProfileState::Inactive => "inactive",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BuildInfo {
    #[serde(default)]
    pub date: String,
    #[serde(default)]
    pub time: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileInfo {
    pub name: String,
    pub description: String,
    pub state: ProfileState,
}

#[derive(Deserialize)]
struct ProfileBody {
    #[serde(default)]
    description: String,
    state: ProfileState,
}

#[derive(Deserialize)]
struct RawCapabilities {
    #[serde(default)]
    version: String,
    #[serde(default)]
    build: BuildInfo,
    #[serde(default)]
    profiles: Vec<Value>,
}

/// Result of `discover`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capabilities {
    pub version: String,
    pub build: BuildInfo,
    pub profiles: Vec<ProfileInfo>,
}

impl Capabilities {
    pub fn parse(text: &str) -> Result<Self, PayloadError> {
        let raw: RawCapabilities = serde_json::from_str(text)?;
        let mut profiles = Vec::with_capacity(raw.profiles.len());
        for entry in raw.profiles {
            if let Some((name, body)) = single_entry(entry)? {
                let body: ProfileBody = serde_json::from_value(body)?;
                profiles.push(ProfileInfo {
                    name,
                    description: body.description,
                    state: body.state,
                });
            }
        }
        Ok(Self { version: raw.version, build: raw.build, profiles })
    }

    pub fn profile(&self, name: &str) -> Option<&ProfileInfo> {
        self.profiles.iter().find(|p| p.name == name)
    }

    pub fn active(&self) -> impl Iterator<Item = &ProfileInfo> {
        self.profiles.iter().filter(|p| p.state == ProfileState::Active)
    }
}

#[derive(Deserialize)]
struct RawConfigurations {
    #[serde(default)]
    configurations: Vec<Value>,
}

/// Per-profile settings, in the order the engine reported them.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Configurations {
    entries: Vec<(String, Value)>,
}

impl Configurations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse(text: &str) -> Result<Self, PayloadError> {
        let raw: RawConfigurations = serde_json::from_str(text)?;
        let mut out = Self::new();
        for entry in raw.configurations {
            if let Some((name, settings)) = single_entry(entry)? {
                out.insert(name, settings);
            }
        }
        Ok(out)
    }

    /// Add or replace the settings for `profile`.
    pub fn insert(&mut self, profile: impl Into<String>, settings: Value) {
        let profile = profile.into();
        match self.entries.iter_mut().find(|(name, _)| *name == profile) {
            Some(slot) => slot.1 = settings,
            None => self.entries.push((profile, settings)),
        }
    }

    pub fn get(&self, profile: &str) -> Option<&Value> {
        self.entries.iter().find(|(name, _)| name == profile).map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(name, v)| (name.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Document accepted by `set_configuration` for all profiles.
    pub fn to_json(&self) -> String {
        let list: Vec<Value> = self
            .entries
            .iter()
            .map(|(name, settings)| {
                let mut one = Map::new();
                one.insert(name.clone(), settings.clone());
                Value::Object(one)
            })
            .collect();
        serde_json::json!({ "configurations": list }).to_string()
    }
}

/// Split a one-key object into its key and value; `None` for the eof marker.
fn single_entry(entry: Value) -> Result<Option<(String, Value)>, PayloadError> {
    let Value::Object(map) = entry else {
        return Err(PayloadError::MalformedEntry(entry.to_string()));
    };
    if map.len() != 1 {
        return Err(PayloadError::MalformedEntry(Value::Object(map).to_string()));
    }
    let Some((key, value)) = map.into_iter().next() else {
        return Ok(None);
    };
    if key == EOF_KEY {
        return Ok(None);
    }
    Ok(Some((key, value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const CAPS: &str = r#"{"version":"1.2.1","build":{"date":"Feb 18 2019","time":"23:59:01"},
        "profiles":[{"rfc_ml_sc":{"description":"side channel","state":"active"}},
                    {"rfc_ml_cj":{"description":"crypto mining","state":"inactive"}},
                    {"eof":null}]}"#;

    #[test]
    fn capabilities_skip_eof_marker() {
        let caps = Capabilities::parse(CAPS).unwrap();
        assert_eq!(caps.version, "1.2.1");
        assert_eq!(caps.build.date, "Feb 18 2019");
        assert_eq!(caps.profiles.len(), 2);
        assert_eq!(caps.profile("rfc_ml_cj").unwrap().state, ProfileState::Inactive);
        let active: Vec<_> = caps.active().map(|p| p.name.as_str()).collect();
        assert_eq!(active, ["rfc_ml_sc"]);
    }

    #[test]
    fn malformed_profile_entry_is_rejected() {
        let text = r#"{"version":"1","profiles":[{"a":{"state":"active"},"b":{"state":"active"}}]}"#;
        assert!(matches!(Capabilities::parse(text), Err(PayloadError::MalformedEntry(_))));
        assert!(matches!(Capabilities::parse("not json"), Err(PayloadError::Json(_))));
    }

    #[test]
    fn configurations_preserve_order_and_replace() {
        let text = r#"{"configurations":[{"rfc_ml_sc":{"max_detections":1200}},
                                         {"rfc_ml_cj":{"report_rate":500}},{"eof":null}]}"#;
        let mut cfg = Configurations::parse(text).unwrap();
        let names: Vec<_> = cfg.iter().map(|(n, _)| n).collect();
        assert_eq!(names, ["rfc_ml_sc", "rfc_ml_cj"]);

        cfg.insert("rfc_ml_sc", json!({ "max_detections": 5 }));
        assert_eq!(cfg.len(), 2);
        assert_eq!(cfg.get("rfc_ml_sc"), Some(&json!({ "max_detections": 5 })));
    }

    #[test]
    fn to_json_round_trips_without_marker() {
        let mut cfg = Configurations::new();
        cfg.insert("p", json!({ "k": true }));
        let text = cfg.to_json();
        assert!(!text.contains("eof"));
        assert_eq!(Configurations::parse(&text).unwrap(), cfg);
    }
}
