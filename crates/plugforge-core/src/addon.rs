//! Optional auxiliary services deployed next to the control plane.
//!
//! Add-ons live in `addons.json`. Their settings are persisted as a flat
//! string map and read back through [`AddonSettings`]. Interactive
//! configuration is split into a pure question list ([`questions`]) and a pure
//! interpretation of the answers ([`apply`]); rendering prompts is left to the
//! caller.

use crate::document;
use crate::error::{ForgeError, Result};
use crate::paths;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

const KEY_STATUS: &str = "status";
const KEY_HOST: &str = "host";
const KEY_PORT: &str = "port";

const STATUS_DISABLE: &str = "disable";
const STATUS_EXISTING: &str = "use-existing";
const STATUS_INSTALL: &str = "install";

// ---------------------------------------------------------------------------
// Addon
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddonKind {
    Toggle,
    Metrics,
    Tracing,
}

impl std::fmt::Display for AddonKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AddonKind::Toggle => "toggle",
            AddonKind::Metrics => "metrics",
            AddonKind::Tracing => "tracing",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Addon {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_repo: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_revision: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_plane_subdir: Option<String>,
    pub enabled: bool,
    #[serde(default)]
    pub config_only: bool,
    pub kind: AddonKind,
    #[serde(default)]
    pub configuration: BTreeMap<String, String>,
}

impl Addon {
    fn toggle(name: &str, subdir: &str) -> Self {
        Self {
            name: name.to_string(),
            source_repo: None,
            source_revision: None,
            container_image: None,
            container_tag: None,
            control_plane_subdir: Some(subdir.to_string()),
            enabled: true,
            config_only: false,
            kind: AddonKind::Toggle,
            configuration: AddonSettings::InstallManaged {
                options: BTreeMap::new(),
            }
            .to_map(),
        }
    }

    fn service(name: &str, kind: AddonKind, image: &str, tag: &str) -> Self {
        Self {
            name: name.to_string(),
            source_repo: None,
            source_revision: None,
            container_image: Some(image.to_string()),
            container_tag: Some(tag.to_string()),
            control_plane_subdir: None,
            enabled: false,
            config_only: false,
            kind,
            configuration: AddonSettings::Disabled.to_map(),
        }
    }

    /// Built from the control-plane source tree.
    pub fn is_buildable(&self) -> bool {
        self.control_plane_subdir
            .as_deref()
            .is_some_and(|d| !d.is_empty())
    }

    /// Identifier safe to use as a chart values key.
    pub fn safe_name(&self) -> String {
        self.name.replace(['-', '.'], "_")
    }

    pub fn settings(&self) -> Result<AddonSettings> {
        AddonSettings::from_map(&self.name, &self.configuration)
    }

    /// Store `settings`; the enabled flag follows from them.
    pub fn configure(&mut self, settings: AddonSettings) {
        self.enabled = !matches!(settings, AddonSettings::Disabled);
        self.configuration = settings.to_map();
    }

    /// Enable or disable without discarding existing configuration where
    /// possible. Returns true when anything changed.
    pub fn set_enabled(&mut self, enabled: bool) -> bool {
        let before = self.clone();
        if enabled {
            if matches!(self.settings(), Ok(AddonSettings::Disabled) | Err(_)) {
                self.configure(AddonSettings::InstallManaged {
                    options: BTreeMap::new(),
                });
            }
        } else {
            self.configure(AddonSettings::Disabled);
        }
        *self != before
    }

    /// True when a deployment should run a container for this add-on.
    pub fn installs_container(&self) -> bool {
        self.enabled
            && !self.config_only
            && matches!(self.settings(), Ok(AddonSettings::InstallManaged { .. }))
    }

    /// Image reference for this add-on: the project image for buildable
    /// add-ons, the catalogue image otherwise.
    pub fn image_ref(&self, docker_user: &str, tag: &str) -> Option<String> {
        if self.is_buildable() {
            return Some(format!("{docker_user}/{}:{tag}", self.name));
        }
        let image = self.container_image.as_deref()?;
        let tag = self.container_tag.as_deref().unwrap_or("latest");
        Some(format!("{image}:{tag}"))
    }
}

/// The add-ons written by `init`.
pub fn default_addons() -> Vec<Addon> {
    vec![
        Addon::toggle("function-discovery", "cmd/function-discovery"),
        Addon::toggle("ingress-controller", "cmd/kube-ingress-controller"),
        Addon::toggle("upstream-discovery", "cmd/kube-upstream-discovery"),
        Addon::service(
            "metrics",
            AddonKind::Metrics,
            "prom/statsd-exporter",
            "latest",
        ),
        Addon::service(
            "tracing",
            AddonKind::Tracing,
            "jaegertracing/all-in-one",
            "latest",
        ),
    ]
}

// ---------------------------------------------------------------------------
// AddonSettings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddonSettings {
    Disabled,
    UseExisting { host: String, port: u16 },
    InstallManaged { options: BTreeMap<String, String> },
}

impl AddonSettings {
    pub fn from_map(addon: &str, map: &BTreeMap<String, String>) -> Result<Self> {
        let invalid = |reason: String| ForgeError::InvalidAddonConfig {
            addon: addon.to_string(),
            reason,
        };
        match map.get(KEY_STATUS).map(String::as_str) {
            None | Some(STATUS_DISABLE) => Ok(AddonSettings::Disabled),
            Some(STATUS_EXISTING) => {
                let host = map
                    .get(KEY_HOST)
                    .filter(|h| !h.is_empty())
                    .ok_or_else(|| invalid("missing host".into()))?;
                let port = map
                    .get(KEY_PORT)
                    .ok_or_else(|| invalid("missing port".into()))?;
                let port = port
                    .parse::<u16>()
                    .map_err(|_| invalid(format!("port '{port}' is not in 0..65535")))?;
                Ok(AddonSettings::UseExisting {
                    host: host.clone(),
                    port,
                })
            }
            Some(STATUS_INSTALL) => Ok(AddonSettings::InstallManaged {
                options: map
                    .iter()
                    .filter(|(k, _)| k.as_str() != KEY_STATUS)
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            }),
            Some(other) => Err(invalid(format!("unknown status '{other}'"))),
        }
    }

    pub fn to_map(&self) -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();
        match self {
            AddonSettings::Disabled => {
                map.insert(KEY_STATUS.to_string(), STATUS_DISABLE.to_string());
            }
            AddonSettings::UseExisting { host, port } => {
                map.insert(KEY_STATUS.to_string(), STATUS_EXISTING.to_string());
                map.insert(KEY_HOST.to_string(), host.clone());
                map.insert(KEY_PORT.to_string(), port.to_string());
            }
            AddonSettings::InstallManaged { options } => {
                map.extend(options.iter().map(|(k, v)| (k.clone(), v.clone())));
                map.insert(KEY_STATUS.to_string(), STATUS_INSTALL.to_string());
            }
        }
        map
    }

    pub fn status(&self) -> &'static str {
        match self {
            AddonSettings::Disabled => STATUS_DISABLE,
            AddonSettings::UseExisting { .. } => STATUS_EXISTING,
            AddonSettings::InstallManaged { .. } => STATUS_INSTALL,
        }
    }
}

// ---------------------------------------------------------------------------
// Configuration flow
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum QuestionKind {
    Choice { options: Vec<String> },
    Text,
    Port,
    YesNo,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Question {
    pub key: String,
    pub prompt: String,
    #[serde(flatten)]
    pub kind: QuestionKind,
    pub default: Option<String>,
    /// Ask only when the answer to `.0` equals `.1`.
    pub when: Option<(String, String)>,
}

impl Question {
    fn new(key: &str, prompt: impl Into<String>, kind: QuestionKind) -> Self {
        Self {
            key: key.to_string(),
            prompt: prompt.into(),
            kind,
            default: None,
            when: None,
        }
    }

    fn default(mut self, value: impl Into<String>) -> Self {
        self.default = Some(value.into());
        self
    }

    fn when(mut self, key: &str, value: &str) -> Self {
        self.when = Some((key.to_string(), value.to_string()));
        self
    }

    /// Whether this question applies given the answers collected so far.
    pub fn applies(&self, answers: &BTreeMap<String, String>) -> bool {
        match &self.when {
            Some((key, value)) => answers.get(key) == Some(value),
            None => true,
        }
    }
}

pub type Answers = BTreeMap<String, String>;

/// Questions to ask when configuring `addon`, in order.
pub fn questions(addon: &Addon) -> Vec<Question> {
    let current = addon.settings().unwrap_or(AddonSettings::Disabled);
    let (host, port) = match &current {
        AddonSettings::UseExisting { host, port } => (Some(host.clone()), Some(port.to_string())),
        _ => (None, None),
    };
    let status = |options: &[&str]| {
        Question::new(
            KEY_STATUS,
            format!("Status for {}", addon.name),
            QuestionKind::Choice {
                options: options.iter().map(|o| o.to_string()).collect(),
            },
        )
        .default(current.status())
    };
    let address = |service: &str| {
        let mut h = Question::new(
            KEY_HOST,
            format!("Host of the existing {service} server"),
            QuestionKind::Text,
        )
        .when(KEY_STATUS, STATUS_EXISTING);
        if let Some(host) = &host {
            h = h.default(host.clone());
        }
        let mut p = Question::new(
            KEY_PORT,
            format!("Port of the existing {service} server"),
            QuestionKind::Port,
        )
        .when(KEY_STATUS, STATUS_EXISTING);
        if let Some(port) = &port {
            p = p.default(port.clone());
        }
        [h, p]
    };

    match addon.kind {
        AddonKind::Toggle => vec![status(&[STATUS_INSTALL, STATUS_DISABLE])],
        AddonKind::Metrics => {
            let mut q = vec![status(&[STATUS_DISABLE, STATUS_EXISTING, STATUS_INSTALL])];
            q.extend(address("statsd"));
            q.push(
                Question::new(
                    "service_monitor",
                    "Set up a service monitor with the Prometheus operator",
                    QuestionKind::YesNo,
                )
                .default("no")
                .when(KEY_STATUS, STATUS_INSTALL),
            );
            q
        }
        AddonKind::Tracing => {
            let mut q = vec![status(&[STATUS_DISABLE, STATUS_EXISTING, STATUS_INSTALL])];
            q.extend(address("jaeger"));
            q
        }
    }
}

/// Interpret answers to [`questions`]. Unanswered questions take their
/// default.
pub fn apply(addon: &Addon, answers: &Answers) -> Result<AddonSettings> {
    let mut resolved = Answers::new();
    for question in questions(addon) {
        if !question.applies(&resolved) {
            continue;
        }
        let answer = answers
            .get(&question.key)
            .cloned()
            .or_else(|| question.default.clone())
            .ok_or_else(|| ForgeError::InvalidAnswer {
                question: question.prompt.clone(),
                reason: "an answer is required".into(),
            })?;
        let answer = validate(&question, answer.trim())?;
        resolved.insert(question.key.clone(), answer);
    }

    let status = resolved
        .get(KEY_STATUS)
        .map(String::as_str)
        .unwrap_or(STATUS_DISABLE);
    Ok(match status {
        STATUS_EXISTING => {
            let port = resolved
                .get(KEY_PORT)
                .and_then(|p| p.parse().ok())
                .unwrap_or_default();
            AddonSettings::UseExisting {
                host: resolved.get(KEY_HOST).cloned().unwrap_or_default(),
                port,
            }
        }
        STATUS_INSTALL => AddonSettings::InstallManaged {
            options: resolved
                .into_iter()
                .filter(|(k, _)| k != KEY_STATUS)
                .collect(),
        },
        _ => AddonSettings::Disabled,
    })
}

fn validate(question: &Question, answer: &str) -> Result<String> {
    let invalid = |reason: String| ForgeError::InvalidAnswer {
        question: question.prompt.clone(),
        reason,
    };
    match &question.kind {
        QuestionKind::Choice { options } => {
            if options.iter().any(|o| o == answer) {
                Ok(answer.to_string())
            } else {
                Err(invalid(format!("expected one of {}", options.join(", "))))
            }
        }
        QuestionKind::Text => {
            if answer.is_empty() {
                Err(invalid("an answer is required".into()))
            } else {
                Ok(answer.to_string())
            }
        }
        QuestionKind::Port => answer
            .parse::<u16>()
            .map(|p| p.to_string())
            .map_err(|_| invalid(format!("'{answer}' is not a port in 0..65535"))),
        QuestionKind::YesNo => match answer.to_ascii_lowercase().as_str() {
            "y" | "yes" | "true" => Ok("true".into()),
            "n" | "no" | "false" => Ok("false".into()),
            _ => Err(invalid("expected yes or no".into())),
        },
    }
}

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize)]
struct AddonsDoc {
    addons: Vec<Addon>,
}

pub fn load(root: &Path) -> Result<Vec<Addon>> {
    let doc: document::Envelope<AddonsDoc> = document::read(&paths::addons_path(root))?;
    Ok(doc.payload.addons)
}

/// Like [`load`], but an absent add-on file is `None` rather than an error.
pub fn load_optional(root: &Path) -> Result<Option<Vec<Addon>>> {
    if !paths::addons_path(root).exists() {
        return Ok(None);
    }
    load(root).map(Some)
}

pub fn save(root: &Path, addons: &[Addon]) -> Result<()> {
    document::write(
        &paths::addons_path(root),
        AddonsDoc {
            addons: addons.to_vec(),
        },
    )
}

/// Write the default catalogue.
pub fn init(root: &Path) -> Result<()> {
    save(root, &default_addons())
}

/// Load, mutate one add-on by name, and save. Returns what `f` returns.
pub fn update<T>(root: &Path, name: &str, f: impl FnOnce(&mut Addon) -> Result<T>) -> Result<T> {
    let mut addons = load(root)?;
    let addon = addons
        .iter_mut()
        .find(|a| a.name == name)
        .ok_or_else(|| ForgeError::AddonNotFound(name.to_string()))?;
    let out = f(addon)?;
    save(root, &addons)?;
    Ok(out)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn addon(name: &str) -> Addon {
        default_addons()
            .into_iter()
            .find(|a| a.name == name)
            .unwrap()
    }

    fn answers(pairs: &[(&str, &str)]) -> Answers {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn catalogue_shape() {
        let addons = default_addons();
        assert_eq!(addons.len(), 5);
        let buildable: Vec<_> = addons.iter().filter(|a| a.is_buildable()).collect();
        assert_eq!(buildable.len(), 3);
        assert!(buildable.iter().all(|a| a.enabled && a.installs_container()));
        assert!(!addon("metrics").enabled);
        assert_eq!(addon("metrics").settings().unwrap(), AddonSettings::Disabled);
    }

    #[test]
    fn settings_map_roundtrip() {
        let settings = AddonSettings::UseExisting {
            host: "statsd.local".into(),
            port: 9125,
        };
        let map = settings.to_map();
        assert_eq!(map["status"], "use-existing");
        assert_eq!(AddonSettings::from_map("metrics", &map).unwrap(), settings);
    }

    #[test]
    fn persisted_port_out_of_range_is_rejected() {
        let map = answers(&[("status", "use-existing"), ("host", "h"), ("port", "70000")]);
        assert!(matches!(
            AddonSettings::from_map("metrics", &map),
            Err(ForgeError::InvalidAddonConfig { .. })
        ));
    }

    #[test]
    fn metrics_use_existing_flow() {
        let metrics = addon("metrics");
        let qs = questions(&metrics);
        assert_eq!(qs[0].key, "status");
        assert!(!qs[1].applies(&answers(&[("status", "install")])));

        let settings = apply(
            &metrics,
            &answers(&[("status", "use-existing"), ("host", "statsd"), ("port", "8125")]),
        )
        .unwrap();
        assert_eq!(
            settings,
            AddonSettings::UseExisting {
                host: "statsd".into(),
                port: 8125
            }
        );
    }

    #[test]
    fn port_answers_are_validated() {
        let tracing = addon("tracing");
        for bad in ["65536", "-1", "port"] {
            let err = apply(
                &tracing,
                &answers(&[("status", "use-existing"), ("host", "jaeger"), ("port", bad)]),
            )
            .unwrap_err();
            assert!(matches!(err, ForgeError::InvalidAnswer { .. }), "{bad}");
        }
        assert!(apply(
            &tracing,
            &answers(&[("status", "use-existing"), ("host", "jaeger"), ("port", "0")]),
        )
        .is_ok());
    }

    #[test]
    fn install_collects_options_and_defaults() {
        let settings = apply(&addon("metrics"), &answers(&[("status", "install")])).unwrap();
        let mut options = BTreeMap::new();
        options.insert("service_monitor".to_string(), "false".to_string());
        assert_eq!(settings, AddonSettings::InstallManaged { options });
    }

    #[test]
    fn unknown_choice_is_rejected() {
        assert!(apply(&addon("function-discovery"), &answers(&[("status", "maybe")])).is_err());
    }

    #[test]
    fn enable_and_disable_keep_flag_and_settings_consistent() {
        let mut metrics = addon("metrics");
        assert!(metrics.set_enabled(true));
        assert!(metrics.enabled);
        assert!(metrics.installs_container());
        assert!(!metrics.set_enabled(true));

        metrics.config_only = true;
        assert!(!metrics.installs_container());

        assert!(metrics.set_enabled(false));
        assert_eq!(metrics.settings().unwrap(), AddonSettings::Disabled);
    }

    #[test]
    fn image_references() {
        assert_eq!(
            addon("ingress-controller").image_ref("me", "abc").as_deref(),
            Some("me/ingress-controller:abc")
        );
        assert_eq!(
            addon("tracing").image_ref("me", "abc").as_deref(),
            Some("jaegertracing/all-in-one:latest")
        );
        assert_eq!(addon("ingress-controller").safe_name(), "ingress_controller");
    }

    #[test]
    fn store_init_update_and_missing() {
        let dir = TempDir::new().unwrap();
        assert!(load_optional(dir.path()).unwrap().is_none());
        init(dir.path()).unwrap();
        update(dir.path(), "tracing", |a| Ok(a.set_enabled(true))).unwrap();
        let addons = load(dir.path()).unwrap();
        assert!(addons.iter().find(|a| a.name == "tracing").unwrap().enabled);
        assert!(matches!(
            update(dir.path(), "nope", |_| Ok(())),
            Err(ForgeError::AddonNotFound(_))
        ));
    }
}
