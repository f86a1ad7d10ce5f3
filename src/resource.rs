//! Resource attributes identifying the running service.
//!
//! A [`ResourceDescriptor`] is built once at startup and shared by every
//! record through an `Arc`. Sources are merged in a fixed order, each later
//! source overriding earlier ones on key collision:
//!
//! 1. Detected attributes (host, OS, process, Rust runtime)
//! 2. Metadata property files, in list order
//! 3. Programmatic attributes
//! 4. `service.name`, `service.version`, `deployment.environment.name`

use crate::config::{ResourceConfig, ResourceDetection};
use crate::error::ConfigError;
use opentelemetry::{KeyValue, Value};
use opentelemetry_resource_detectors::{
    HostResourceDetector, OsResourceDetector, ProcessResourceDetector,
};
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::resource::ResourceDetector;
use opentelemetry_semantic_conventions::resource::PROCESS_RUNTIME_NAME;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

const ENRICHMENT_DIR: &str = "/var/lib/dynatrace/enrichment";
const INDIRECT_METADATA_FILE: &str = "dt_metadata_e617c525669e072eebe3d0f08212e8f2.properties";

/// Immutable, key-sorted set of resource attributes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceDescriptor {
    attributes: BTreeMap<String, Value>,
}

impl ResourceDescriptor {
    /// Builds the descriptor from configuration and metadata sources.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingServiceName`] or
    /// [`ConfigError::MissingDeploymentEnvironment`] when either mandatory
    /// attribute is absent, and [`ConfigError::MetadataParseFailed`] for a
    /// malformed metadata file. Missing files are skipped.
    pub fn build(config: &ResourceConfig, sources: &[MetadataSource]) -> Result<Self, ConfigError> {
        let service_name = non_empty(&config.service_name).ok_or(ConfigError::MissingServiceName)?;
        let environment = non_empty(&config.deployment_environment)
            .ok_or(ConfigError::MissingDeploymentEnvironment)?;

        let mut descriptor = match config.detection {
            ResourceDetection::Auto => Self::detected(),
            ResourceDetection::None => Self::default(),
        };

        for source in sources {
            if let Some(properties) = source.read()? {
                tracing::debug!(
                    target: "otel_lifecycle",
                    path = %source.path().display(),
                    count = properties.len(),
                    "Merged metadata file"
                );
                descriptor.extend(properties.into_iter().map(|(k, v)| KeyValue::new(k, v)));
            }
        }

        let mut attributes: Vec<_> = config.attributes.iter().collect();
        attributes.sort();
        descriptor.extend(
            attributes
                .into_iter()
                .map(|(k, v)| KeyValue::new(k.clone(), v.clone())),
        );

        descriptor.insert(KeyValue::new("service.name", service_name.to_string()));
        if let Some(version) = non_empty(&config.service_version) {
            descriptor.insert(KeyValue::new("service.version", version.to_string()));
        }
        descriptor.insert(KeyValue::new(
            "deployment.environment.name",
            environment.to_string(),
        ));

        Ok(descriptor)
    }

    /// Creates a descriptor from explicit attributes; later duplicates win.
    pub fn from_attributes(attributes: impl IntoIterator<Item = KeyValue>) -> Self {
        let mut descriptor = Self::default();
        descriptor.extend(attributes);
        descriptor
    }

    fn detected() -> Self {
        let resource = Resource::builder_empty()
            .with_detector(Box::new(HostResourceDetector::default()))
            .with_detector(Box::new(OsResourceDetector))
            .with_detector(Box::new(ProcessResourceDetector))
            .with_detector(Box::new(RuntimeDetector))
            .build();

        Self::from_attributes(
            resource
                .iter()
                .map(|(k, v)| KeyValue::new(k.clone(), v.clone())),
        )
    }

    fn insert(&mut self, kv: KeyValue) {
        self.attributes.insert(kv.key.as_str().to_string(), kv.value);
    }

    fn extend(&mut self, attributes: impl IntoIterator<Item = KeyValue>) {
        for kv in attributes {
            self.insert(kv);
        }
    }

    /// Returns the value for `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }

    /// Returns `service.name`, if it is a string.
    #[must_use]
    pub fn service_name(&self) -> Option<&str> {
        match self.attributes.get("service.name") {
            Some(Value::String(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Iterates over attributes in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.attributes.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of attributes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.attributes.len()
    }

    /// Whether the descriptor holds no attributes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// A best-effort file of `key=value` resource attributes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "path", rename_all = "lowercase")]
pub enum MetadataSource {
    /// A property file read directly.
    Properties(PathBuf),
    /// A file whose content is the path of the property file to read.
    Indirect(PathBuf),
}

impl MetadataSource {
    /// The Dynatrace OneAgent enrichment files, in merge order.
    #[must_use]
    pub fn dynatrace_defaults() -> Vec<Self> {
        vec![
            Self::Properties(Path::new(ENRICHMENT_DIR).join("dt_metadata.properties")),
            Self::Indirect(PathBuf::from(INDIRECT_METADATA_FILE)),
            Self::Properties(Path::new(ENRICHMENT_DIR).join("dt_host_metadata.properties")),
        ]
    }

    /// The configured path (for `Indirect`, the pointer file).
    #[must_use]
    pub fn path(&self) -> &Path {
        match self {
            Self::Properties(path) | Self::Indirect(path) => path,
        }
    }

    /// Reads the source, returning `None` when it does not exist.
    ///
    /// Read failures other than "not found" are logged and treated as absent.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MetadataParseFailed`] for malformed content.
    pub fn read(&self) -> Result<Option<Vec<(String, String)>>, ConfigError> {
        let target = match self {
            Self::Properties(path) => path.clone(),
            Self::Indirect(pointer) => match read_optional(pointer) {
                Some(content) if !content.trim().is_empty() => PathBuf::from(content.trim()),
                _ => return Ok(None),
            },
        };

        match read_optional(&target) {
            Some(content) => parse_properties(&target, &content).map(Some),
            None => Ok(None),
        }
    }
}

fn read_optional(path: &Path) -> Option<String> {
    match std::fs::read_to_string(path) {
        Ok(content) => Some(content),
        Err(e) if e.kind() == ErrorKind::NotFound => None,
        Err(e) => {
            tracing::warn!(
                target: "otel_lifecycle",
                path = %path.display(),
                error = %e,
                "Skipping unreadable metadata file"
            );
            None
        }
    }
}

/// Parses flat `key=value` property content.
///
/// Blank lines, `#`/`;`/`!` comments and `[section]` headers are ignored.
/// Values wrapped in double quotes are unquoted.
///
/// # Errors
///
/// Returns [`ConfigError::MetadataParseFailed`] naming `path` and the first
/// non-blank line without `=` or with an empty key.
pub fn parse_properties(path: &Path, content: &str) -> Result<Vec<(String, String)>, ConfigError> {
    let mut properties = Vec::new();

    for (idx, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty()
            || line.starts_with(['#', ';', '!'])
            || (line.starts_with('[') && line.ends_with(']'))
        {
            continue;
        }

        let malformed = || ConfigError::MetadataParseFailed {
            path: path.to_path_buf(),
            line: idx + 1,
        };

        let (key, value) = line.split_once('=').ok_or_else(malformed)?;
        let key = key.trim();
        if key.is_empty() {
            return Err(malformed());
        }

        let value = value.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|v| v.strip_suffix('"'))
            .unwrap_or(value);

        properties.push((key.to_string(), value.to_string()));
    }

    Ok(properties)
}

/// Detects Rust runtime attributes available without build-time help.
struct RuntimeDetector;

impl ResourceDetector for RuntimeDetector {
    fn detect(&self) -> Resource {
        Resource::builder_empty()
            .with_attributes([
                KeyValue::new(PROCESS_RUNTIME_NAME, "rust"),
                KeyValue::new("rust.target_os", std::env::consts::OS),
                KeyValue::new("rust.target_arch", std::env::consts::ARCH),
                KeyValue::new("rust.debug", cfg!(debug_assertions)),
            ])
            .build()
    }
}
