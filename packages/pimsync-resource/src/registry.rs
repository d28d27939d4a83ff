//! Resource instance lifecycle (spec.md §9 supplement, grounded in
//! `original_source/common/resourcefacade.cpp`'s `create`/`modify`/`remove`):
//! maps a resource identifier to its type and free-form configuration
//! values, the way `ResourceFacade::create` pairs an identifier with a type
//! via `ResourceConfig::addResource` and follow-up configuration values via
//! `ResourceConfig::configureResource`. Held in memory behind a
//! [`dashmap::DashMap`] (the concurrent-map choice `topgun-server`'s
//! `service::registry::ServiceRegistry` makes for its own registry) and
//! mirrored to a single on-disk TOML marker file so a restart rediscovers
//! which resource instances exist.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("failed to read registry marker file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write registry marker file {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse registry marker file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("failed to serialize registry marker file {path}: {source}")]
    Serialize {
        path: String,
        #[source]
        source: toml::ser::Error,
    },
    #[error("no resource registered with identifier {0:?}")]
    NotFound(String),
    #[error("a resource is already registered with identifier {0:?}")]
    AlreadyExists(String),
}

/// One registered resource instance: its type and any configuration values
/// set on it beyond `identifier`/`type`, matching the two properties
/// `resourcefacade.cpp`'s `create` strips before persisting the rest as
/// configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    pub identifier: String,
    pub resource_type: String,
    #[serde(default)]
    pub configuration: BTreeMap<String, String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct MarkerFile {
    #[serde(default)]
    resources: Vec<ResourceDescriptor>,
}

/// In-memory registry of resource instances, mirrored to a TOML marker file.
pub struct ResourceRegistry {
    entries: DashMap<String, ResourceDescriptor>,
    marker_path: PathBuf,
}

impl ResourceRegistry {
    /// Opens the registry at `marker_path`, loading any existing entries.
    ///
    /// # Errors
    /// Returns [`RegistryError`] if the marker file exists but cannot be
    /// read or parsed.
    pub fn open(marker_path: impl AsRef<Path>) -> Result<Self, RegistryError> {
        let marker_path = marker_path.as_ref().to_path_buf();
        let entries = DashMap::new();
        if marker_path.exists() {
            let text = std::fs::read_to_string(&marker_path).map_err(|source| RegistryError::Read {
                path: marker_path.display().to_string(),
                source,
            })?;
            let marker: MarkerFile = toml::from_str(&text).map_err(|source| RegistryError::Parse {
                path: marker_path.display().to_string(),
                source,
            })?;
            for descriptor in marker.resources {
                entries.insert(descriptor.identifier.clone(), descriptor);
            }
        }
        Ok(Self { entries, marker_path })
    }

    /// Registers a new resource instance. `identifier` is generated as
    /// `<resource_type>.<uuid>` when `None`, mirroring
    /// `ResourceConfig::newIdentifier` being used only when the caller
    /// supplies no identifier of its own.
    ///
    /// # Errors
    /// Returns [`RegistryError::AlreadyExists`] if `identifier` is already
    /// registered, or a marker-file write error.
    pub fn create(
        &self,
        identifier: Option<String>,
        resource_type: String,
        configuration: BTreeMap<String, String>,
    ) -> Result<String, RegistryError> {
        let identifier = identifier.unwrap_or_else(|| format!("{resource_type}.{}", uuid::Uuid::new_v4()));
        if self.entries.contains_key(&identifier) {
            return Err(RegistryError::AlreadyExists(identifier));
        }
        self.entries.insert(
            identifier.clone(),
            ResourceDescriptor {
                identifier: identifier.clone(),
                resource_type,
                configuration,
            },
        );
        self.persist()?;
        Ok(identifier)
    }

    /// Merges `configuration` into an already-registered resource's
    /// configuration values, overwriting any keys in common.
    ///
    /// # Errors
    /// Returns [`RegistryError::NotFound`] if `identifier` isn't registered.
    pub fn configure(&self, identifier: &str, configuration: BTreeMap<String, String>) -> Result<(), RegistryError> {
        {
            let mut entry = self
                .entries
                .get_mut(identifier)
                .ok_or_else(|| RegistryError::NotFound(identifier.to_string()))?;
            entry.configuration.extend(configuration);
        }
        self.persist()
    }

    /// Unregisters a resource instance. Does not remove its on-disk
    /// `DataStore` files; per `resourcefacade.cpp`'s own `TODO`, shutting
    /// down and reclaiming a removed resource's storage is a follow-up step
    /// the caller (not the registry) is responsible for.
    ///
    /// # Errors
    /// Returns [`RegistryError::NotFound`] if `identifier` isn't registered.
    pub fn remove(&self, identifier: &str) -> Result<(), RegistryError> {
        if self.entries.remove(identifier).is_none() {
            return Err(RegistryError::NotFound(identifier.to_string()));
        }
        self.persist()
    }

    #[must_use]
    pub fn get(&self, identifier: &str) -> Option<ResourceDescriptor> {
        self.entries.get(identifier).map(|entry| entry.clone())
    }

    /// Lists every registered resource, optionally filtered to one type.
    #[must_use]
    pub fn list(&self, resource_type: Option<&str>) -> Vec<ResourceDescriptor> {
        self.entries
            .iter()
            .map(|entry| entry.value().clone())
            .filter(|descriptor| resource_type.is_none_or(|t| descriptor.resource_type == t))
            .collect()
    }

    fn persist(&self) -> Result<(), RegistryError> {
        let marker = MarkerFile {
            resources: self.entries.iter().map(|entry| entry.value().clone()).collect(),
        };
        let text = toml::to_string_pretty(&marker).map_err(|source| RegistryError::Serialize {
            path: self.marker_path.display().to_string(),
            source,
        })?;
        std::fs::write(&self.marker_path, text).map_err(|source| RegistryError::Write {
            path: self.marker_path.display().to_string(),
            source,
        })
    }
}
