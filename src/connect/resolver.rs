//! Connection and credential resolution from configuration.

use super::{ConnectionDescriptor, CredentialDescriptor};
use crate::config::ConfigParams;

/// Reads connection descriptors from `connections.N.*` or `connection.*`.
///
/// When a `connections` section is present its entries are used in index
/// order and the single `connection` section is ignored.
#[derive(Debug, Clone, Default)]
pub struct ConnectionResolver {
    connections: Vec<ConnectionDescriptor>,
}

impl ConnectionResolver {
    /// Creates a resolver from configuration.
    #[must_use]
    pub fn from_config(config: &ConfigParams) -> Self {
        Self {
            connections: many_from_config(config, "connection", "connections")
                .into_iter()
                .map(ConnectionDescriptor::from_config)
                .collect(),
        }
    }

    /// Adds a descriptor.
    pub fn add(&mut self, descriptor: ConnectionDescriptor) {
        self.connections.push(descriptor);
    }

    /// Returns every configured descriptor.
    #[must_use]
    pub fn resolve_all(&self) -> &[ConnectionDescriptor] {
        &self.connections
    }

    /// Returns the first descriptor.
    #[must_use]
    pub fn resolve(&self) -> Option<&ConnectionDescriptor> {
        self.connections.first()
    }
}

/// Reads credential descriptors from `credentials.N.*` or `credential.*`.
#[derive(Debug, Clone, Default)]
pub struct CredentialResolver {
    credentials: Vec<CredentialDescriptor>,
}

impl CredentialResolver {
    /// Creates a resolver from configuration.
    #[must_use]
    pub fn from_config(config: &ConfigParams) -> Self {
        Self {
            credentials: many_from_config(config, "credential", "credentials")
                .into_iter()
                .map(CredentialDescriptor::from_config)
                .collect(),
        }
    }

    /// Adds a credential.
    pub fn add(&mut self, credential: CredentialDescriptor) {
        self.credentials.push(credential);
    }

    /// Returns the credential to use: the first one configured.
    #[must_use]
    pub fn lookup(&self) -> Option<&CredentialDescriptor> {
        self.credentials.first()
    }
}

fn many_from_config(config: &ConfigParams, single: &str, many: &str) -> Vec<ConfigParams> {
    let section = config.get_section(many);
    let mut result: Vec<ConfigParams> = section
        .section_names()
        .iter()
        .map(|name| section.get_section(name))
        .filter(|s| !s.is_empty())
        .collect();

    if result.is_empty() {
        let one = config.get_section(single);
        if !one.is_empty() {
            result.push(one);
        }
    }

    result
}
