//! Connection and credential descriptors.

use crate::config::ConfigParams;

/// One logical endpoint.
///
/// Known keys are `uri`, `host`, `port`, `protocol` and the backend's namespace
/// keys (`database`, `bucket`, ...). Anything else is an extra option that the
/// composer folds into the query string.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionDescriptor {
    params: ConfigParams,
}

impl ConnectionDescriptor {
    /// Creates an empty descriptor.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps a configuration section.
    #[must_use]
    pub const fn from_config(params: ConfigParams) -> Self {
        Self { params }
    }

    /// Creates a descriptor from key/value pairs.
    #[must_use]
    pub fn from_tuples(pairs: &[(&str, &str)]) -> Self {
        Self::from_config(ConfigParams::from_tuples(pairs))
    }

    /// Sets an arbitrary key.
    #[must_use]
    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.params.set(key, value);
        self
    }

    /// Sets the literal connection URI.
    #[must_use]
    pub fn with_uri(self, uri: impl Into<String>) -> Self {
        self.with("uri", uri)
    }

    /// Sets the host.
    #[must_use]
    pub fn with_host(self, host: impl Into<String>) -> Self {
        self.with("host", host)
    }

    /// Sets the port.
    #[must_use]
    pub fn with_port(self, port: u16) -> Self {
        self.with("port", port.to_string())
    }

    /// Sets the database name.
    #[must_use]
    pub fn with_database(self, database: impl Into<String>) -> Self {
        self.with("database", database)
    }

    /// Returns a non-empty value for `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<String> {
        self.params.get_as_string(key)
    }

    /// Returns the literal URI.
    #[must_use]
    pub fn uri(&self) -> Option<String> {
        self.get("uri")
    }

    /// Returns the host.
    #[must_use]
    pub fn host(&self) -> Option<String> {
        self.get("host")
    }

    /// Returns the port; zero and unparsable values read as absent.
    #[must_use]
    pub fn port(&self) -> Option<u16> {
        self.params
            .get_as_u64("port")
            .and_then(|p| u16::try_from(p).ok())
            .filter(|p| *p != 0)
    }

    /// Returns the first non-empty value among `keys`.
    #[must_use]
    pub fn first_of(&self, keys: &[&str]) -> Option<String> {
        keys.iter().find_map(|k| self.get(k))
    }

    /// Returns the underlying parameters.
    #[must_use]
    pub const fn params(&self) -> &ConfigParams {
        &self.params
    }
}

/// Authentication parameters.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct CredentialDescriptor {
    params: ConfigParams,
}

impl CredentialDescriptor {
    /// Creates an empty credential.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps a configuration section.
    #[must_use]
    pub const fn from_config(params: ConfigParams) -> Self {
        Self { params }
    }

    /// Sets an arbitrary key.
    #[must_use]
    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.params.set(key, value);
        self
    }

    /// Sets the username.
    #[must_use]
    pub fn with_username(self, username: impl Into<String>) -> Self {
        self.with("username", username)
    }

    /// Sets the password.
    #[must_use]
    pub fn with_password(self, password: impl Into<String>) -> Self {
        self.with("password", password)
    }

    /// Returns the username.
    #[must_use]
    pub fn username(&self) -> Option<String> {
        self.params.get_as_string("username")
    }

    /// Returns the password.
    #[must_use]
    pub fn password(&self) -> Option<String> {
        self.params.get_as_string("password")
    }

    /// Returns the underlying parameters.
    #[must_use]
    pub const fn params(&self) -> &ConfigParams {
        &self.params
    }
}

impl std::fmt::Debug for CredentialDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialDescriptor")
            .field("username", &self.username())
            .field("password", &self.password().map(|_| "*****"))
            .finish()
    }
}
