//! # Listener Configuration
//!
//! ## Environment Variables
//! - `GILGATE_LISTEN_ADDR` - Public gateway address (default: 0.0.0.0:8080)
//! - `GILGATE_ADMIN_ADDR` - Admin API address (default: 127.0.0.1:9000)

use std::env;
use std::net::{Ipv4Addr, SocketAddr};

use gilgate_core::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HttpServerConfig {
    pub listen_addr: SocketAddr,
    pub admin_addr: SocketAddr,
}

impl Default for HttpServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 8080)),
            admin_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, 9000)),
        }
    }
}

/// Builder for [`HttpServerConfig`] with environment variable support
#[derive(Debug, Clone, Default)]
pub struct HttpServerConfigBuilder {
    config: HttpServerConfig,
}

impl HttpServerConfigBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Load listener addresses from environment variables
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if an address does not parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut builder = Self::default();
        if let Some(addr) = get_env_addr("GILGATE_LISTEN_ADDR")? {
            builder = builder.listen_addr(addr);
        }
        if let Some(addr) = get_env_addr("GILGATE_ADMIN_ADDR")? {
            builder = builder.admin_addr(addr);
        }
        Ok(builder)
    }

    pub fn listen_addr(mut self, addr: SocketAddr) -> Self {
        self.config.listen_addr = addr;
        self
    }

    pub fn admin_addr(mut self, addr: SocketAddr) -> Self {
        self.config.admin_addr = addr;
        self
    }

    /// # Errors
    ///
    /// Fails if both listeners would share one address.
    pub fn build(self) -> Result<HttpServerConfig, ConfigError> {
        let config = self.config;
        if config.listen_addr.port() != 0 && config.listen_addr == config.admin_addr {
            return Err(ConfigError::ValidationError(format!(
                "listen and admin addresses must differ, both are {}",
                config.listen_addr
            )));
        }
        Ok(config)
    }
}

fn get_env_addr(key: &str) -> Result<Option<SocketAddr>, ConfigError> {
    match env::var(key) {
        Ok(val) => val
            .parse::<SocketAddr>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidEnvVar {
                key: key.to_string(),
                message: format!("invalid socket address '{val}': {e}"),
            }),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_defaults() {
        let config = HttpServerConfigBuilder::new().build().unwrap();
        assert_eq!(config.listen_addr.port(), 8080);
        assert_eq!(config.admin_addr, "127.0.0.1:9000".parse().unwrap());
    }

    #[test]
    fn test_same_address_rejected() {
        let addr: SocketAddr = "127.0.0.1:7000".parse().unwrap();
        let result = HttpServerConfigBuilder::new()
            .listen_addr(addr)
            .admin_addr(addr)
            .build();
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }

    #[test]
    #[serial]
    fn test_from_env() {
        unsafe {
            env::set_var("GILGATE_LISTEN_ADDR", "127.0.0.1:8181");
            env::remove_var("GILGATE_ADMIN_ADDR");
        }
        let config = HttpServerConfigBuilder::from_env().unwrap().build().unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:8181".parse().unwrap());
        assert_eq!(config.admin_addr.port(), 9000);
        unsafe {
            env::remove_var("GILGATE_LISTEN_ADDR");
        }
    }

    #[test]
    #[serial]
    fn test_from_env_invalid() {
        unsafe {
            env::set_var("GILGATE_ADMIN_ADDR", "localhost");
        }
        let result = HttpServerConfigBuilder::from_env();
        assert!(matches!(result, Err(ConfigError::InvalidEnvVar { .. })));
        unsafe {
            env::remove_var("GILGATE_ADMIN_ADDR");
        }
    }
}
