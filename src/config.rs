//! Engine configuration

use thiserror::Error;

/// Parameters governing the bridging engine's fixed resources
///
/// Capacities are fixed at [`Bridge`](crate::Bridge) construction; the engine
/// never grows them at runtime.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub(crate) containers: usize,
    pub(crate) sockets: usize,
    pub(crate) at_budget: usize,
}

impl BridgeConfig {
    /// Capacity of the in-flight command container pool
    ///
    /// Two slots are permanently consumed by the long-lived select and report
    /// containers once armed.
    pub fn containers(&mut self, value: usize) -> &mut Self {
        self.containers = value;
        self
    }

    /// Capacity of the logical socket table
    pub fn sockets(&mut self, value: usize) -> &mut Self {
        self.sockets = value;
        self
    }

    /// Byte budget for one formatted AT command line
    pub fn at_budget(&mut self, value: usize) -> &mut Self {
        self.at_budget = value;
        self
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if self.containers < 3 {
            return Err(ConfigError::IllegalValue("containers"));
        }
        if self.sockets == 0 {
            return Err(ConfigError::IllegalValue("sockets"));
        }
        if self.at_budget < 32 {
            return Err(ConfigError::IllegalValue("at_budget"));
        }
        Ok(())
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            containers: 16,
            sockets: 8,
            at_budget: 128,
        }
    }
}

/// Errors in the configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// A field was set to an unusable value
    #[error("illegal configuration value for {0}")]
    IllegalValue(&'static str),
}
