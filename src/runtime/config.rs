//! Configuration for the kernel runtime
//!
//! [`RuntimeConfig`] selects the device, the memory strategy and how much of
//! the device the pool may reserve.

use crate::error::{ForgeError, ForgeResult};
use crate::memory::MemoryPool;
use crate::runtime::stats::MemoryMode;

const DYNAMIC_MEM_POOL_ENV: &str = "GRAPHFORGE_DYNAMIC_MEM_POOL";
const SINGLE_SHOT_ENV: &str = "GRAPHFORGE_SINGLE_SHOT";
const POOL_BYTES_ENV: &str = "GRAPHFORGE_POOL_BYTES";
const DEVICE_ID_ENV: &str = "GRAPHFORGE_DEVICE_ID";

/// Configuration for a runtime session
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeConfig {
    /// Device to select during init
    pub device_id: u32,

    /// Reuse memory through reference counting while a graph runs
    pub enable_dynamic_mem_pool: bool,

    /// One-off inference: always use fixed static offsets
    pub single_shot_inference: bool,

    /// Bytes to reserve for the pool; `None` means `pool_fraction` of free memory
    pub pool_capacity: Option<usize>,

    /// Share of free device memory reserved when `pool_capacity` is unset
    pub pool_fraction: f64,

    /// Pool allocation granularity (power of two)
    pub alignment: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            device_id: 0,
            enable_dynamic_mem_pool: true,
            single_shot_inference: false,
            pool_capacity: None,
            pool_fraction: 0.9,
            alignment: MemoryPool::DEFAULT_ALIGNMENT,
        }
    }
}

impl RuntimeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by `GRAPHFORGE_*` environment variables.
    ///
    /// Unparseable values are ignored with a warning.
    pub fn from_env() -> Self {
        let mut config = RuntimeConfig::new();
        if let Some(enabled) = env_parse(DYNAMIC_MEM_POOL_ENV, parse_bool) {
            config.enable_dynamic_mem_pool = enabled;
        }
        if let Some(single_shot) = env_parse(SINGLE_SHOT_ENV, parse_bool) {
            config.single_shot_inference = single_shot;
        }
        if let Some(bytes) = env_parse(POOL_BYTES_ENV, |s| s.parse::<usize>().ok()) {
            config.pool_capacity = Some(bytes);
        }
        if let Some(device_id) = env_parse(DEVICE_ID_ENV, |s| s.parse::<u32>().ok()) {
            config.device_id = device_id;
        }
        config
    }

    /// Set the device to select
    pub fn with_device_id(mut self, device_id: u32) -> Self {
        self.device_id = device_id;
        self
    }

    /// Enable or disable the dynamic memory pool
    pub fn with_dynamic_mem_pool(mut self, enabled: bool) -> Self {
        self.enable_dynamic_mem_pool = enabled;
        self
    }

    /// Mark the session as single-shot inference
    pub fn with_single_shot_inference(mut self, single_shot: bool) -> Self {
        self.single_shot_inference = single_shot;
        self
    }

    /// Reserve exactly `bytes` for the pool
    pub fn with_pool_capacity(mut self, bytes: usize) -> Self {
        self.pool_capacity = Some(bytes);
        self
    }

    /// Reserve `fraction` of free device memory for the pool
    pub fn with_pool_fraction(mut self, fraction: f64) -> Self {
        self.pool_fraction = fraction;
        self
    }

    /// Set the allocation granularity
    pub fn with_alignment(mut self, alignment: usize) -> Self {
        self.alignment = alignment;
        self
    }

    /// Strategy `assign_memory` picks under this configuration
    pub fn memory_mode(&self) -> MemoryMode {
        if self.enable_dynamic_mem_pool && !self.single_shot_inference {
            MemoryMode::Dynamic
        } else {
            MemoryMode::Static
        }
    }

    /// Pool size for a device with `free_bytes` available
    pub fn pool_bytes(&self, free_bytes: usize) -> usize {
        match self.pool_capacity {
            Some(bytes) => bytes,
            None => (free_bytes as f64 * self.pool_fraction) as usize,
        }
    }

    pub fn validate(&self) -> ForgeResult<()> {
        if !self.alignment.is_power_of_two() {
            return Err(ForgeError::InvalidConfiguration(format!(
                "alignment must be a power of 2, got {}",
                self.alignment
            )));
        }
        if !(self.pool_fraction > 0.0 && self.pool_fraction <= 1.0) {
            return Err(ForgeError::InvalidConfiguration(format!(
                "pool_fraction must be in (0, 1], got {}",
                self.pool_fraction
            )));
        }
        if self.pool_capacity == Some(0) {
            return Err(ForgeError::InvalidConfiguration(
                "pool_capacity must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

fn env_parse<T>(name: &str, parse: impl Fn(&str) -> Option<T>) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    let parsed = parse(raw.trim());
    if parsed.is_none() {
        tracing::warn!("ignoring {}={:?}: not a valid value", name, raw);
    }
    parsed
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_env() {
        for name in [DYNAMIC_MEM_POOL_ENV, SINGLE_SHOT_ENV, POOL_BYTES_ENV, DEVICE_ID_ENV] {
            std::env::remove_var(name);
        }
    }

    #[test]
    fn test_runtime_config_default() {
        let config = RuntimeConfig::default();
        assert_eq!(config.device_id, 0);
        assert!(config.enable_dynamic_mem_pool);
        assert!(!config.single_shot_inference);
        assert_eq!(config.pool_capacity, None);
        assert_eq!(config.alignment, 512);
        assert_eq!(config.memory_mode(), MemoryMode::Dynamic);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_runtime_config_builder() {
        let config = RuntimeConfig::new()
            .with_device_id(3)
            .with_pool_capacity(1 << 20)
            .with_alignment(256)
            .with_single_shot_inference(true);
        assert_eq!(config.device_id, 3);
        assert_eq!(config.pool_bytes(1 << 30), 1 << 20);
        assert_eq!(config.alignment, 256);
        assert_eq!(config.memory_mode(), MemoryMode::Static);
    }

    #[test]
    fn test_memory_mode_selection() {
        let disabled = RuntimeConfig::new().with_dynamic_mem_pool(false);
        assert_eq!(disabled.memory_mode(), MemoryMode::Static);
        let both = RuntimeConfig::new()
            .with_dynamic_mem_pool(false)
            .with_single_shot_inference(true);
        assert_eq!(both.memory_mode(), MemoryMode::Static);
    }

    #[test]
    fn test_pool_bytes_from_fraction() {
        let config = RuntimeConfig::new().with_pool_fraction(0.5);
        assert_eq!(config.pool_bytes(1000), 500);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(RuntimeConfig::new().with_alignment(300).validate().is_err());
        assert!(RuntimeConfig::new().with_pool_fraction(0.0).validate().is_err());
        assert!(RuntimeConfig::new().with_pool_fraction(1.5).validate().is_err());
        let err = RuntimeConfig::new().with_pool_capacity(0).validate().unwrap_err();
        assert!(err.is_user_error());
    }

    #[test]
    #[serial]
    fn test_from_env_overrides() {
        clear_env();
        std::env::set_var(DYNAMIC_MEM_POOL_ENV, "off");
        std::env::set_var(POOL_BYTES_ENV, "4096");
        std::env::set_var(DEVICE_ID_ENV, "2");
        let config = RuntimeConfig::from_env();
        assert!(!config.enable_dynamic_mem_pool);
        assert_eq!(config.pool_capacity, Some(4096));
        assert_eq!(config.device_id, 2);
        assert!(!config.single_shot_inference);
        clear_env();
    }

    #[test]
    #[serial]
    fn test_from_env_ignores_garbage() {
        clear_env();
        std::env::set_var(SINGLE_SHOT_ENV, "maybe");
        std::env::set_var(POOL_BYTES_ENV, "lots");
        let config = RuntimeConfig::from_env();
        assert_eq!(config, RuntimeConfig::default());
        clear_env();
    }
}
