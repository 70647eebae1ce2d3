use crate::{MapperError, MapperErrorKind, MapperResult, provider::ProviderLimits};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Hard ceiling on a region's staging buffer, regardless of provider limits.
pub const MAX_STAGING_BUFFER_SIZE: u32 = 1 << 20;
pub const DEFAULT_MAX_CONTEXTS: u16 = 8;
pub const DEFAULT_STAGING_BUFFER_SIZE: u32 = 64 * 1024;
pub const DEFAULT_DRAIN_TIMEOUT_MS: u64 = 2_000;

/// Per-mapper tunables applied to every region it creates.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MapperConfig {
    /// Number of request contexts acquired per region.
    pub max_contexts: u16,
    /// Requested staging buffer size in bytes; providers may lower it.
    pub staging_buffer_size: u32,
    /// How long unbind waits for in-flight contexts before forcing teardown.
    pub drain_timeout_ms: u64,
}

impl Default for MapperConfig {
    fn default() -> Self {
        Self {
            max_contexts: DEFAULT_MAX_CONTEXTS,
            staging_buffer_size: DEFAULT_STAGING_BUFFER_SIZE,
            drain_timeout_ms: DEFAULT_DRAIN_TIMEOUT_MS,
        }
    }
}

impl MapperConfig {
    pub fn validate(&self) -> MapperResult<()> {
        if self.max_contexts == 0 {
            return Err(MapperError::with_message(
                MapperErrorKind::NotSupported,
                "max_contexts must be at least 1",
            ));
        }
        if !(1..=MAX_STAGING_BUFFER_SIZE).contains(&self.staging_buffer_size) {
            return Err(MapperError::with_message(
                MapperErrorKind::NotSupported,
                format!(
                    "staging_buffer_size {} outside 1..={MAX_STAGING_BUFFER_SIZE}",
                    self.staging_buffer_size
                ),
            ));
        }
        Ok(())
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    /// Staging size a region actually uses once the provider's safe-allocation limit is known.
    pub fn effective_staging_size(&self, limits: ProviderLimits) -> u32 {
        let configured = self.staging_buffer_size.min(MAX_STAGING_BUFFER_SIZE);
        match u32::try_from(limits.max_safe_alloc) {
            Ok(0) => configured,
            Ok(limit) => configured.min(limit),
            Err(_) => configured,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = MapperConfig::default();
        config.validate().unwrap();
        assert_eq!(config.max_contexts, 8);
        assert_eq!(config.staging_buffer_size, 64 * 1024);
        assert_eq!(config.drain_timeout(), Duration::from_secs(2));
    }

    #[test]
    fn rejects_out_of_range_values() {
        let zero_contexts = MapperConfig {
            max_contexts: 0,
            ..MapperConfig::default()
        };
        assert_eq!(
            zero_contexts.validate().unwrap_err().kind(),
            MapperErrorKind::NotSupported
        );
        let huge = MapperConfig {
            staging_buffer_size: MAX_STAGING_BUFFER_SIZE + 1,
            ..MapperConfig::default()
        };
        assert!(huge.validate().is_err());
        let empty = MapperConfig {
            staging_buffer_size: 0,
            ..MapperConfig::default()
        };
        assert!(empty.validate().is_err());
    }

    #[test]
    fn provider_limit_caps_staging() {
        let config = MapperConfig::default();
        assert_eq!(
            config.effective_staging_size(ProviderLimits { max_safe_alloc: 0 }),
            64 * 1024
        );
        assert_eq!(
            config.effective_staging_size(ProviderLimits {
                max_safe_alloc: 4096
            }),
            4096
        );
        assert_eq!(
            config.effective_staging_size(ProviderLimits {
                max_safe_alloc: usize::MAX
            }),
            64 * 1024
        );
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config: MapperConfig = serde_json::from_str(r#"{"max_contexts": 2}"#).unwrap();
        assert_eq!(config.max_contexts, 2);
        assert_eq!(config.staging_buffer_size, DEFAULT_STAGING_BUFFER_SIZE);
        assert_eq!(config.drain_timeout_ms, DEFAULT_DRAIN_TIMEOUT_MS);
    }
}
