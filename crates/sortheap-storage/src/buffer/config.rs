//! Buffer pool configuration.

use sortheap_common::constants::{
    DEFAULT_BLOCK_SIZE, DEFAULT_BUFFER_FRAMES, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE, MIN_BUFFER_FRAMES,
};

/// Configuration for the buffer pool.
#[derive(Debug, Clone)]
pub struct BufferPoolConfig {
    /// Target number of page frames. The pool grows past it rather than fail
    /// when every frame is pinned.
    pub num_frames: usize,
    /// Page size in bytes; must match the block store.
    pub page_size: usize,
}

impl BufferPoolConfig {
    /// Creates a configuration with the specified number of frames.
    pub fn new(num_frames: usize) -> Self {
        Self {
            num_frames,
            page_size: DEFAULT_BLOCK_SIZE,
        }
    }

    /// Small pool for tests: eviction happens early and often.
    pub fn for_testing() -> Self {
        Self {
            num_frames: MIN_BUFFER_FRAMES,
            page_size: MIN_BLOCK_SIZE,
        }
    }

    /// Sets the page size.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    /// Returns the memory the target frame count occupies.
    pub fn memory_usage(&self) -> usize {
        self.num_frames * self.page_size
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.num_frames < MIN_BUFFER_FRAMES {
            return Err("num_frames is below the minimum");
        }
        if !self.page_size.is_power_of_two() {
            return Err("page_size must be a power of 2");
        }
        if !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&self.page_size) {
            return Err("page_size must be between 4 KiB and 32 KiB");
        }
        Ok(())
    }
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_FRAMES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_new() {
        let config = BufferPoolConfig::new(1000);
        assert_eq!(config.num_frames, 1000);
        assert_eq!(config.page_size, DEFAULT_BLOCK_SIZE);
        assert_eq!(config.memory_usage(), 1000 * DEFAULT_BLOCK_SIZE);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation() {
        assert!(BufferPoolConfig::new(0).validate().is_err());
        assert!(BufferPoolConfig::new(64).with_page_size(5000).validate().is_err());
        assert!(BufferPoolConfig::new(64).with_page_size(65536).validate().is_err());
        assert!(BufferPoolConfig::for_testing().validate().is_ok());
    }
}
