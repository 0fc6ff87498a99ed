//! Block-height-based caches for on-chain oracle parameters and the
//! validator's jail state.

use crate::chain::OracleParams;

/// Blocks between parameter refreshes.
pub const PARAM_CACHE_INTERVAL_BLOCKS: i64 = 200;

/// Blocks between jail-state refreshes.
pub const JAIL_CACHE_INTERVAL_BLOCKS: i64 = 50;

/// Cached oracle module parameters.
#[derive(Debug, Default)]
pub struct ParamCache {
    params: Option<OracleParams>,
    last_updated_block: i64,
}

impl ParamCache {
    pub fn update(&mut self, current_block_height: i64, params: OracleParams) {
        self.last_updated_block = current_block_height;
        self.params = Some(params);
    }

    pub fn params(&self) -> Option<&OracleParams> {
        self.params.as_ref()
    }

    /// Whether the cached parameters are older than the refresh interval.
    /// The cache is fresh during chain warm-up and stale when the height
    /// runs backwards (apparent reorg or node restart).
    pub fn is_outdated(&self, current_block_height: i64) -> bool {
        if self.params.is_none() {
            return true;
        }
        if current_block_height < PARAM_CACHE_INTERVAL_BLOCKS {
            return false;
        }
        if current_block_height < self.last_updated_block {
            return true;
        }
        (current_block_height - self.last_updated_block) > PARAM_CACHE_INTERVAL_BLOCKS
    }
}

/// Cached jail state of the configured validator.
#[derive(Debug, Default)]
pub struct JailCache {
    is_jailed: bool,
    last_updated_block: i64,
}

impl JailCache {
    pub fn update(&mut self, current_block_height: i64, is_jailed: bool) {
        self.last_updated_block = current_block_height;
        self.is_jailed = is_jailed;
    }

    pub fn is_jailed(&self) -> bool {
        self.is_jailed
    }

    pub fn is_outdated(&self, current_block_height: i64) -> bool {
        if current_block_height < JAIL_CACHE_INTERVAL_BLOCKS {
            return false;
        }
        if current_block_height < self.last_updated_block {
            return true;
        }
        (current_block_height - self.last_updated_block) > JAIL_CACHE_INTERVAL_BLOCKS
    }

    #[cfg(test)]
    pub(crate) fn with_jailed(is_jailed: bool) -> Self {
        Self {
            is_jailed,
            last_updated_block: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> OracleParams {
        OracleParams {
            vote_period: 2,
            whitelist: vec!["uusdt".to_string()],
        }
    }

    #[test]
    fn test_param_cache_empty_is_outdated() {
        let cache = ParamCache::default();
        assert!(cache.is_outdated(1));
    }

    #[test]
    fn test_param_cache_warmup_is_fresh() {
        let mut cache = ParamCache::default();
        cache.update(1, params());
        assert!(!cache.is_outdated(PARAM_CACHE_INTERVAL_BLOCKS - 1));
    }

    #[test]
    fn test_param_cache_expires_after_interval() {
        let mut cache = ParamCache::default();
        cache.update(500, params());
        assert!(!cache.is_outdated(500 + PARAM_CACHE_INTERVAL_BLOCKS));
        assert!(cache.is_outdated(500 + PARAM_CACHE_INTERVAL_BLOCKS + 1));
    }

    #[test]
    fn test_param_cache_stale_on_reorg() {
        let mut cache = ParamCache::default();
        cache.update(500, params());
        assert!(cache.is_outdated(400));
    }

    #[test]
    fn test_jail_cache_warmup_is_fresh() {
        let cache = JailCache::default();
        assert!(!cache.is_outdated(JAIL_CACHE_INTERVAL_BLOCKS - 1));
        assert!(!cache.is_jailed());
    }

    #[test]
    fn test_jail_cache_expires_after_interval() {
        let mut cache = JailCache::default();
        cache.update(100, true);
        assert!(!cache.is_outdated(100 + JAIL_CACHE_INTERVAL_BLOCKS));
        assert!(cache.is_outdated(100 + JAIL_CACHE_INTERVAL_BLOCKS + 1));
        assert!(cache.is_jailed());
    }

    #[test]
    fn test_jail_cache_stale_on_reorg() {
        let mut cache = JailCache::default();
        cache.update(100, false);
        assert!(cache.is_outdated(60));
    }
}
