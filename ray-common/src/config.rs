// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Object store configuration.
//!
//! A plain struct with defaults, overridable by:
//! - a JSON object (or base64-encoded JSON, as passed by a launcher)
//! - environment variables `RAY_<field_name>`
//!
//! Components receive an explicit `Arc<RayConfig>`. The process-wide
//! singleton below is only for the outermost composition root.

use std::sync::OnceLock;
use std::time::Duration;

use crate::constants::{
    CONFIG_ENV_PREFIX, DEFAULT_MAX_DIRECT_CALL_OBJECT_SIZE, DEFAULT_OBJECT_CHUNK_SIZE,
    DEFAULT_OBJECT_STORE_MEMORY,
};
use crate::status::{RayError, RayResult};

static RAY_CONFIG: OnceLock<RayConfig> = OnceLock::new();

/// The global config, or the defaults if [`initialize_config`] was never
/// called.
pub fn ray_config() -> &'static RayConfig {
    RAY_CONFIG.get_or_init(RayConfig::from_env)
}

/// Initialize the global config from a base64-encoded JSON string.
pub fn initialize_config(config_str: Option<&str>) -> RayResult<&'static RayConfig> {
    let config = match config_str {
        Some(s) if !s.is_empty() => RayConfig::from_base64_json(s)?,
        _ => RayConfig::from_env(),
    };
    RAY_CONFIG
        .set(config)
        .map_err(|_| RayError::invalid("RayConfig already initialized"))?;
    Ok(ray_config())
}

#[derive(Debug, Clone, PartialEq)]
pub struct RayConfig {
    // ─── Placement ────────────────────────────────────────────
    /// Serialized size at which `put` promotes to the shared store.
    pub max_direct_call_object_size: u64,

    // ─── Shared store ─────────────────────────────────────────
    pub object_store_memory: u64,
    pub object_chunk_size: u64,

    // ─── Remote fetch ─────────────────────────────────────────
    pub object_fetch_max_attempts: u32,
    pub object_fetch_retry_initial_delay_ms: u64,
    pub object_fetch_retry_max_delay_ms: u64,

    // ─── Ownership ────────────────────────────────────────────
    /// How many freed IDs are remembered to detect double frees.
    pub freed_object_tombstone_capacity: usize,

    // ─── Scheduling ───────────────────────────────────────────
    pub max_pending_tasks: usize,
    pub actor_pool_max_queued_jobs: usize,
}

impl Default for RayConfig {
    fn default() -> Self {
        Self {
            max_direct_call_object_size: DEFAULT_MAX_DIRECT_CALL_OBJECT_SIZE as u64,
            object_store_memory: DEFAULT_OBJECT_STORE_MEMORY,
            object_chunk_size: DEFAULT_OBJECT_CHUNK_SIZE,
            object_fetch_max_attempts: 3,
            object_fetch_retry_initial_delay_ms: 10,
            object_fetch_retry_max_delay_ms: 1_000,
            freed_object_tombstone_capacity: 10_000,
            max_pending_tasks: 1_024,
            actor_pool_max_queued_jobs: 1_024,
        }
    }
}

/// Applies `$apply!(field, type)` to every config field.
macro_rules! for_each_field {
    ($apply:ident) => {
        $apply!(max_direct_call_object_size, u64);
        $apply!(object_store_memory, u64);
        $apply!(object_chunk_size, u64);
        $apply!(object_fetch_max_attempts, u32);
        $apply!(object_fetch_retry_initial_delay_ms, u64);
        $apply!(object_fetch_retry_max_delay_ms, u64);
        $apply!(freed_object_tombstone_capacity, usize);
        $apply!(max_pending_tasks, usize);
        $apply!(actor_pool_max_queued_jobs, usize);
    };
}

impl RayConfig {
    /// Defaults plus environment overrides.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Parse from base64-encoded JSON.
    pub fn from_base64_json(b64: &str) -> RayResult<Self> {
        let decoded = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, b64)
            .map_err(|e| RayError::invalid_argument(format!("base64 decode error: {e}")))?;
        let json_str = String::from_utf8(decoded)
            .map_err(|e| RayError::invalid_argument(format!("UTF-8 decode error: {e}")))?;
        Self::from_json(&json_str)
    }

    /// Parse from a JSON object. Unknown keys are ignored; keys with the
    /// wrong type are rejected.
    pub fn from_json(json: &str) -> RayResult<Self> {
        let map: serde_json::Map<String, serde_json::Value> = serde_json::from_str(json)
            .map_err(|e| RayError::invalid_argument(format!("JSON parse error: {e}")))?;

        let mut config = Self::default();

        macro_rules! set_field {
            ($field:ident, $ty:ty) => {
                if let Some(v) = map.get(stringify!($field)) {
                    config.$field = v
                        .as_u64()
                        .and_then(|n| <$ty>::try_from(n).ok())
                        .ok_or_else(|| {
                            RayError::invalid_argument(format!(
                                "config key {} expects a non-negative integer, got {v}",
                                stringify!($field)
                            ))
                        })?;
                }
            };
        }
        for_each_field!(set_field);

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        macro_rules! env_override {
            ($field:ident, $ty:ty) => {
                let env_key = format!("{}{}", CONFIG_ENV_PREFIX, stringify!($field));
                if let Ok(val) = std::env::var(&env_key) {
                    match val.parse::<$ty>() {
                        Ok(v) => self.$field = v,
                        Err(_) => {
                            tracing::warn!(key = %env_key, value = %val, "Ignoring malformed config override")
                        }
                    }
                }
            };
        }
        for_each_field!(env_override);
    }

    pub fn validate(&self) -> RayResult<()> {
        if self.object_chunk_size == 0 {
            return Err(RayError::invalid_argument("object_chunk_size must be positive"));
        }
        if self.actor_pool_max_queued_jobs == 0 || self.max_pending_tasks == 0 {
            return Err(RayError::invalid_argument(
                "queue and concurrency bounds must be positive",
            ));
        }
        Ok(())
    }

    pub fn fetch_retry_initial_delay(&self) -> Duration {
        Duration::from_millis(self.object_fetch_retry_initial_delay_ms)
    }

    pub fn fetch_retry_max_delay(&self) -> Duration {
        Duration::from_millis(self.object_fetch_retry_max_delay_ms)
    }
}
