// Copyright 2026 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};

/// Default cap on the number of regions in a memory table.
pub const DEFAULT_MAX_MEM_REGIONS: usize = 64;
/// Default scratch capacity, in host spans, for one descriptor chain (`UIO_MAXIOV`).
pub const DEFAULT_MAX_CHAIN_LEN: usize = 1024;
/// Default device id.
pub const DEFAULT_DEVICE_ID: &str = "vhost0";

/// Strongly typed structure describing a vhost device instance.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct DeviceConfig {
    /// Device id. Keys the device metrics and names the worker thread.
    pub id: String,
    /// Maximum number of regions accepted by `SetMemTable`.
    pub max_mem_regions: usize,
    /// Maximum number of host spans produced for one descriptor chain. Also sizes the
    /// zero-copy completion ring.
    pub max_chain_len: usize,
    /// Feature bits offered by the backend on top of the engine's own set.
    pub backend_features: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            id: String::from(DEFAULT_DEVICE_ID),
            max_mem_regions: DEFAULT_MAX_MEM_REGIONS,
            max_chain_len: DEFAULT_MAX_CHAIN_LEN,
            backend_features: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_config_deserialize() {
        let config: DeviceConfig = serde_json::from_str(r#"{"id": "net0"}"#).unwrap();
        assert_eq!(config.id, "net0");
        assert_eq!(config.max_mem_regions, DEFAULT_MAX_MEM_REGIONS);
        assert_eq!(config.max_chain_len, DEFAULT_MAX_CHAIN_LEN);

        let config: DeviceConfig = serde_json::from_str(
            r#"{"id": "net1", "max_mem_regions": 8, "max_chain_len": 16, "backend_features": 1}"#,
        )
        .unwrap();
        assert_eq!(config.max_mem_regions, 8);
        assert_eq!(config.max_chain_len, 16);
        assert_eq!(config.backend_features, 1);

        serde_json::from_str::<DeviceConfig>(r#"{"id": "net2", "bogus": 1}"#).unwrap_err();
    }
}
