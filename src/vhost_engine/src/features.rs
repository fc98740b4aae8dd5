// Copyright 2026 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use bitflags::bitflags;

bitflags! {
    /// Feature bits negotiated between the guest driver and the engine.
    ///
    /// Only capability masking is performed: the engine accepts any subset of the bits it
    /// offers and uses the acked set to gate code paths.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Features: u64 {
        /// Checksum offload framing (backend extension).
        const CSUM = 1 << 0;
        /// Mergeable receive buffer framing (backend extension).
        const MRG_RXBUF = 1 << 15;
        /// Signal the guest whenever the avail ring has been drained.
        const NOTIFY_ON_EMPTY = 1 << 24;
        /// Log every guest memory write in the dirty bitmap.
        const LOG_ALL = 1 << 26;
        /// Backend prepends a virtio-net header (backend extension).
        const NET_HDR = 1 << 27;
        /// Indirect descriptor tables.
        const INDIRECT_DESC = 1 << 28;
        /// Event index notification suppression.
        const EVENT_IDX = 1 << 29;
    }
}

/// Features implemented by the engine itself, independent of the backend.
pub const VHOST_FEATURES: Features = Features::NOTIFY_ON_EMPTY
    .union(Features::INDIRECT_DESC)
    .union(Features::EVENT_IDX)
    .union(Features::LOG_ALL);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feature_bits() {
        assert_eq!(Features::NOTIFY_ON_EMPTY.bits(), 0x100_0000);
        assert_eq!(Features::LOG_ALL.bits(), 0x400_0000);
        assert_eq!(Features::INDIRECT_DESC.bits(), 0x1000_0000);
        assert_eq!(Features::EVENT_IDX.bits(), 0x2000_0000);
        assert!(!VHOST_FEATURES.contains(Features::NET_HDR));
        assert!(VHOST_FEATURES.contains(Features::EVENT_IDX | Features::LOG_ALL));
    }
}
