//! In-memory aggregation of per-entity deltas
//!
//! Each delta kind has its own lock, held only to add a delta or to swap the
//! map out during a flush.

use std::collections::HashMap;
use std::sync::Mutex;

/// Column a batched delta applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeltaKind {
    UserQuota,
    TokenQuota,
    UsedQuota,
    ChannelUsedQuota,
    RequestCount,
}

impl DeltaKind {
    pub const ALL: [Self; 5] = [
        Self::UserQuota,
        Self::TokenQuota,
        Self::UsedQuota,
        Self::ChannelUsedQuota,
        Self::RequestCount,
    ];

    const fn index(self) -> usize {
        match self {
            Self::UserQuota => 0,
            Self::TokenQuota => 1,
            Self::UsedQuota => 2,
            Self::ChannelUsedQuota => 3,
            Self::RequestCount => 4,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::UserQuota => "user_quota",
            Self::TokenQuota => "token_quota",
            Self::UsedQuota => "used_quota",
            Self::ChannelUsedQuota => "channel_used_quota",
            Self::RequestCount => "request_count",
        }
    }
}

/// Pending signed deltas keyed by entity id, one map per [`DeltaKind`]
#[derive(Debug, Default)]
pub struct BatchAccumulator {
    stores: [Mutex<HashMap<i64, i64>>; 5],
}

impl BatchAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `delta` to the pending sum for `id`
    pub fn add(&self, kind: DeltaKind, id: i64, delta: i64) {
        let mut store = self.stores[kind.index()]
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *store.entry(id).or_insert(0) += delta;
    }

    /// Take every pending delta of `kind`, leaving an empty map behind
    pub fn drain(&self, kind: DeltaKind) -> HashMap<i64, i64> {
        let mut store = self.stores[kind.index()]
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        std::mem::take(&mut *store)
    }

    /// Pending sum for one id, mainly for inspection
    pub fn pending(&self, kind: DeltaKind, id: i64) -> Option<i64> {
        self.stores[kind.index()]
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(&id)
            .copied()
    }

    pub fn is_empty(&self) -> bool {
        self.stores.iter().all(|store| {
            store
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .is_empty()
        })
    }
}
