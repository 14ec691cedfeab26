// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// Bitmask of change notifications raised by an asset.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct UpdateFlags(u32);

impl UpdateFlags {
    pub const NONE: Self = Self(0);
    /// Readable data changed (new version, revalidated, or cleared).
    pub const CACHE_DATA_UPDATED: Self = Self(1 << 0);
    pub const DOWNLOAD_STARTED: Self = Self(1 << 1);
    pub const DOWNLOAD_PROGRESS: Self = Self(1 << 2);
    pub const DOWNLOAD_COMPLETED: Self = Self(1 << 3);
    pub const DOWNLOAD_SUCCESSFUL: Self = Self(1 << 4);
    pub const DOWNLOAD_FAILED: Self = Self(1 << 5);

    const NAMES: [(Self, &'static str); 6] = [
        (Self::CACHE_DATA_UPDATED, "CacheDataUpdated"),
        (Self::DOWNLOAD_STARTED, "DownloadStarted"),
        (Self::DOWNLOAD_PROGRESS, "DownloadProgress"),
        (Self::DOWNLOAD_COMPLETED, "DownloadCompleted"),
        (Self::DOWNLOAD_SUCCESSFUL, "DownloadSuccessful"),
        (Self::DOWNLOAD_FAILED, "DownloadFailed"),
    ];

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// True if every bit of `other` is set (and `other` is not empty).
    pub const fn contains(self, other: Self) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }
}

impl BitOr for UpdateFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for UpdateFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for UpdateFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("UpdateFlags(NONE)");
        }
        let names: Vec<&str> = Self::NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "UpdateFlags({})", names.join(" | "))
    }
}
