//! One silent credential refresh per page load.
//!
//! The marker lives in [`SessionFlags`] and is dropped when the page is
//! hidden or unloaded, or when its TTL runs out.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use vesper_store::SessionFlags;

pub const PAGE_LOAD_GUARD_KEY: &str = "vesper.auth.refresh_attempted";

/// Visibility events forwarded by the embedding shell.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageLifecycle {
    Visible,
    Hidden,
    Unload,
}

#[derive(Clone)]
pub struct PageLoadGuard {
    flags: Arc<SessionFlags>,
    key: String,
    ttl: Option<Duration>,
}

impl PageLoadGuard {
    pub fn new(flags: Arc<SessionFlags>, ttl: Option<Duration>) -> Self {
        Self {
            flags,
            key: PAGE_LOAD_GUARD_KEY.to_string(),
            ttl,
        }
    }

    /// Claim the attempt for this page load. False if already claimed.
    pub fn try_acquire(&self) -> bool {
        self.flags.set_if_absent(&self.key, self.ttl)
    }

    pub fn is_held(&self) -> bool {
        self.flags.is_set(&self.key)
    }

    pub fn reset(&self) {
        self.flags.clear(&self.key);
    }

    pub fn on_lifecycle(&self, event: PageLifecycle) {
        match event {
            PageLifecycle::Hidden | PageLifecycle::Unload => {
                if self.is_held() {
                    debug!(?event, "clearing page-load refresh guard");
                }
                self.reset();
            }
            PageLifecycle::Visible => {}
        }
    }
}
