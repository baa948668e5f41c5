//! Link status for Narrowband.
//!
//! Two process-wide registries that watch the channels rather than carry
//! traffic:
//!
//! - [`ConnectionHealth`]: per channel and direction, when did the last
//!   send/receive succeed or fail. Feeds status text and the status icon.
//! - [`LinkStateCache`]: debounced "is any network up", with a direct
//!   second-guess probe and a resend signal for when the link returns.
//!
//! ```text
//! Endpoint send/receive ──update()──→ ConnectionHealth ──→ summarize / icon_state
//! Platform events ──on_platform_event()──→ LinkStateCache ──(quiet interval)──→ listeners
//!                                                          └─→ resend generation
//! ```

mod health;
mod netstate;

pub use health::{
    ConnectionHealth, ConnectionRecord, HealthEntry, HealthSnapshot, IconState, LinkHealth,
    FLASH_WINDOW,
};
pub use netstate::{
    ConnectivityProbe, LinkConfig, LinkEvent, LinkListener, LinkStateCache, ListenerId,
};
