//! Request moderation.
//!
//! When moderation is enabled each request is saved to a [`RequestLog`],
//! registered in the [`ModerationQueue`] under the saved id and held until an
//! operator approves it. Disabling moderation releases everything held.
//!
//! ```text
//! session ──► ModerationGate ──save──► RequestLog ──id──► ModerationQueue
//!                  │                                           │
//!                  └──── waits for release ◄── approve / flush ─┘
//! ```

pub mod gate;
pub mod log;
pub mod queue;

pub use gate::{Moderation, ModerationGate, NOT_APPROVED_MESSAGE};
pub use log::{MemoryRequestLog, RequestLog, RequestLogError, RequestRecord};
pub use queue::{ModerationError, ModerationQueue, ReleaseSignal};
