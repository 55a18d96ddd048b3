//! Webhook ingress for asynchronous gateway notifications.
//!
//! Every delivery is acknowledged with the XML echo regardless of the
//! internal outcome; the gateway retries on a missing echo and an
//! idempotent replay is always cheaper than a retry storm. Uniqueness is
//! enforced per (processing type, unique id) with a one-hour window on
//! top of the inherently idempotent handlers.

#![deny(unsafe_code)]
#![warn(rust_2018_idioms)]

mod echo;
mod handler;
mod payload;
mod router;

pub use echo::echo_body;
pub use handler::{WebhookDisposition, WebhookHandler};
pub use payload::{ProcessingType, WebhookPayload};
pub use router::webhook_router;
