//! Inbound delivery-event webhooks for an email campaign platform.
//!
//! Providers post delivery events to `/webhook/{id}`. Each webhook may carry
//! an operator-written `authorize` and `transform` script; both run in a
//! fresh, resource-limited JavaScript sandbox per call. Accepted events move
//! the matching message to a new status, and every request is audited.

pub mod audit;
pub mod authorization;
pub mod config;
pub mod error;
pub mod events;
pub mod http_server;
pub mod pipeline;
pub mod sandbox;
pub mod status;
pub mod store;
pub mod telemetry;
pub mod transform;
pub mod types;
pub mod validate;
