//! Attachment access
//!
//! Binary attachments live in `<app>/attachments/` under deterministic names
//! (see [`AttachmentRef`](crate::models::AttachmentRef)). The broker resolves
//! them to short-lived download URLs.

mod broker;

pub use broker::{BrokerError, ResourceBroker};
