//! Concrete collaborators: AWS services, an HTTP webhook channel and an in-process warehouse.

#[cfg(feature = "aws")]
pub mod aws;
pub mod local;
pub mod webhook;

pub use local::{read_source_fixture, LocalWarehouse, RecordingChannel};
pub use webhook::{BackoffPolicy, WebhookChannel};

pub const CRATE_NAME: &str = "autoprice-adapters";
