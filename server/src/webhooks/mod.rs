//! Webhook Ingestion
//!
//! Authenticates provider deliveries, processes each external delivery at
//! most once per tenant, and announces the result on the event bus.

mod error;
mod handler;
mod pipeline;
mod types;

pub use error::{HandlerError, IngestError};
pub use handler::{AcknowledgeHandler, ForwardingHandler, WebhookHandler};
pub use pipeline::{receive_webhook, IngestPipeline, REQUEST_ID_HEADER};
pub use types::{IngestStatus, WebhookDelivery};
