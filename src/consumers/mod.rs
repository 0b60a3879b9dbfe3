//! The unit of work produced by consumers: a received message, the means to settle it
//! with the broker, and a signal telling when processing is over.
//!
//! ```rust,no_run
//! use burrow::consumers::ReceivedData;
//! use burrow::pipeline::Pipeline;
//!
//! async fn process(mut pipeline: Pipeline<ReceivedData, ReceivedData>) -> anyhow::Result<()> {
//!     pipeline.add_async_step(|mut data: ReceivedData| async move {
//!         if data.failed_to_deserialize() {
//!             data.reject_message(false).await;
//!         } else {
//!             data.ack_message().await;
//!         }
//!         data
//!     })?;
//!     pipeline.finalize(|data: ReceivedData| {
//!         let _ = data.complete();
//!     })?;
//!     Ok(())
//! }
//! ```

mod completion;
mod headers;
mod received;

pub use completion::{Completion, CompletionError};
pub use headers::{
    HeaderError, MessageHeaders, COMPRESSED_HEADER, COMPRESSION_HEADER, ENCRYPTED_AT_HEADER,
    ENCRYPTED_HEADER, ENCRYPTION_HEADER, OBJECT_TYPE_HEADER,
};
pub use received::ReceivedData;
