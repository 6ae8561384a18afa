//! Metered relay pipeline for relaymeter
//!
//! Prices a request, reserves quota, dispatches it through a backend
//! [`Adaptor`], then commits or refunds and reports the outcome to the
//! channel health monitor.

#![allow(clippy::missing_errors_doc, clippy::must_use_candidate)]

mod adaptor;
mod error;
pub mod openai;
mod pipeline;
mod prober;
mod registry;
pub mod tokens;
mod types;

pub use adaptor::{Adaptor, BufferedSink, ByteStream, DiscardSink, RawResponse, ResponseSink};
pub use error::{AdaptorError, RelayError};
pub use openai::OpenAiAdaptor;
pub use pipeline::{RelayOptions, RelayOutcome, RelayPipeline, RelayRequest};
pub use prober::{AdaptorProber, ProbeSettings};
pub use registry::AdaptorRegistry;
pub use types::{ChatMessage, ChatRequest, RelayMode, RequestMeta, Usage};
