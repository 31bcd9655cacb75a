// Gateway Infrastructure - HTTP Adapter
// Implements: InferenceClient against the remote inference REST service

mod inference_client;

pub use inference_client::{HttpInferenceClient, AUTH_HEADER};
