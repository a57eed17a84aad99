//! Model backend adapters.
//!
//! A backend adapter translates the pipeline's generic message/option
//! contract into one remote provider's wire format and back. It sits at
//! the innermost position of every pipeline and implements the same
//! [`ChatHandler`](crate::pipeline::ChatHandler) contract as the layers
//! above it.

mod http;

pub use http::HttpBackend;
