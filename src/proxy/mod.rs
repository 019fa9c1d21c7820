//! The request-proxying engine.
//!
//! Pipeline per request: sanitize the URI, check the path allow-list, consult
//! the response cache, compose and dispatch the upstream call, inflate and
//! rewrite the body, and store cacheable results. The HTTP edge in
//! `crate::server` is the only caller.

pub mod client;
pub mod service;
pub mod types;
pub mod validation;


pub use service::ProxyService;
pub use types::{ProxyResponse, SanitizedUri};
pub use validation::{is_allowed_path, sanitize_request_uri};
