//! Transport to vendor chat-completions endpoints.
//!
//! Exposes a uniform tagged event stream ([`UpstreamEvent`]) over either the
//! native dialect or the deployment-scoped one, so the request pipeline never
//! has to branch on which vendor shape it is talking to.

mod client;
mod dialect;
mod event;
mod stream;

pub use client::{UpstreamClientError, shared_client};
pub use dialect::{UpstreamDispatchError, UpstreamTarget, dispatch};
pub use event::UpstreamEvent;
