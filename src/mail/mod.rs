//! Mailbox accounts, envelopes, and the provider adapter seam.

pub mod parse;
pub mod provider;
pub mod types;

pub use parse::envelope_from_rfc822;
pub use provider::{MailProvider, ProviderRegistry};
pub use types::{Account, Attachment, EmailEnvelope, FetchOptions, TokenGrant};
