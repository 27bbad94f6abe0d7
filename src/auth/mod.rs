//! Authentication and authorization
//!
//! - `tokens`: token records, permissions, credential hashing
//! - `validator`: resolves a presented token value into an admitted record
//! - `grants`: channel subscribe/publish and system command decisions
//!
//! Permissions:
//! - `read`: Receive events from allowed channels
//! - `write`: Publish events on allowed channels
//! - `admin`: Everything, including system commands
//! - `system_control`: System commands only

mod grants;
mod tokens;
mod validator;

pub use grants::ChannelAuthorizer;
pub use tokens::{
    generate_token_value, hash_token_value, token_prefix, Permission, RateLimitPolicy,
    TokenError, TokenRecord, TokenRecordBuilder, TOKEN_PREFIX,
};
pub use validator::{check_record, domain_matches, normalize_domain, ClientInfo, TokenValidator};
