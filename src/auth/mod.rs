//! Session and role resolution for ACL checks.
//!
//! [`SessionResolver`] sits in front of an [`IdentityStore`] with two
//! TTL caches (session token → user, user → role names) and answers the
//! per-delivery question "may this client read this object".

pub mod identity_store;
pub mod postgres;
pub mod session_resolver;

pub use identity_store::{IdentityStore, InMemoryIdentityStore, RoleRef};
pub use postgres::PostgresIdentityStore;
pub use session_resolver::{AccessContext, SessionResolver, SessionState};
