//! Session providers.
//!
//! Traits for the external dependencies the session controller talks to.
//! The controller depends on these traits; applications supply concrete
//! implementations (an HTTP client for the auth server, typically) and
//! tests use the doubles in [`crate::mocks`].

pub mod authority;

pub use authority::{AuthorityError, SessionAuthority, SessionOwner};
