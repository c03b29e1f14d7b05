//! Central identity, authorization, and session management.
//! Keep the public surface thin and split implementation across sub-modules.

mod principal;
mod session;
mod provider;
mod authorizer;

pub use principal::Principal;
pub use session::{AuthEvent, Session, SessionManager, SessionToken};
pub use provider::{AuthProvider, LocalAuthProvider, SignInRequest, SignInResponse};
pub use authorizer::{can, Action, Role};
