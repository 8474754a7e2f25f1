pub mod server;
pub mod server_authorization;

pub use self::server::{Server, ServerSpec};
pub use self::server_authorization::{ServerAuthorization, ServerAuthorizationSpec};
