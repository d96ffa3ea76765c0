pub mod config;
pub mod directory;
pub mod error;
pub mod filter;
pub mod ldap_handler;
pub mod ldap_protocol;
pub mod metrics;
pub mod server;

pub use config::Config;
pub use directory::Directory;
pub use error::LdapError;
pub use filter::Filter;
pub use ldap_handler::LdapHandler;
pub use metrics::{run_metrics_server, Metrics};
pub use server::{LdapServer, ServerHandle};
