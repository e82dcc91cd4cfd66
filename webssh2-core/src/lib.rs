mod db;
mod ephemeral;
mod hostkeys;
mod services;
pub mod eventbus;
pub mod logging;
pub mod sessions;

pub use db::connect_to_db;
pub use ephemeral::EphemeralStore;
pub use hostkeys::{HostKeyCheck, HostKeyStore, SessionHostKeys};
pub use services::{get_global_services, reset_global_services, set_global_services, Services};
