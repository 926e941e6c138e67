pub mod maintenance;
pub mod migrate;
pub mod refund;
pub mod serve;

pub use maintenance::handle_maintenance;
pub use migrate::{handle_migrate, run_migrations};
pub use refund::handle_refund;
pub use serve::handle_serve;
