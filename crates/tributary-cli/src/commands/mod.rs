mod health;
mod init;
mod run;
mod setup;
mod status;
mod sync;
mod teardown;

pub use health::cmd_health;
pub use init::cmd_init;
pub use run::cmd_run;
pub use setup::cmd_setup;
pub use status::cmd_status;
pub use sync::cmd_sync;
pub use teardown::cmd_teardown;
