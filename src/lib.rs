pub mod config;
pub mod data;
pub mod enforcement;
pub mod logging;

pub const DAEMON_NAME: &str = "rating_warden";
pub const ENFORCER_TARGET: &str = "rating_warden::enforcer";
pub const ACTION_TARGET: &str = "rating_warden::action";
pub const ERROR_TARGET: &str = "rating_warden::error";
pub const CONSOLE_TARGET: &str = "rating_warden";

pub use config::DaemonConfig;
pub use data::{Data, DataInner};
pub use enforcement::{EnforcementError, EnforcementResult, EnforcementService};
pub type Error = Box<dyn std::error::Error + Send + Sync>;
