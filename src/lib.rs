pub mod config;
pub mod errors;
pub mod log_buffer;
pub mod logging;
pub mod orchestrator;
pub mod precheck;
pub mod readiness;
pub mod state;
pub mod supervisor;
pub mod ui;
