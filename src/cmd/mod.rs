//! CLI command implementations.
//!
//! Each submodule owns one `Commands` variant:
//!
//! | Module          | Commands handled                 |
//! |-----------------|----------------------------------|
//! | `up`            | `Up` (also the default)          |
//! | `precheck`      | `Precheck`                       |
//! | `services`      | `Services`                       |
//! | `config`        | `Config`                         |

pub mod config;
pub mod precheck;
pub mod services;
pub mod up;

pub use config::cmd_config;
pub use precheck::cmd_precheck;
pub use services::cmd_services;
pub use up::cmd_up;
