//! CLI command implementations.
//!
//! | Module     | Commands handled      |
//! |------------|-----------------------|
//! | `validate` | `Validate`            |
//! | `run`      | `Run`                 |
//! | `review`   | gavel prompts for `Run` |
//! | `inspect`  | `Inspect`, `Export`   |
//! | `config`   | `Config`              |

pub mod config;
pub mod inspect;
pub mod review;
pub mod run;
pub mod validate;

pub use config::cmd_config;
pub use inspect::{cmd_export, cmd_inspect};
pub use run::{RunRequest, cmd_run};
pub use validate::cmd_validate;
