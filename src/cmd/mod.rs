//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module     | Commands handled                 |
//! |------------|----------------------------------|
//! | `project`  | `Init`                           |
//! | `course`   | `Ingest`, `Status`               |
//! | `run`      | `Run`, `Claim`, `Finalize`       |
//! | `config`   | `Config`                         |

pub mod config;
pub mod course;
pub mod project;
pub mod run;

pub use config::cmd_config;
pub use course::{cmd_ingest, cmd_status};
pub use project::cmd_init;
pub use run::{cmd_claim, cmd_finalize, cmd_run};

use anyhow::{Result, bail};
use lectern::config::LecternConfig;
use lectern::store::DbHandle;

/// Open the project database, refusing to create one outside `lectern init`.
pub(crate) fn open_db(config: &LecternConfig) -> Result<DbHandle> {
    if !config.is_initialized() {
        bail!(
            "No lectern project at {}. Run 'lectern init' first.",
            config.project_dir.display()
        );
    }
    DbHandle::open(&config.db_path())
}
