//! Build and smoke-test execution.
//!
//! - `process`: the deadline-aware runner every external command goes through
//! - `build`: runs a recipe's build invocation into the artifact store
//! - `verify`: compiles and runs the smoke test against a built artifact
//! - `resolver`: placeholder values and exported variables for one unit

pub mod build;
pub mod process;
pub mod resolver;
pub mod types;
pub mod verify;

pub use build::{BuildReport, BuildStatus, build};
pub use process::{CommandLine, ProcessExit, ProcessOutput, ProcessSpec, log_excerpt, run_process};
pub use resolver::UnitResolver;
pub use types::{ExecuteConfig, ExecuteError};
pub use verify::{Phase, VerifyReport, VerifyStatus, test_binary_name, verify};
