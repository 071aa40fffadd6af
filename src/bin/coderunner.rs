use anyhow::Result;
use std::process::ExitCode;

fn main() -> Result<ExitCode> {
    coderunner::cli::run()
}
