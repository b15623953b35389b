//! Sandbox-side entry point: `codebox-runner <job.json>`.
//!
//! Prints exactly one outcome line on success. Exits with status 2 when the
//! job could not be run at all.

use std::path::PathBuf;
use std::process::ExitCode;

fn main() -> ExitCode {
    let Some(job_path) = std::env::args_os().nth(1).map(PathBuf::from) else {
        eprintln!("usage: codebox-runner <job.json>");
        return ExitCode::from(2);
    };

    match codebox_runtime::run_job_file(&job_path) {
        Ok(line) => {
            println!("{}", line);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("codebox-runner: {}", e);
            ExitCode::from(2)
        }
    }
}
