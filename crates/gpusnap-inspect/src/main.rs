//! gpusnap-inspect - print a JSON summary of a capture file
//!
//! Usage: `gpusnap-inspect <capture> [--pretty]`

use std::path::PathBuf;
use std::process::ExitCode;

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let mut path: Option<PathBuf> = None;
    let mut pretty = false;
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--pretty" => pretty = true,
            "-h" | "--help" => {
                println!("Usage: gpusnap-inspect <capture> [--pretty]");
                return ExitCode::SUCCESS;
            }
            _ if path.is_none() => path = Some(PathBuf::from(arg)),
            _ => {
                eprintln!("Unexpected argument: {}", arg);
                return ExitCode::from(2);
            }
        }
    }
    let Some(path) = path else {
        eprintln!("Usage: gpusnap-inspect <capture> [--pretty]");
        return ExitCode::from(2);
    };

    let report = match gpusnap_inspect::inspect_file(&path) {
        Ok(report) => report,
        Err(e) => {
            eprintln!("{}: {}", path.display(), e);
            return ExitCode::FAILURE;
        }
    };
    log::info!("{} chunks at version {:#x}", report.chunk_count, report.version);

    let json = if pretty {
        serde_json::to_string_pretty(&report)
    } else {
        serde_json::to_string(&report)
    };
    match json {
        Ok(json) => {
            println!("{}", json);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Failed to encode report: {}", e);
            ExitCode::FAILURE
        }
    }
}
