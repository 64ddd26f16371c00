use std::process::ExitCode;

fn main() -> ExitCode {
    match studyscan_lib::run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("studyscan: {e}");
            ExitCode::FAILURE
        }
    }
}
