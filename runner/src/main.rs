mod cli;
mod logging;
mod run;

use std::process::ExitCode;
use tracing::error;

fn main() -> ExitCode {
    let args = cli::parse();
    logging::init_logging(args.log_level);

    match run::run(args) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(error) => {
            error!(error = %error, "fanout failed");
            eprintln!("fanout error: {error}");
            ExitCode::from(2)
        }
    }
}
