// src/main.rs

use gridflow::{cli, logging, run};

#[tokio::main]
async fn main() {
    let args = match cli::try_parse() {
        Ok(args) => args,
        Err(e) => {
            // Help and version output are not argument errors.
            if e.use_stderr() {
                let _ = e.print();
                std::process::exit(cli::EXIT_ARGUMENT_ERROR);
            }
            let _ = e.print();
            std::process::exit(cli::EXIT_OK);
        }
    };

    if let Err(err) = logging::init_logging(args.log_level) {
        eprintln!("gridflow error: {err:?}");
        std::process::exit(cli::EXIT_ENGINE_ERROR);
    }

    match run(args).await {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("gridflow error: {err:?}");
            std::process::exit(cli::EXIT_ENGINE_ERROR);
        }
    }
}
