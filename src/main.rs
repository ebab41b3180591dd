use std::process::ExitCode;

use clap::Parser;

use oxn::Engine;
use oxn::cli::{Cli, initialize_logging};

#[tokio::main]
async fn main() -> ExitCode {
    let args = Cli::parse();
    if let Err(error) = initialize_logging(args.loglevel, args.logfile.as_ref()) {
        eprintln!("cannot initialize logging: {error}");
        return ExitCode::FAILURE;
    }

    let mut engine = Engine::new(&args.spec, args.report.clone());

    if let Err(error) = engine.read_experiment_specification() {
        tracing::error!("{error}");
        return ExitCode::FAILURE;
    }
    if let Err(error) = engine.validate_syntax() {
        tracing::error!("{error}");
        return ExitCode::FAILURE;
    }
    if let Err(error) = engine
        .run(args.times, args.timeout, args.randomize, args.accounting)
        .await
    {
        tracing::error!("{error}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
