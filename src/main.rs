use clap::Parser as _;
use plant_control_tools::commands;
use tracing_subscriber::{layer::SubscriberExt as _, util::SubscriberInitExt as _};

#[derive(clap::Parser)]
#[clap(version, about, author)]
enum Commands {
    Tags(commands::tags::Args),
    Check(commands::check::Args),
    Read(commands::read::Args),
    Write(commands::write::Args),
    Procedure(commands::procedure::Args),
    Health(commands::health::Args),
    Simulate(commands::simulate::Args),
}

#[derive(thiserror::Error, Debug)]
enum Error {
    #[error("could not parse the PLANT_CONTROL_LOG filter")]
    LogFilter(#[source] tracing_subscriber::filter::ParseError),
    #[error("could not start the async runtime")]
    Runtime(#[source] std::io::Error),
}

fn end<E: std::error::Error>(r: Result<(), E>) -> ! {
    std::process::exit(match r {
        Ok(_) => 0,
        Err(e) => {
            eprintln!("error: {e}");
            let mut cause = e.source();
            while let Some(e) = cause {
                eprintln!("  because: {e}");
                cause = e.source();
            }
            1
        }
    });
}

fn block_on<F: std::future::Future>(future: F) -> F::Output {
    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => end(Err(Error::Runtime(e))),
    };
    runtime.block_on(future)
}

fn main() {
    let filter_description =
        std::env::var("PLANT_CONTROL_LOG").unwrap_or_else(|_| "warn".to_string());
    let filter = match filter_description.parse::<tracing_subscriber::filter::targets::Targets>() {
        Ok(filter) => filter,
        Err(e) => end(Err(Error::LogFilter(e))),
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
    match Commands::parse() {
        Commands::Tags(args) => end(commands::tags::run(args)),
        Commands::Check(args) => end(commands::check::run(args)),
        Commands::Read(args) => end(block_on(commands::read::run(args))),
        Commands::Write(args) => end(block_on(commands::write::run(args))),
        Commands::Procedure(args) => end(block_on(commands::procedure::run(args))),
        Commands::Health(args) => end(block_on(commands::health::run(args))),
        Commands::Simulate(args) => end(block_on(commands::simulate::run(args))),
    }
}
