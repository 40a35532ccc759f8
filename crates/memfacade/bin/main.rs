mod cmd;
use clap::{Parser, Subcommand};
use cmd::config::ConfigArgs;
use cmd::run::RunArgs;
use eyre::Result;
use memfacade::{default_alloc, DefaultAlloc};

#[global_allocator]
static GLOBAL: DefaultAlloc = default_alloc();

#[derive(Subcommand, Debug)]
pub enum MFSubcommand {
    #[command(about = "Run a multi-threaded allocation workload and print the accounting snapshot")]
    Run(RunArgs),
    #[command(about = "Show the sampling options read from the environment and the guard mechanism in use")]
    Config(ConfigArgs),
}

#[derive(Parser, Debug)]
#[command(
    version,
    about,
    long_about = "memfacade CLI: exercise the instrumented allocator and inspect its accounting"
)]
pub struct MFArgs {
    #[command(subcommand)]
    pub cmd: MFSubcommand,
}

fn main() -> Result<()> {
    init_logging();
    let root_args = MFArgs::parse();

    match root_args.cmd {
        MFSubcommand::Run(args) => {
            args.run(&GLOBAL)?;
        }
        MFSubcommand::Config(args) => {
            args.run()?;
        }
    }

    Ok(())
}

fn init_logging() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("error"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}
