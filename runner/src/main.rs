use clap::Parser;
use std::{io, path::PathBuf, process::ExitCode};
use thiserror::Error;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use xflow::{
    clients::Clients,
    config::{ConfigErrors, PipelineConfig},
    kernels::FunctionRegistry,
    pipeline::{Pipeline, PipelineError},
    record::Payload,
};

/// Run a pipeline of interface and execution kernels
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// YAML pipeline definition
    pipeline: PathBuf,

    /// YAML file with the input record(s), replaces `inputs` of the definition
    #[arg(short, long)]
    inputs: Option<PathBuf>,

    /// only print the commands that would run
    #[arg(long)]
    dryrun: bool,

    /// number of worker threads for the local client
    #[arg(short, long)]
    threads: Option<u64>,

    #[arg(short, long)]
    verbose: bool,
}

#[derive(Error, Debug)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigErrors),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error("Failed to write results: {0}")]
    Output(#[from] serde_yaml::Error),
    #[error("Preflight checks failed")]
    Preflight,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if args.verbose { "debug" } else { "info" })
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    match run(&args) {
        Ok(output) => {
            let failed = output.failed().count();
            if failed > 0 {
                warn!("{failed} of {} records failed", output.records().len());
                ExitCode::from(1)
            } else {
                ExitCode::SUCCESS
            }
        }
        Err(e) => {
            error!("{e}");
            ExitCode::from(2)
        }
    }
}

fn run(args: &Args) -> Result<Payload, CliError> {
    let mut config = PipelineConfig::load(&args.pipeline)?;

    if let Some(threads) = args.threads {
        config
            .client
            .parameter
            .get_or_insert_with(Default::default)
            .insert("threads".to_string(), serde_yaml::Value::Number(threads.into()));
    }

    if config.preflight_checks() {
        return Err(CliError::Preflight);
    }

    let inputs = match &args.inputs {
        Some(path) => {
            let source = std::fs::read_to_string(path).map_err(|source| ConfigErrors::Read {
                path: path.clone(),
                source,
            })?;
            serde_yaml::from_str(&source).map_err(ConfigErrors::from)?
        }
        None => config.inputs.clone().unwrap_or_default(),
    };

    let (pipeline, session): (Pipeline<Clients>, _) = config.build(&FunctionRegistry::new())?;
    info!("Running pipeline {} in session {}", args.pipeline.to_string_lossy(), session.id());

    let output = if args.dryrun {
        pipeline.dryrun(inputs, &mut io::stdout().lock())?
    } else {
        let output = pipeline.run(inputs)?;
        serde_yaml::to_writer(io::stdout().lock(), &output)?;
        output
    };

    // the handles in `output` keep their own files alive until they are dropped
    if let Err(e) = session.purge() {
        warn!("Failed to clean up session files: {e}");
    }

    Ok(output)
}
