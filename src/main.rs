use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use spawn_core::capability::builtin::secret_resolver;
use spawn_core::capability::secrets;
use spawn_core::config::Config;
use spawn_core::sandbox::{BackendRuntime, Command, Runtime, RuntimeKind};

fn print_help() {
    println!(
        "\
spawn-sandbox v{}

Runs one command in a fresh sandbox and exits with its exit code.

USAGE:
    spawn-sandbox [OPTIONS] -- COMMAND [ARGS...]

OPTIONS:
    -c, --config PATH      TOML configuration file [default: built-in defaults]
    -t, --timeout SECS     Command timeout in seconds
    -r, --runtime KIND     native, gvisor, firecracker or docker
                           [default: sandbox.runtime from the config]
    -h, --help             Print this help message and exit
    -V, --version          Print version and exit

ENVIRONMENT VARIABLES:
    Variables are referenced in the config file via ${{VAR_NAME}} syntax.

    RUST_LOG       Log level filter for tracing
                   (e.g. debug, spawn_core=debug,warn)
    VAULT_TOKEN    Vault token when [secrets.vault] sets none

EXAMPLES:
    spawn-sandbox -r native -- echo hello
    spawn-sandbox --config spawn.toml --timeout 5 -- sh -c 'sleep 10'
    RUST_LOG=debug spawn-sandbox -r native -- uname -a",
        env!("CARGO_PKG_VERSION"),
    );
}

#[derive(Debug, Default, PartialEq)]
struct RunArgs {
    config: Option<String>,
    timeout: Option<Duration>,
    runtime: Option<RuntimeKind>,
    command: Vec<String>,
}

#[derive(Debug, PartialEq)]
enum Invocation {
    Help,
    Version,
    Run(RunArgs),
}

fn parse_args<I>(args: I) -> Result<Invocation>
where
    I: IntoIterator<Item = String>,
{
    let mut run = RunArgs::default();
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--help" | "-h" => return Ok(Invocation::Help),
            "--version" | "-V" => return Ok(Invocation::Version),
            "--config" | "-c" => {
                run.config = Some(args.next().ok_or_else(|| anyhow!("{arg} needs a path"))?);
            }
            "--timeout" | "-t" => {
                let value = args.next().ok_or_else(|| anyhow!("{arg} needs a value"))?;
                let secs: u64 = value
                    .parse()
                    .map_err(|_| anyhow!("invalid timeout '{value}'"))?;
                if secs == 0 {
                    bail!("timeout must be greater than zero");
                }
                run.timeout = Some(Duration::from_secs(secs));
            }
            "--runtime" | "-r" => {
                let value = args.next().ok_or_else(|| anyhow!("{arg} needs a value"))?;
                run.runtime = Some(value.parse()?);
            }
            "--" => {
                run.command.extend(args.by_ref());
            }
            other if other.starts_with('-') && run.command.is_empty() => {
                bail!("unknown option '{other}' (see --help)");
            }
            _ => {
                run.command.push(arg);
                run.command.extend(args.by_ref());
            }
        }
    }
    if run.command.is_empty() {
        bail!("no command given (see --help)");
    }
    Ok(Invocation::Run(run))
}

#[tokio::main]
async fn main() -> Result<()> {
    let run = match parse_args(std::env::args().skip(1))? {
        Invocation::Help => {
            print_help();
            return Ok(());
        }
        Invocation::Version => {
            println!("spawn-sandbox v{}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        Invocation::Run(run) => run,
    };

    // Initialize logging (RUST_LOG=debug for debug mode)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("spawn_core=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut config = match &run.config {
        Some(path) => {
            info!("Loading configuration from {path}");
            Config::load(path)?
        }
        None => Config::default(),
    };
    if let Some(kind) = run.runtime {
        config.sandbox.runtime = kind;
    }

    if !config.secrets.inject.is_empty() {
        let resolver = secret_resolver(&config)?;
        let env = secrets::inject(&resolver, &config.secrets.inject).await?;
        info!(
            "Injected secrets: {}",
            env.keys().cloned().collect::<Vec<_>>().join(", ")
        );
        config.sandbox.env.extend(env);
    }

    let runtime = BackendRuntime::from_config(&config.runtimes, config.sandbox.runtime);
    if let Err(e) = runtime.health_check().await {
        warn!("Runtime health check failed: {e}");
    }

    let sandbox = runtime.create(config.sandbox.clone()).await?;
    sandbox.start().await?;

    let mut command = Command::new(run.command[0].as_str()).args(run.command[1..].iter().cloned());
    command.timeout = run.timeout;
    let outcome = sandbox.exec(&command).await;
    sandbox.destroy().await?;
    runtime.reap();

    let result = outcome?;
    print!("{}", result.stdout);
    eprint!("{}", result.stderr);
    if result.timed_out {
        warn!("Command timed out after {:?}", result.duration);
    }
    info!(
        "Command exited with status {} in {}ms",
        result.exit_code,
        result.duration.as_millis()
    );
    std::process::exit(result.exit_code);
}
