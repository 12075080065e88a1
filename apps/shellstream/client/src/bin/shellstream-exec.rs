use anyhow::{Context, Result};
use clap::Parser;
use crossterm::terminal::{self, disable_raw_mode, enable_raw_mode};
use shellstream_client::{Executor, ExecutorConfig, ProtocolVariant, StreamIo, TerminalSize};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "shellstream-exec",
    author,
    version,
    about = "Attach the local terminal to a shellstream exec URL"
)]
struct Cli {
    /// Exec URL handed out by the server, e.g. ws://127.0.0.1:10010/exec/<token>.
    url: String,

    /// Stream protocol to offer; repeat to offer several, most preferred first.
    #[arg(long = "protocol", env = "SHELLSTREAM_PROTOCOLS", value_delimiter = ',')]
    protocols: Vec<ProtocolVariant>,

    /// The remote command runs in a terminal.
    #[arg(long)]
    tty: bool,

    /// Do not forward local stdin.
    #[arg(long)]
    no_stdin: bool,
}

struct RawModeGuard(bool);

impl RawModeGuard {
    fn new(enable: bool) -> Self {
        if !enable {
            return Self(false);
        }
        match enable_raw_mode() {
            Ok(()) => Self(true),
            Err(err) => {
                warn!(error = %err, "failed to enable raw mode");
                Self(false)
            }
        }
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if self.0 {
            let _ = disable_raw_mode();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let code = run(cli).await?;
    // Local stdin is read on a blocking thread the runtime cannot cancel.
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<i32> {
    let mut config = ExecutorConfig::default();
    if !cli.protocols.is_empty() {
        config.protocols = cli.protocols;
    }
    let executor = Executor::new(cli.url, config);

    let (resize_tx, resize_rx) = mpsc::unbounded_channel();
    if cli.tty {
        match terminal::size() {
            Ok((cols, rows)) => {
                let _ = resize_tx.send(TerminalSize::new(rows, cols));
            }
            Err(err) => debug!(error = %err, "local terminal size unavailable"),
        }
    }

    let io = StreamIo {
        stdin: (!cli.no_stdin).then(|| Box::new(tokio::io::stdin()) as _),
        stdout: Some(Box::new(tokio::io::stdout())),
        stderr: (!cli.tty).then(|| Box::new(tokio::io::stderr()) as _),
        tty: cli.tty,
        resize: Some(resize_rx),
    };

    let outcome = {
        let _raw = RawModeGuard::new(cli.tty);
        executor
            .stream(io)
            .await
            .with_context(|| format!("exec session at {} failed", executor.url()))?
    };
    if !outcome.is_success() {
        eprintln!("{outcome}");
    }
    Ok(outcome.exit_code())
}
