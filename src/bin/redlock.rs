use {
    clap::{Args, Parser, Subcommand},
    redlock_utils::{
        config::{ConfigError, RedlockConfig},
        LockError, LockHandle, Redlock,
    },
    std::{
        io,
        path::PathBuf,
        process::{ExitCode, ExitStatus},
        str::FromStr,
        time::Duration,
    },
    thiserror::Error,
    tokio::{
        process::{Child, Command},
        sync::watch,
        time::Instant,
    },
    tracing::{debug, error, info},
    tracing_subscriber::EnvFilter,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Redlock distributed locks from the command line")]
struct Cli {
    /// Redis URL (eg. redis://localhost:6379/0), repeat for every instance
    #[arg(long = "redis", value_name = "URL", env = "REDLOCK_REDIS", value_delimiter = ',')]
    redis: Vec<String>,

    /// JSON config file, `--redis` overrides its endpoint list
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Show debug log
    #[arg(long)]
    verbose: bool,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Acquire a lock. Use --timeout=0 to try once, --timeout=-1 to retry forever
    Lock(LockArgs),
    /// Release a lock
    Unlock(UnlockArgs),
    /// Run a command while holding a lock
    Run(RunArgs),
}

#[derive(Args, Debug)]
struct LockArgs {
    /// Lock resource name
    #[arg(long)]
    name: String,
    /// Number of milliseconds the lock will be valid, defaults to the configured ttl
    #[arg(long)]
    validity: Option<u64>,
    /// Timeout for acquiring the lock in milliseconds, -1 for infinite
    #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
    timeout: i64,
    /// Milliseconds between retries
    #[arg(long, default_value_t = 200)]
    retry_delay: u64,
    /// Overwrite whatever holds the lock on every attempt
    #[arg(long)]
    force: bool,
}

#[derive(Args, Debug)]
struct UnlockArgs {
    /// Lock resource name
    #[arg(long)]
    name: String,
    /// Key printed by a prior `lock` command
    #[arg(long)]
    key: String,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Lock resource name
    #[arg(long)]
    name: String,
    /// Number of milliseconds the lock will be valid, defaults to the configured ttl
    #[arg(long)]
    validity: Option<u64>,
    /// Milliseconds between retries
    #[arg(long, default_value_t = 200)]
    retry_delay: u64,
    /// Signals sent to stop the command, each followed by a grace period in milliseconds
    #[arg(long, value_name = "SEQUENCE", default_value = "TERM:200,KILL", value_parser = parse_termseq)]
    termseq: TermSeq,
    /// Run the command again once the lock is acquired again
    #[arg(long)]
    restart_cmd: bool,
    /// Command to run
    #[arg(required = true, trailing_var_arg = true, value_name = "CMD")]
    cmd: Vec<String>,
}

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to run command: {0}")]
    Io(#[from] std::io::Error),
}

enum Supervised {
    Exited(i32),
    LostLock(i32),
    Interrupted(i32),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Signal {
    Term,
    Kill,
    Int,
    Hup,
    Quit,
    Usr1,
    Usr2,
}

impl FromStr for Signal {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim().to_ascii_uppercase();
        let signal = match name.strip_prefix("SIG").unwrap_or(&name) {
            "TERM" => Signal::Term,
            "KILL" => Signal::Kill,
            "INT" => Signal::Int,
            "HUP" => Signal::Hup,
            "QUIT" => Signal::Quit,
            "USR1" => Signal::Usr1,
            "USR2" => Signal::Usr2,
            _ => return Err(format!("invalid signal name {s}")),
        };
        Ok(signal)
    }
}

impl Signal {
    #[cfg(unix)]
    fn raw(self) -> libc::c_int {
        match self {
            Signal::Term => libc::SIGTERM,
            Signal::Kill => libc::SIGKILL,
            Signal::Int => libc::SIGINT,
            Signal::Hup => libc::SIGHUP,
            Signal::Quit => libc::SIGQUIT,
            Signal::Usr1 => libc::SIGUSR1,
            Signal::Usr2 => libc::SIGUSR2,
        }
    }

    ///
    /// Delivers the signal to `child`. Anything but `KILL` is a no-op outside unix.
    ///
    fn send(self, child: &mut Child) -> io::Result<()> {
        if self == Signal::Kill {
            return child.start_kill();
        }
        #[cfg(unix)]
        {
            if let Some(pid) = child.id() {
                // SAFETY: kill(2) only reads its two integer arguments.
                if unsafe { libc::kill(pid as libc::pid_t, self.raw()) } != 0 {
                    let err = io::Error::last_os_error();
                    // ESRCH: already gone.
                    if err.raw_os_error() != Some(libc::ESRCH) {
                        return Err(err);
                    }
                }
            }
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct TermStep {
    signal: Signal,
    grace: Duration,
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct TermSeq(Vec<TermStep>);

///
/// Parses `SIG[:MS],SIG[:MS],...`, eg. `TERM:200,KILL`. A missing grace period means 0.
///
fn parse_termseq(s: &str) -> Result<TermSeq, String> {
    let steps = s
        .split(',')
        .map(|item| {
            let (name, grace) = match item.split_once(':') {
                Some((name, ms)) => {
                    let ms = ms
                        .trim()
                        .parse::<u64>()
                        .map_err(|e| format!("invalid grace period in {item}: {e}"))?;
                    (name, Duration::from_millis(ms))
                }
                None => (item, Duration::ZERO),
            };
            Ok(TermStep {
                signal: name.parse()?,
                grace,
            })
        })
        .collect::<Result<Vec<_>, String>>()?;
    Ok(TermSeq(steps))
}

fn exit_code(status: ExitStatus) -> i32 {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    status.code().unwrap_or(1)
}

///
/// Walks `termseq` until the child exits, then kills it outright if it is still around.
///
async fn terminate(child: &mut Child, termseq: &TermSeq) -> io::Result<i32> {
    for step in &termseq.0 {
        if let Some(status) = child.try_wait()? {
            return Ok(exit_code(status));
        }
        debug!(
            "Send signal {:?} to pid {:?}, wait shutdown for {:?}",
            step.signal,
            child.id(),
            step.grace
        );
        step.signal.send(child)?;
        if let Ok(status) = tokio::time::timeout(step.grace, child.wait()).await {
            return Ok(exit_code(status?));
        }
    }
    if let Some(status) = child.try_wait()? {
        return Ok(exit_code(status));
    }
    child.kill().await?;
    Ok(exit_code(child.wait().await?))
}

///
/// Raises the returned flag on SIGINT or SIGTERM.
///
fn listen_for_shutdown() -> io::Result<watch::Receiver<bool>> {
    let (tx, rx) = watch::channel(false);
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut interrupt = signal(SignalKind::interrupt())?;
        let mut terminate = signal(SignalKind::terminate())?;
        tokio::spawn(async move {
            loop {
                let name = tokio::select! {
                    _ = interrupt.recv() => "SIGINT",
                    _ = terminate.recv() => "SIGTERM",
                };
                info!("Received {name}, shutting down");
                if tx.send(true).is_err() {
                    break;
                }
            }
        });
    }
    #[cfg(not(unix))]
    {
        tokio::spawn(async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                info!("Received ctrl-c, shutting down");
                if tx.send(true).is_err() {
                    break;
                }
            }
        });
    }
    Ok(rx)
}

async fn stop_requested(mut stop: watch::Receiver<bool>) {
    let closed = stop.wait_for(|stopped| *stopped).await.is_err();
    if closed {
        std::future::pending::<()>().await;
    }
}

fn is_stopped(stop: &watch::Receiver<bool>) -> bool {
    *stop.borrow()
}

async fn run_lock(redlock: &Redlock, args: LockArgs) -> Result<u8, CliError> {
    let validity = args
        .validity
        .map(Duration::from_millis)
        .unwrap_or_else(|| redlock.config().default_ttl());
    // Negative means no deadline.
    let deadline = u64::try_from(args.timeout)
        .ok()
        .map(|timeout| Instant::now() + Duration::from_millis(timeout));
    let retry_delay = Duration::from_millis(args.retry_delay);
    loop {
        let attempt = if args.force {
            redlock.acquire_forced(&args.name, validity).await
        } else {
            redlock.acquire(&args.name, validity).await
        };
        match attempt {
            Ok(handle) => {
                println!(
                    "Locked name:{}, key:{}, validity:{}",
                    handle.resource(),
                    handle.token(),
                    validity.as_millis()
                );
                return Ok(0);
            }
            Err(e) if e.is_retriable() => {
                if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                    info!("Lock timeout: {e}");
                    return Ok(1);
                }
                debug!("Lock name:{} not acquired: {e}, retrying in {retry_delay:?}", args.name);
                tokio::time::sleep(retry_delay).await;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

async fn run_unlock(redlock: &Redlock, args: UnlockArgs) -> Result<u8, CliError> {
    let handle = LockHandle::detached(args.name, args.key);
    let deleted = redlock.release(&handle).await;
    if deleted >= redlock.quorum() {
        info!("ok");
        Ok(0)
    } else {
        error!(
            "released {} on {deleted}/{} endpoints only",
            handle.resource(),
            redlock.endpoint_count()
        );
        Ok(3)
    }
}

///
/// Polls for the lock until it is granted or a shutdown is requested.
///
async fn acquire_unless_stopped(
    redlock: &Redlock,
    name: &str,
    validity: Duration,
    retry_delay: Duration,
    stop: &watch::Receiver<bool>,
) -> Result<Option<LockHandle>, CliError> {
    loop {
        match redlock
            .acquire_until(name, validity, stop_requested(stop.clone()))
            .await
        {
            Ok(handle) => return Ok(Some(handle)),
            Err(LockError::Cancelled(_)) => return Ok(None),
            Err(e) if e.is_retriable() => {
                debug!("Lock name:{name} not acquired: {e}");
                tokio::select! {
                    _ = tokio::time::sleep(retry_delay) => {}
                    _ = stop_requested(stop.clone()) => return Ok(None),
                }
            }
            Err(e) => return Err(e.into()),
        }
    }
}

///
/// Keeps the lock alive while `child` runs. Extends at half the remaining validity. The child is stopped
/// through `termseq` as soon as an extension fails or a shutdown is requested.
///
async fn supervise(
    redlock: &Redlock,
    mut handle: LockHandle,
    child: &mut Child,
    validity: Duration,
    termseq: &TermSeq,
    stop: &watch::Receiver<bool>,
) -> Result<Supervised, CliError> {
    loop {
        let next_extend = handle.remaining_validity() / 2;
        tokio::select! {
            status = child.wait() => {
                let code = exit_code(status?);
                info!("Process exited with exit code {code}");
                info!("Release lock name:{}, key:{}", handle.resource(), handle.token());
                redlock.release(&handle).await;
                return Ok(Supervised::Exited(code));
            }
            _ = stop_requested(stop.clone()) => {
                info!("Stopping child {:?}", child.id());
                let code = terminate(child, termseq).await?;
                info!("Release lock name:{}, key:{}", handle.resource(), handle.token());
                redlock.release(&handle).await;
                return Ok(Supervised::Interrupted(code));
            }
            _ = tokio::time::sleep(next_extend) => {
                debug!("Extend lock name:{}, key:{}, validity:{validity:?}", handle.resource(), handle.token());
                match redlock.extend(&handle, validity).await {
                    Ok(extended) => handle = extended,
                    Err(e) => {
                        info!("Lost lock name:{}: {e}", handle.resource());
                        let code = terminate(child, termseq).await?;
                        return Ok(Supervised::LostLock(code));
                    }
                }
            }
        }
    }
}

async fn run_command(redlock: &Redlock, args: RunArgs) -> Result<u8, CliError> {
    let stop = listen_for_shutdown()?;
    let validity = args
        .validity
        .map(Duration::from_millis)
        .unwrap_or_else(|| redlock.config().default_ttl());
    let retry_delay = Duration::from_millis(args.retry_delay);
    let (program, rest) = args
        .cmd
        .split_first()
        .ok_or_else(|| LockError::InvalidArgument("missing command".to_string()))?;
    loop {
        debug!("Polling for lock name:{}", args.name);
        let Some(handle) =
            acquire_unless_stopped(redlock, &args.name, validity, retry_delay, &stop).await?
        else {
            info!("Shutdown requested before lock name:{} was acquired", args.name);
            return Ok(130);
        };

        let mut child = match Command::new(program).args(rest).spawn() {
            Ok(child) => child,
            Err(e) => {
                redlock.release(&handle).await;
                return Err(e.into());
            }
        };
        info!("Run [{}] {}", child.id().unwrap_or_default(), args.cmd.join(" "));

        let code = match supervise(redlock, handle, &mut child, validity, &args.termseq, &stop).await? {
            Supervised::Interrupted(code) => return Ok(code as u8),
            Supervised::Exited(code) | Supervised::LostLock(code) => code,
        };
        if !args.restart_cmd || is_stopped(&stop) {
            return Ok(code as u8);
        }
    }
}

async fn run(cli: Cli) -> Result<u8, CliError> {
    let config = load_config(&cli)?;
    debug!("using config {config:?}");
    let redlock = Redlock::connect(config)?;
    match cli.command {
        Cmd::Lock(args) => run_lock(&redlock, args).await,
        Cmd::Unlock(args) => run_unlock(&redlock, args).await,
        Cmd::Run(args) => run_command(&redlock, args).await,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    match run(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!("Error: {e}");
            ExitCode::from(3)
        }
    }
}
