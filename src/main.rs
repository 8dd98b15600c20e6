use std::{path::PathBuf, time::Duration};

use anyhow::{bail, Context};

const USAGE: &str = "Usage: usvfs-proxy.exe --instance <name> \
                     [--executable <path> [args...]] [--pid <pid>] [--tid <tid>]";

/// How long the coordinating process gets to publish its configuration.
const ATTACH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Default, PartialEq, Eq)]
struct ProxyArgs {
    instance: String,
    executable: Option<PathBuf>,
    args: Vec<String>,
    pid: Option<u32>,
    tid: Option<u32>,
}

fn parse_args(args: impl IntoIterator<Item = String>) -> anyhow::Result<ProxyArgs> {
    let mut parsed = ProxyArgs::default();
    let mut instance = None;
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--instance" => instance = Some(args.next().context("--instance needs a name")?),
            "--executable" => {
                let executable = args.next().context("--executable needs a path")?;
                parsed.executable = Some(PathBuf::from(executable));
                // Everything after the executable belongs to it.
                parsed.args = args.by_ref().collect();
            }
            "--pid" => {
                let pid = args.next().context("--pid needs a process id")?;
                parsed.pid = Some(pid.parse().with_context(|| format!("invalid pid {:?}", pid))?);
            }
            "--tid" => {
                let tid = args.next().context("--tid needs a thread id")?;
                parsed.tid = Some(tid.parse().with_context(|| format!("invalid tid {:?}", tid))?);
            }
            other => bail!("unexpected argument {:?}", other),
        }
    }
    parsed.instance = instance.context("--instance is required")?;
    if parsed.executable.is_none() && parsed.pid.is_none() {
        bail!("either --executable or --pid is required");
    }
    Ok(parsed)
}

#[cfg(windows)]
fn run(args: &ProxyArgs) -> anyhow::Result<()> {
    use usvfs::inject::{self, InjectOptions};

    const HOOK_MODULE: &str = "usvfs.dll";

    let snapshot = usvfs::channel::attach(&args.instance, ATTACH_TIMEOUT)
        .with_context(|| format!("instance {:?} is not available", args.instance))?;
    usvfs::logging::set_log_level(snapshot.parameters.log_level());
    let dll = std::env::current_exe()
        .context("locating the proxy executable")?
        .with_file_name(HOOK_MODULE);
    let options = InjectOptions::for_parameters(dll, &snapshot.parameters);
    if let Some(tid) = args.tid {
        log::debug!("main thread {} is left for the parent to resume", tid);
    }

    match (&args.executable, args.pid) {
        (Some(executable), _) => {
            let process = if snapshot.is_blacklisted(&executable.to_string_lossy()) {
                log::info!("{} is blacklisted, starting it unhooked", executable.display());
                inject::launch_unhooked(executable, &args.args, None)
            } else {
                inject::launch_and_hook(&args.instance, executable, &args.args, None, &options)
            }
            .with_context(|| format!("starting {}", executable.display()))?;
            log::info!("{} runs as process {}", executable.display(), process.pid());
        }
        (None, Some(pid)) => inject::hook_running(&args.instance, pid, &options)
            .with_context(|| format!("hooking process {}", pid))?,
        (None, None) => bail!("nothing to start or hook"),
    }
    Ok(())
}

#[cfg(not(windows))]
fn run(args: &ProxyArgs) -> anyhow::Result<()> {
    usvfs::channel::attach(&args.instance, ATTACH_TIMEOUT)
        .with_context(|| format!("instance {:?} is not available", args.instance))?;
    bail!("process injection is only supported on Windows")
}

fn main() {
    let args = match parse_args(std::env::args().skip(1)) {
        Ok(args) => args,
        Err(e) => {
            eprintln!("{:#}", e);
            eprintln!("{}", USAGE);
            std::process::exit(1);
        }
    };

    usvfs::logging::init_logging(true);
    if let Err(e) = run(&args) {
        log::error!("{:#}", e);
        std::process::exit(1);
    }
}
