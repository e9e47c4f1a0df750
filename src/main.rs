use clap::Parser;
use std::sync::atomic::{AtomicBool, Ordering};

mod branches;
mod cli;
mod error;
mod unionfs;

use branches::{parse_branch_spec, validate_branches};
use cli::Args;
use unionfs::MallornFs;

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_signal(_sig: libc::c_int) {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

fn main() {
    match run() {
        Ok(()) => {}
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}

fn run() -> error::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("MALLORN_LOG").unwrap_or_else(|_| "info".to_string()))
        .init();

    let args = Args::parse();

    let config = parse_branch_spec(&args.branches)?;
    validate_branches(&config)?;

    if !args.mountpoint.is_dir() {
        return Err(error::MallornError::Config(format!(
            "Mount point {} is not a directory",
            args.mountpoint.display()
        )));
    }

    let fs = MallornFs::new(config.ro.clone(), config.rw.clone(), args.ttl)?;

    let mut options = vec![fuser::MountOption::FSName("mallorn".to_string())];
    if !args.no_auto_unmount {
        options.push(fuser::MountOption::AutoUnmount);
    }
    if args.allow_other {
        options.push(fuser::MountOption::AllowOther);
    }

    tracing::info!(
        "Mounting union of {} (RO) and {} (RW) at {}",
        config.ro.display(),
        config.rw.display(),
        args.mountpoint.display()
    );

    let session = fuser::Session::new(fs, &args.mountpoint, &options)
        .map_err(|e| error::MallornError::Fuse(format!("Failed to create session: {}", e)))?;
    let background = session
        .spawn()
        .map_err(|e| error::MallornError::Fuse(format!("Failed to spawn session: {}", e)))?;

    install_signal_handlers()?;

    while !SHUTDOWN.load(Ordering::SeqCst) {
        std::thread::sleep(std::time::Duration::from_millis(200));
    }

    tracing::info!("Unmounting {}", args.mountpoint.display());
    drop(background);

    Ok(())
}

fn install_signal_handlers() -> error::Result<()> {
    use nix::sys::signal::{self, SigHandler, Signal};

    let handler = SigHandler::Handler(handle_signal);
    for sig in [Signal::SIGINT, Signal::SIGTERM] {
        // SAFETY: the handler only performs an atomic store.
        unsafe {
            signal::signal(sig, handler).map_err(|e| {
                error::MallornError::Config(format!("Failed to install {} handler: {}", sig, e))
            })?;
        }
    }
    Ok(())
}
