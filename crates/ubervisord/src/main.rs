mod bus;
mod catalog;
mod config;
mod dump;
mod handlers;
mod process;
mod server;
mod supervisor;

use std::io::{Read, Write};
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::warn;

use ubervisor_proto::frame;

use crate::bus::Bus;
use crate::config::{ServerConfig, ServerOptions, RSH_ENV};
use crate::dump::Dumper;
use crate::server::Server;
use crate::supervisor::Supervisor;

fn main() -> ExitCode {
    let opts = ServerOptions::parse();
    run(&opts)
}

fn run(opts: &ServerOptions) -> ExitCode {
    // The rsh indirection is a client-side feature; a server started with
    // it set would never be reachable over the real socket.
    if std::env::var_os(RSH_ENV).is_some() {
        eprintln!("unsetting {}.", RSH_ENV);
        std::env::remove_var(RSH_ENV);
    }

    let cfg = match ServerConfig::resolve(opts) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("ubervisord: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if probe_server(&cfg.socket_path) {
        if !cfg.silent {
            eprintln!("server running?");
        }
        return ExitCode::FAILURE;
    }

    if cfg.create_base && !cfg.base_dir.exists() {
        use std::os::unix::fs::DirBuilderExt;
        if let Err(e) = std::fs::DirBuilder::new().mode(0o700).create(&cfg.base_dir) {
            eprintln!("ubervisord: mkdir {}: {}", cfg.base_dir.display(), e);
            return ExitCode::FAILURE;
        }
    }
    println!("chdir to: {}", cfg.work_dir.display());
    if let Err(e) = std::env::set_current_dir(&cfg.work_dir) {
        eprintln!("ubervisord: chdir {}: {}", cfg.work_dir.display(), e);
        return ExitCode::FAILURE;
    }

    // Fail on an unusable logfile or dump before going to the background.
    if !cfg.foreground {
        if let Err(e) = std::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(&cfg.log_path)
        {
            eprintln!("ubervisord: logfile {}: {}", cfg.log_path.display(), e);
            return ExitCode::FAILURE;
        }
        println!("logfile: {}", cfg.log_path.display());
    }
    if let Some(path) = &cfg.load_dump {
        if let Err(e) = std::fs::File::open(path) {
            eprintln!("ubervisord: dump {}: {}", path.display(), e);
            return ExitCode::FAILURE;
        }
    }

    // The probe above answered dead, so a leftover socket file is stale.
    let _ = std::fs::remove_file(&cfg.socket_path);
    let listener = match std::os::unix::net::UnixListener::bind(&cfg.socket_path) {
        Ok(listener) => listener,
        Err(e) => {
            eprintln!("ubervisord: bind {}: {}", cfg.socket_path.display(), e);
            return ExitCode::FAILURE;
        }
    };
    println!("socket: {}", cfg.socket_path.display());

    // SAFETY: installing SIG_IGN is always valid.
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }

    // Daemonize before the runtime exists; forking afterwards would lose
    // its worker state.
    if !cfg.foreground {
        if let Err(e) = nix::unistd::daemon(true, true) {
            eprintln!("ubervisord: daemon: {}", e);
            return ExitCode::FAILURE;
        }
    }

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("ubervisord: runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };
    runtime.block_on(serve(cfg, listener))
}

async fn serve(cfg: ServerConfig, std_listener: std::os::unix::net::UnixListener) -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let sink: Box<dyn Write + Send> = if cfg.foreground {
        Box::new(std::io::stdout())
    } else {
        match std::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(&cfg.log_path)
        {
            Ok(file) => Box::new(file),
            Err(e) => {
                eprintln!("ubervisord: logfile {}: {}", cfg.log_path.display(), e);
                return ExitCode::FAILURE;
            }
        }
    };
    let bus = Bus::new(sink);

    let (sup, exit_rx) = Supervisor::new(bus.clone());
    tokio::spawn(supervisor::run_exit_pump(Arc::clone(&sup), exit_rx));

    // Restoring a dump spawns the children of running groups, so this
    // happens only once the supervision machinery is up.
    if let Some(path) = &cfg.load_dump {
        if let Err(e) = dump::load(&sup, path).await {
            eprintln!("ubervisord: load {}: {}", path.display(), e);
            return ExitCode::FAILURE;
        }
    }
    if cfg.load_latest {
        match dump::find_newest(Path::new(".")) {
            Ok(Some(path)) => {
                println!("loading dump from {}", path.display());
                if let Err(e) = dump::load(&sup, &path).await {
                    eprintln!("ubervisord: load {}: {}", path.display(), e);
                    return ExitCode::FAILURE;
                }
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "dump scan failed"),
        }
    }

    if let Err(e) = std_listener.set_nonblocking(true) {
        eprintln!("ubervisord: listener: {}", e);
        return ExitCode::FAILURE;
    }
    let listener = match tokio::net::UnixListener::from_std(std_listener) {
        Ok(listener) => listener,
        Err(e) => {
            eprintln!("ubervisord: listener: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let server = Server::new(
        sup,
        bus.clone(),
        Dumper::new(".".into()),
        cfg.auto_dump,
        cfg.allow_exit,
    );
    bus.log("server started.");

    tokio::select! {
        result = Arc::clone(&server).run(listener) => {
            match result {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    eprintln!("ubervisord: accept: {}", e);
                    ExitCode::FAILURE
                }
            }
        }
        _ = server.shutdown.notified() => {
            // Let connection writers flush their last replies.
            tokio::time::sleep(Duration::from_millis(200)).await;
            ExitCode::SUCCESS
        }
    }
}

/// Ask a possibly-running server for signs of life: connect, send HELO,
/// wait briefly for any reply bytes.
fn probe_server(path: &Path) -> bool {
    let Ok(mut stream) = std::os::unix::net::UnixStream::connect(path) else {
        return false;
    };
    let _ = stream.set_read_timeout(Some(Duration::from_secs(2)));
    let _ = stream.set_write_timeout(Some(Duration::from_secs(2)));
    if stream
        .write_all(&frame::encode_message(1, b"HELO"))
        .is_err()
    {
        return false;
    }
    let mut buf = [0u8; 4];
    stream.read_exact(&mut buf).is_ok()
}
