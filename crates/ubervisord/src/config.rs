use std::path::PathBuf;

use clap::Parser;

pub const SOCKET_ENV: &str = "UBERVISOR_SOCKET";
pub const RSH_ENV: &str = "UBERVISOR_RSH";

/// Directory under the invoking user's home that holds the socket, log
/// and dump files by default.
const BASE_DIR_NAME: &str = ".uber";

#[derive(Parser, Debug)]
#[command(name = "ubervisord", about = "per-user process supervisor daemon")]
pub struct ServerOptions {
    /// Create a dump after each update and start command.
    #[arg(short = 'a', long = "autodump")]
    pub autodump: bool,

    /// Load a dump from FILE.
    #[arg(short = 'c', long = "config", value_name = "FILE", conflicts_with = "loadlatest")]
    pub config: Option<PathBuf>,

    /// Change to DIR after start.
    #[arg(short = 'd', long = "dir", value_name = "DIR")]
    pub dir: Option<PathBuf>,

    /// Don't fork into the background.
    #[arg(short = 'f', long = "foreground")]
    pub foreground: bool,

    /// Load the most recent dump.
    #[arg(short = 'l', long = "loadlatest")]
    pub loadlatest: bool,

    /// Don't obey the exit command.
    #[arg(short = 'n', long = "noexit")]
    pub noexit: bool,

    /// Write log output to FILE.
    #[arg(short = 'o', long = "logfile", value_name = "FILE")]
    pub logfile: Option<PathBuf>,

    /// Exit silently if the server is already running.
    #[arg(short = 's', long = "silent")]
    pub silent: bool,
}

/// Resolved runtime configuration.
#[derive(Debug)]
pub struct ServerConfig {
    pub socket_path: PathBuf,
    pub log_path: PathBuf,
    /// Directory the server runs (and dumps) in.
    pub work_dir: PathBuf,
    /// The per-user base directory; created when running without `-d`.
    pub base_dir: PathBuf,
    pub create_base: bool,
    pub auto_dump: bool,
    pub allow_exit: bool,
    pub foreground: bool,
    pub silent: bool,
    pub load_dump: Option<PathBuf>,
    pub load_latest: bool,
}

impl ServerConfig {
    pub fn resolve(opts: &ServerOptions) -> Result<ServerConfig, String> {
        let home = home_dir()?;
        let base_dir = home.join(BASE_DIR_NAME);
        let work_dir = opts.dir.clone().unwrap_or_else(|| base_dir.clone());
        let socket_path = std::env::var_os(SOCKET_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| base_dir.join("socket"));
        let log_path = opts
            .logfile
            .clone()
            .unwrap_or_else(|| base_dir.join("log"));
        Ok(ServerConfig {
            socket_path,
            log_path,
            work_dir,
            base_dir,
            create_base: opts.dir.is_none(),
            auto_dump: opts.autodump,
            allow_exit: !opts.noexit,
            foreground: opts.foreground,
            silent: opts.silent,
            load_dump: opts.config.clone(),
            load_latest: opts.loadlatest,
        })
    }
}

fn home_dir() -> Result<PathBuf, String> {
    match nix::unistd::User::from_uid(nix::unistd::geteuid()) {
        Ok(Some(user)) => Ok(user.dir),
        Ok(None) => Err("cannot determine home directory".to_string()),
        Err(e) => Err(format!("getpwuid: {}", e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> ServerOptions {
        ServerOptions::try_parse_from(
            std::iter::once("ubervisord").chain(args.iter().copied()),
        )
        .unwrap()
    }

    #[test]
    fn default_options() {
        let opts = parse(&[]);
        assert!(!opts.autodump);
        assert!(!opts.foreground);
        assert!(!opts.noexit);
        assert!(!opts.silent);
        assert!(opts.config.is_none());
    }

    #[test]
    fn short_flags() {
        let opts = parse(&["-a", "-f", "-n", "-s", "-o", "/tmp/log", "-d", "/tmp"]);
        assert!(opts.autodump);
        assert!(opts.foreground);
        assert!(opts.noexit);
        assert!(opts.silent);
        assert_eq!(opts.logfile.unwrap(), PathBuf::from("/tmp/log"));
        assert_eq!(opts.dir.unwrap(), PathBuf::from("/tmp"));
    }

    #[test]
    fn noexit_long_form_matches_short() {
        // Both spellings must reach the same switch.
        assert!(parse(&["--noexit"]).noexit);
        assert!(parse(&["-n"]).noexit);
    }

    #[test]
    fn config_and_loadlatest_conflict() {
        let res = ServerOptions::try_parse_from(["ubervisord", "-c", "/tmp/d", "-l"]);
        assert!(res.is_err());
    }

    #[test]
    fn resolve_applies_flags() {
        let opts = parse(&["-a", "-n", "-d", "/tmp/work"]);
        let cfg = ServerConfig::resolve(&opts).unwrap();
        assert!(cfg.auto_dump);
        assert!(!cfg.allow_exit);
        assert_eq!(cfg.work_dir, PathBuf::from("/tmp/work"));
        assert!(!cfg.create_base);
        assert!(cfg.socket_path.ends_with(".uber/socket") || cfg.socket_path.is_absolute());
    }

    #[test]
    fn resolve_defaults_under_home() {
        let opts = parse(&[]);
        let cfg = ServerConfig::resolve(&opts).unwrap();
        assert!(cfg.create_base);
        assert_eq!(cfg.work_dir, cfg.base_dir);
        assert_eq!(cfg.log_path, cfg.base_dir.join("log"));
    }
}
