//! Length-prefixed echo server over the squall reactors.
//!
//! Usage:
//!   squall-echo <ip> <port> [options]
//!
//! Options:
//!   --tls <cert.pem> <key.pem>   terminate TLS
//!   --workers <n>                multi-reactor with n workers
//!   --uring                      completion reactor (TCP only)
//!   --backlog <n>                listen backlog
//!   --pool <n>                   connection event pool size
//!   --buf-entries <n>            io_uring buffer group entries (power of two)
//!   --buf-size <n>               io_uring buffer size in bytes
//!
//! Exits 0 on orderly stop, 2 on configuration errors, 3 on
//! initialisation errors, 1 on runtime failure.

use squall::{
    Error, MultiConfig, MultiReactor, Reactor, ReactorConfig, Reflect, TcpPeer, TlsPeer,
    TlsSettings,
};
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

struct Args {
    ip: String,
    port: u16,
    tls: Option<TlsSettings>,
    workers: usize,
    uring: bool,
    backlog: Option<i32>,
    pool: Option<usize>,
    buf_entries: Option<u16>,
    buf_size: Option<usize>,
}

fn parse_args() -> Result<Args, Error> {
    let mut args = std::env::args().skip(1);
    let ip = args
        .next()
        .ok_or_else(|| Error::config("usage: squall-echo <ip> <port> [options]"))?;
    let port: u16 = args
        .next()
        .ok_or_else(|| Error::config("missing port"))?
        .parse()
        .map_err(|_| Error::config("port must be 0-65535"))?;

    let mut parsed = Args {
        ip,
        port,
        tls: None,
        workers: 1,
        uring: false,
        backlog: None,
        pool: None,
        buf_entries: None,
        buf_size: None,
    };
    while let Some(flag) = args.next() {
        match flag.as_str() {
            "--tls" => {
                let cert = args.next().ok_or_else(|| Error::config("--tls needs <cert> <key>"))?;
                let key = args.next().ok_or_else(|| Error::config("--tls needs <cert> <key>"))?;
                parsed.tls = Some(TlsSettings::new(cert, key));
            }
            "--workers" => {
                parsed.workers = args
                    .next()
                    .and_then(|v| v.parse().ok())
                    .ok_or_else(|| Error::config("--workers needs a number"))?;
            }
            "--uring" => parsed.uring = true,
            "--backlog" => {
                parsed.backlog = Some(
                    args.next()
                        .and_then(|v| v.parse().ok())
                        .ok_or_else(|| Error::config("--backlog needs a number"))?,
                );
            }
            "--pool" => {
                parsed.pool = Some(
                    args.next()
                        .and_then(|v| v.parse().ok())
                        .ok_or_else(|| Error::config("--pool needs a number"))?,
                );
            }
            "--buf-entries" => {
                parsed.buf_entries = Some(
                    args.next()
                        .and_then(|v| v.parse().ok())
                        .ok_or_else(|| Error::config("--buf-entries needs a number"))?,
                );
            }
            "--buf-size" => {
                parsed.buf_size = Some(
                    args.next()
                        .and_then(|v| v.parse().ok())
                        .ok_or_else(|| Error::config("--buf-size needs a number"))?,
                );
            }
            other => return Err(Error::config(format!("unknown option: {other}"))),
        }
    }
    Ok(parsed)
}

fn serve(args: Args) -> squall::Result<()> {
    let mut cfg = ReactorConfig::default();
    if let Some(backlog) = args.backlog {
        cfg.backlog = backlog;
    }
    if let Some(pool) = args.pool {
        cfg.event_pool = pool;
    }

    if args.uring {
        if args.tls.is_some() {
            return Err(Error::config("--uring supports plain TCP only"));
        }
        if args.workers > 1 {
            return Err(Error::config("--uring runs a single reactor"));
        }
        #[cfg(feature = "io-uring")]
        {
            let mut cfg = squall::UringConfig::default();
            if let Some(backlog) = args.backlog {
                cfg.backlog = backlog;
            }
            if let Some(pool) = args.pool {
                cfg.conn_pool = pool;
            }
            if let Some(entries) = args.buf_entries {
                cfg.buf_entries = entries;
            }
            if let Some(size) = args.buf_size {
                cfg.buf_size = size;
            }
            let mut reactor =
                squall::UringReactor::bind(&args.ip, args.port, Reflect, cfg)?;
            info!(addr = ?reactor.local_addr()?, "serving (io_uring)");
            return reactor.run();
        }
        #[cfg(not(feature = "io-uring"))]
        return Err(Error::config("built without io-uring support"));
    }

    match (&args.tls, args.workers) {
        (None, 1) => {
            let peer = TcpPeer::listen(&args.ip, args.port, &cfg)?;
            let mut reactor = Reactor::serve(peer, Reflect, cfg)?;
            info!(addr = ?reactor.local_addr(), "serving (tcp)");
            reactor.run()
        }
        (Some(tls), 1) => {
            let peer = TlsPeer::listen(&args.ip, args.port, tls, &cfg)?;
            let mut reactor = Reactor::serve(peer, Reflect, cfg)?;
            info!(addr = ?reactor.local_addr(), "serving (tls)");
            reactor.run()
        }
        (None, workers) => {
            let multi_cfg = MultiConfig {
                workers,
                reactor: cfg.clone(),
                ..Default::default()
            };
            let peer = TcpPeer::listen(&args.ip, args.port, &cfg)?;
            let multi = MultiReactor::new(peer, Reflect, multi_cfg)?;
            info!(addr = ?multi.local_addr()?, workers, "serving (tcp, multi)");
            multi.run()
        }
        (Some(tls), workers) => {
            let multi_cfg = MultiConfig {
                workers,
                reactor: cfg.clone(),
                ..Default::default()
            };
            let peer = TlsPeer::listen(&args.ip, args.port, tls, &cfg)?;
            let multi = MultiReactor::new(peer, Reflect, multi_cfg)?;
            info!(addr = ?multi.local_addr()?, workers, "serving (tls, multi)");
            multi.run()
        }
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = match parse_args() {
        Ok(args) => args,
        Err(e) => {
            error!("{e}");
            return ExitCode::from(2);
        }
    };
    match serve(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(category = e.category(), "{e}");
            match e {
                Error::Config { .. } => ExitCode::from(2),
                Error::Setup { .. } | Error::Tls { .. } | Error::Reactor { .. } => ExitCode::from(3),
                _ => ExitCode::from(1),
            }
        }
    }
}
