//! Line-mode front end: `ptyssh user@host[:port]`
//!
//! Remote output goes to stdout. Each stdin line answers the pending
//! authentication prompt if there is one, otherwise it is sent to the shell
//! followed by CR.

use std::io::Write;
use std::process::ExitCode;
use std::sync::Arc;

use ptyssh_lib::ssh::LossFn;
use ptyssh_lib::{init_logging, ConnectionConfig, Session};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::Notify;
use tracing::{info, warn};

const PASSWORD_ENV: &str = "PTYSSH_PASSWORD";

fn main() -> ExitCode {
    init_logging();

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("ptyssh: failed to start runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };
    let code = runtime.block_on(run());
    // A blocked stdin read would otherwise hold shutdown open
    runtime.shutdown_background();
    code
}

async fn run() -> ExitCode {
    let Some(target) = std::env::args().nth(1) else {
        eprintln!("usage: ptyssh <user@host[:port]>");
        return ExitCode::from(2);
    };
    let mut config = match parse_target(&target) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("ptyssh: {}", e);
            return ExitCode::from(2);
        }
    };
    config.password = std::env::var(PASSWORD_ENV).ok();

    let lost = Arc::new(Notify::new());
    let loss_signal = lost.clone();
    let session = Arc::new(Session::new(
        config,
        Arc::new(|data: &[u8]| {
            let mut stdout = std::io::stdout().lock();
            let _ = stdout.write_all(data);
            let _ = stdout.flush();
        }),
        Arc::new(LossFn(move || loss_signal.notify_one())),
    ));

    // Started before connect() so keyboard-interactive prompts can be answered
    let mut stdin_task = tokio::spawn(forward_stdin(session.clone()));

    if let Err(e) = session.connect().await {
        eprintln!("ptyssh: {}", e);
        stdin_task.abort();
        return ExitCode::FAILURE;
    }

    let code = tokio::select! {
        _ = lost.notified() => {
            eprintln!("\r\nptyssh: connection lost");
            ExitCode::FAILURE
        }
        _ = &mut stdin_task => {
            info!("stdin closed, disconnecting");
            ExitCode::SUCCESS
        }
    };

    stdin_task.abort();
    session.disconnect().await;
    code
}

async fn forward_stdin(session: Arc<Session>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!("Failed to read stdin: {}", e);
                break;
            }
        };

        if session.is_awaiting_auth_input() {
            session.resolve_auth_prompt(&line);
        } else {
            let mut input = line.into_bytes();
            input.push(b'\r');
            session.send_input(&input).await;
        }
    }
}

/// Parse `user@host[:port]`
///
/// IPv6 hosts are written bare (`admin@fe80::1`, port 22) or bracketed
/// (`admin@[fe80::1]:2222`).
fn parse_target(target: &str) -> Result<ConnectionConfig, String> {
    let (username, rest) = target
        .split_once('@')
        .ok_or_else(|| format!("expected user@host[:port], got '{}'", target))?;

    let (host, port) = if let Some(bracketed) = rest.strip_prefix('[') {
        let (host, after) = bracketed
            .split_once(']')
            .ok_or_else(|| format!("unterminated '[' in '{}'", rest))?;
        match after {
            "" => (host, 22),
            _ => match after.strip_prefix(':') {
                Some(port) => (host, parse_port(port)?),
                None => return Err(format!("unexpected '{}' after ']'", after)),
            },
        }
    } else {
        match rest.split_once(':') {
            // More than one colon: a bare IPv6 address
            Some(_) if rest.matches(':').count() > 1 => (rest, 22),
            Some((host, port)) => (host, parse_port(port)?),
            None => (rest, 22),
        }
    };

    let config = ConnectionConfig::new(host, port, username);
    config.validate().map_err(|e| e.to_string())?;
    Ok(config)
}

fn parse_port(port: &str) -> Result<u16, String> {
    port.parse::<u16>()
        .map_err(|_| format!("invalid port '{}'", port))
}
