use std::io::{self, Write};
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use crate::error::{GophorError, Result};
use crate::http::HeaderStripWriter;
use crate::request::{Request, Responder};

fn kv(key: &str, value: &str) -> (String, String) {
    (key.to_string(), value.to_string())
}

/// The constant half of the CGI/1.1 environment, built once at startup.
pub fn initial_cgi_env(
    safe_path: &str,
    charset: &str,
    page_width: usize,
) -> Vec<(String, String)> {
    vec![
        /* RFC 3875 standard */
        kv("GATEWAY_INTERFACE", "CGI/1.1"),
        kv(
            "SERVER_SOFTWARE",
            &format!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")),
        ),
        kv("SERVER_PROTOCOL", "gopher"),
        /* Message body is always empty */
        kv("CONTENT_LENGTH", "0"),
        kv("REQUEST_METHOD", "GET"),
        /* Non-standard */
        kv("PATH", safe_path),
        kv("COLUMNS", &page_width.to_string()),
        kv("GOPHER_CHARSET", charset),
    ]
}

/// The per-request half of the environment.
fn request_env<W: Write>(
    request: &Request,
    responder: &Responder<'_, W>,
) -> Vec<(String, String)> {
    let config = responder.config;
    let mut env = config.cgi_env.clone();
    env.push(kv("SERVER_NAME", config.hostname()));
    env.push(kv("SERVER_PORT", config.port()));
    env.push(kv("REMOTE_ADDR", &responder.client_ip));
    env.push(kv("QUERY_STRING", &request.query));
    env.push(kv("SCRIPT_NAME", &format!("/{}", request.path.rel())));
    env.push(kv("SCRIPT_FILENAME", request.path.abs()));
    env.push(kv("SELECTOR", &request.path.selector()));
    env.push(kv("DOCUMENT_ROOT", request.path.root()));
    env.push(kv("REQUEST_URI", &request_uri(request)));
    env
}

fn request_uri(request: &Request) -> String {
    if request.query.is_empty() {
        format!("/{}", request.path.rel())
    } else {
        format!("/{}?{}", request.path.rel(), request.query)
    }
}

/// Run a cgi-bin script, its stdout spliced into the response. Under HTTP
/// compatibility the output passes through the header-stripping writer and
/// a parsed `Status:` error takes priority over the exit result.
pub fn execute_cgi<W: Write>(request: &Request, responder: &mut Responder<'_, W>) -> Result<()> {
    let config = responder.config;
    if !config.cgi_enabled {
        return Err(GophorError::CgiDisabled);
    }
    let env = request_env(request, responder);
    if config.http_compat_cgi {
        let mut strip = HeaderStripWriter::new(&mut responder.writer, config.skip_prefix_buf);
        let exec_result = execute(
            &mut strip,
            &env,
            request.path.abs(),
            &[],
            config.max_exec_time,
        );
        match strip.finish_up() {
            Some(status_err) => Err(status_err),
            None => exec_result,
        }
    } else {
        execute(
            &mut responder.writer,
            &env,
            request.path.abs(),
            &[],
            config.max_exec_time,
        )
    }
}

/// Run an executable gophermap. The query string, when present, is handed
/// to the script as its single argument; output is served as-is.
pub fn execute_file<W: Write>(request: &Request, responder: &mut Responder<'_, W>) -> Result<()> {
    let config = responder.config;
    if !config.cgi_enabled {
        return Err(GophorError::CgiDisabled);
    }
    let env = request_env(request, responder);
    let args: Vec<String> = if request.query.is_empty() {
        Vec::new()
    } else {
        vec![request.query.clone()]
    };
    execute(
        &mut responder.writer,
        &env,
        request.path.abs(),
        &args,
        config.max_exec_time,
    )
}

/// Spawn the executable in its own process group with a scrubbed
/// environment, copy its stdout to the writer, and enforce the wall-clock
/// budget by SIGTERMing the whole group from a watchdog thread.
fn execute<W: Write>(
    writer: &mut W,
    env: &[(String, String)],
    path: &str,
    args: &[String],
    max_exec_time: Duration,
) -> Result<()> {
    let mut child = Command::new(path)
        .args(args)
        .env_clear()
        .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .process_group(0)
        .spawn()
        .map_err(GophorError::CommandStart)?;

    let pid = child.id() as i32;
    let (done, timeout) = mpsc::channel::<()>();
    let watchdog = thread::spawn(move || {
        if timeout.recv_timeout(max_exec_time).is_err() {
            // Negated pgid: the signal reaches the child and any
            // grandchildren it spawned.
            let _ = kill(Pid::from_raw(-pid), Signal::SIGTERM);
        }
    });

    let mut stdout = child.stdout.take().expect("child stdout is piped");
    let copy_result = io::copy(&mut stdout, writer);
    // Close our end of the pipe so a child still writing sees EPIPE.
    drop(stdout);

    let wait_result = child.wait();
    let _ = done.send(());
    let _ = watchdog.join();

    let status = wait_result.map_err(GophorError::CommandStart)?;
    match copy_result {
        // The strip writer ends the stream with UnexpectedEof once it has
        // diverted to an error status; that is not a copy failure.
        Err(err) if err.kind() != io::ErrorKind::UnexpectedEof => {
            return Err(GophorError::CgiOutput(err));
        }
        _ => {}
    }
    if !status.success() {
        return Err(GophorError::CommandExitCode(status.code().unwrap_or(1)));
    }
    Ok(())
}
