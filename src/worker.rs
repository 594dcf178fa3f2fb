use std::collections::HashSet;
use std::fs;
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::net::TcpStream;

use crate::cgi;
use crate::config::ServerConfig;
use crate::error::{GophorError, Result};
use crate::gopher::{error_response, HtmlRedirect, TAB};
use crate::gophermap;
use crate::path::RequestPath;
use crate::request::{parse_selector, Request, Responder, Selector};
use crate::GOPHERMAP;

/// Serve one accepted connection to completion: read a selector line,
/// dispatch it, emit the response or a synthesized error, log, close.
pub fn serve(stream: TcpStream, config: &ServerConfig) {
    let client_ip = stream
        .peer_addr()
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|_| "unknown".to_string());

    let _ = stream.set_read_timeout(Some(config.socket_read_timeout));
    let _ = stream.set_write_timeout(Some(config.socket_write_timeout));

    let read_half = match stream.try_clone() {
        Ok(read_half) => read_half,
        Err(err) => {
            config
                .sys_log
                .error("", &format!("failed to clone connection: {}", err));
            return;
        }
    };
    let mut reader = BufReader::with_capacity(config.socket_read_buf, read_half);

    let line = match read_selector_line(&mut reader, config.socket_read_max) {
        Ok(line) => line,
        Err(err) => {
            config
                .sys_log
                .error("", &GophorError::BufferedRead(err).to_string());
            return;
        }
    };
    // Everything from the first tab onward is ignored.
    let line = match line.iter().position(|&b| b == TAB) {
        Some(i) => &line[..i],
        None => &line[..],
    };

    let writer = BufWriter::with_capacity(config.socket_write_buf, stream);
    let mut responder = Responder::new(config, client_ip, writer);

    let line = match std::str::from_utf8(line) {
        Ok(line) => line.to_string(),
        Err(_) => {
            respond_error(&mut responder, "", GophorError::InvalidRequest);
            return;
        }
    };

    match parse_selector(&line) {
        Ok(Selector::Url(url)) => {
            responder.access_info(&format!("Redirecting to {}", url));
            let _ = responder.write_flush(HtmlRedirect(&url).to_string().as_bytes());
        }
        Ok(Selector::Gopher { path, query }) => {
            let mut request = Request::sanitized(&config.root, &path, query);
            match handle_request(&mut request, &mut responder) {
                Ok(()) => match responder.flush() {
                    Ok(()) => {
                        responder.access_info(&format!("Served: {}", request.path.abs()))
                    }
                    Err(_) => responder
                        .access_error(&format!("Failed to serve: {}", request.path.abs())),
                },
                Err(err) => {
                    let abs = request.path.abs().to_string();
                    respond_error(&mut responder, &abs, err);
                }
            }
        }
        Err(err) => respond_error(&mut responder, "", err),
    }
}

/// Log a failure and, when the error maps to a response code, synthesize
/// the gopher error line. Write-side failures answer with silence.
fn respond_error<W: Write>(responder: &mut Responder<'_, W>, abs: &str, err: GophorError) {
    responder.config.sys_log.error("", &err.to_string());
    if let Some(code) = err.response_code() {
        let _ = responder.write_flush(&error_response(code));
    }
    responder.access_error(&format!("Failed to serve: {}", abs));
}

/// Read one CRLF-terminated line, bounded by `max` bytes. A client that
/// sends more than `max` bytes without a line ending is cut off.
fn read_selector_line<R: BufRead>(reader: &mut R, max: usize) -> io::Result<Vec<u8>> {
    let mut line = Vec::new();
    reader
        .by_ref()
        .take(max as u64)
        .read_until(b'\n', &mut line)?;
    if !line.ends_with(b"\n") && line.len() >= max {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("selector line exceeded read max of {} bytes", max),
        ));
    }
    while matches!(line.last(), Some(&b'\n') | Some(&b'\r')) {
        line.pop();
    }
    Ok(line)
}

/// Route a request to its content action: cached file, cached menu,
/// directory listing, or executed script.
pub fn handle_request<W: Write>(
    request: &mut Request,
    responder: &mut Responder<'_, W>,
) -> Result<()> {
    let config = responder.config;

    if config.policy.is_restricted(request.path.rel()) {
        return Err(GophorError::IllegalPath);
    }
    if let Some(actual) = config.policy.remap(request.path.rel()) {
        request.path.remap_actual(&actual);
    }

    let stat = match fs::metadata(request.path.abs()) {
        Ok(stat) => stat,
        Err(err) => {
            // Generated files (caps.txt, robots.txt) live only in the cache.
            if let Some(result) = config.cache.render_cached(request.path.abs(), responder) {
                return result;
            }
            return Err(GophorError::FileStat(err));
        }
    };

    if stat.is_dir() {
        // The cgi-bin tree is never listable.
        if request.path.has_rel_prefix(&config.cgi_bin_dir) {
            return Err(GophorError::IllegalPath);
        }

        let map_path = RequestPath::new(request.path.root(), &request.path.join_rel(GOPHERMAP));
        match fs::metadata(map_path.abs()) {
            Ok(map_stat) if map_stat.is_file() => {
                let map_request = Request::new(map_path, request.query.clone());
                if gophermap::is_executable(&map_stat) && config.cgi_enabled {
                    cgi::execute_file(&map_request, responder)
                } else {
                    config.cache.fetch(&map_request, responder)
                }
            }
            _ => {
                let mut hidden = HashSet::new();
                hidden.insert(request.path.join_rel(GOPHERMAP));
                hidden.insert(config.cgi_bin_dir.clone());
                gophermap::list_dir_fallback(&request.path, &hidden, responder)
            }
        }
    } else if stat.is_file() {
        if request.path.has_rel_prefix(&config.cgi_bin_dir) {
            if config.cgi_enabled {
                cgi::execute_cgi(request, responder)
            } else {
                Err(GophorError::CgiDisabled)
            }
        } else {
            config.cache.fetch(request, responder)
        }
    } else {
        Err(GophorError::FileType)
    }
}
