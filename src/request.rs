use std::io::{self, Read, Write};

use crate::config::ServerConfig;
use crate::error::{GophorError, Result};
use crate::gopher::url_decode;
use crate::path::RequestPath;

/// Outcome of parsing one selector line.
#[derive(Debug, PartialEq, Eq)]
pub enum Selector {
    /// A gopher path plus the query following the first `?`.
    Gopher { path: String, query: String },
    /// A `URL:` selector; the client gets an HTML redirect page.
    Url(String),
}

/// Parse the selector payload (already CRLF- and tab-stripped). Rejects
/// control bytes, fragment marks and stray HTTP requests; splits off the
/// query and percent-decodes the path half only.
pub fn parse_selector(line: &str) -> Result<Selector> {
    if line.bytes().any(|b| b < 0x20) || line.contains('#') || line.starts_with("GET ") {
        return Err(GophorError::InvalidRequest);
    }

    if let Some(url) = line.strip_prefix("URL:") {
        return Ok(Selector::Url(url.to_string()));
    }

    let (path, query) = match line.split_once('?') {
        Some((path, query)) => (path, query),
        None => (line, ""),
    };

    let path =
        String::from_utf8(url_decode(path)).map_err(|_| GophorError::InvalidRequest)?;
    Ok(Selector::Gopher {
        path,
        query: query.to_string(),
    })
}

/// One parsed request: where, plus the query string handed to executables.
#[derive(Debug, Clone)]
pub struct Request {
    pub path: RequestPath,
    pub query: String,
}

impl Request {
    pub fn new(path: RequestPath, query: String) -> Self {
        Request { path, query }
    }

    /// Sanitize a decoded selector path against the server root.
    pub fn sanitized(root: &str, selector_path: &str, query: String) -> Self {
        Request::new(RequestPath::sanitized(root, selector_path), query)
    }
}

/// The write half of a connection: a buffered writer plus the client
/// identity for access logging. All gopher-level write errors funnel
/// through here so they carry the right taxonomy tag.
pub struct Responder<'a, W: Write> {
    pub config: &'a ServerConfig,
    pub client_ip: String,
    pub writer: W,
}

impl<'a, W: Write> Responder<'a, W> {
    pub fn new(config: &'a ServerConfig, client_ip: String, writer: W) -> Self {
        Responder {
            config,
            client_ip,
            writer,
        }
    }

    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        self.writer
            .write_all(data)
            .map_err(GophorError::BufferedWrite)
    }

    pub fn write_flush(&mut self, data: &[u8]) -> Result<()> {
        self.write(data)?;
        self.flush()
    }

    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush().map_err(GophorError::BufferedFlush)
    }

    /// Copy a reader straight through to the client, then flush.
    pub fn write_raw<R: Read>(&mut self, reader: &mut R) -> Result<()> {
        io::copy(reader, &mut self.writer).map_err(GophorError::BufferedWrite)?;
        self.flush()
    }

    pub fn access_info(&self, message: &str) {
        self.config
            .acc_log
            .info(&format!("({}) ", self.client_ip), message);
    }

    pub fn access_error(&self, message: &str) {
        self.config
            .acc_log
            .error(&format!("({}) ", self.client_ip), message);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use test_case::test_case;

    #[test_case("" => matches Ok(Selector::Gopher { .. }) ; "empty selects root")]
    #[test_case("docs/notes.txt" => matches Ok(Selector::Gopher { .. }) ; "plain path")]
    #[test_case("bad\x01byte" => matches Err(GophorError::InvalidRequest) ; "control byte")]
    #[test_case("frag#ment" => matches Err(GophorError::InvalidRequest) ; "fragment mark")]
    #[test_case("GET / HTTP/1.1" => matches Err(GophorError::InvalidRequest) ; "http request")]
    #[test_case("URL:https://example.org/" => matches Ok(Selector::Url(_)) ; "url redirect")]
    fn parse_selector_works(line: &str) -> Result<Selector> {
        parse_selector(line)
    }

    #[test]
    fn parse_selector_splits_query() {
        assert_eq!(
            parse_selector("cgi-bin/hello?name=world").unwrap(),
            Selector::Gopher {
                path: "cgi-bin/hello".to_string(),
                query: "name=world".to_string(),
            }
        );
    }

    #[test]
    fn parse_selector_decodes_path_half_only() {
        assert_eq!(
            parse_selector("some%20file?a%20b").unwrap(),
            Selector::Gopher {
                path: "some file".to_string(),
                query: "a%20b".to_string(),
            }
        );
    }

    #[test]
    fn url_selector_keeps_query() {
        assert_eq!(
            parse_selector("URL:https://example.org/?q=1").unwrap(),
            Selector::Url("https://example.org/?q=1".to_string())
        );
    }
}
