use std::fmt;
use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, GophorError>;

/// Everything that can go wrong between reading a selector and flushing a
/// response. Write-side failures carry no response mapping: once the socket
/// is broken there is nobody left to tell.
#[derive(Debug, Error)]
pub enum GophorError {
    #[error("invalid request")]
    InvalidRequest,
    #[error("illegal path requested")]
    IllegalPath,
    #[error("file stat fail: {0}")]
    FileStat(#[source] io::Error),
    #[error("file open fail: {0}")]
    FileOpen(#[source] io::Error),
    #[error("file read fail: {0}")]
    FileRead(#[source] io::Error),
    #[error("invalid file type")]
    FileType,
    #[error("directory read fail: {0}")]
    DirList(#[source] io::Error),
    #[error("cgi support disabled")]
    CgiDisabled,
    #[error("command start fail: {0}")]
    CommandStart(#[source] io::Error),
    #[error("command exited with code {0}")]
    CommandExitCode(i32),
    #[error("command output fail: {0}")]
    CgiOutput(#[source] io::Error),
    #[error("restricted command")]
    RestrictedCommand,
    #[error("invalid gophermap")]
    InvalidGophermap,
    #[error("cgi script returned status {0}")]
    CgiStatus(ResponseCode),
    #[error("buffered write fail: {0}")]
    BufferedWrite(#[source] io::Error),
    #[error("buffered read fail: {0}")]
    BufferedRead(#[source] io::Error),
    #[error("buffered write flush fail: {0}")]
    BufferedFlush(#[source] io::Error),
}

impl GophorError {
    /// Response code to synthesize for the client, or None when the failure
    /// was on the write side and no further bytes should be sent.
    pub fn response_code(&self) -> Option<ResponseCode> {
        use GophorError::*;
        match self {
            InvalidRequest => Some(ResponseCode::BadRequest),
            IllegalPath => Some(ResponseCode::Forbidden),
            FileStat(_) | FileOpen(_) | FileRead(_) | FileType | DirList(_) | CgiDisabled => {
                Some(ResponseCode::NotFound)
            }
            CommandStart(_) | CommandExitCode(_) | CgiOutput(_) | RestrictedCommand
            | InvalidGophermap => Some(ResponseCode::InternalError),
            CgiStatus(code) => Some(*code),
            BufferedWrite(_) | BufferedRead(_) | BufferedFlush(_) => None,
        }
    }
}

/// The subset of status codes a response line can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseCode {
    BadRequest,
    Unauthorized,
    Forbidden,
    NotFound,
    RequestTimeout,
    Gone,
    InternalError,
    NotImplemented,
    Unavailable,
}

impl ResponseCode {
    /// Map a CGI `Status:` code to a response. `200` is not an error and is
    /// handled by the caller; anything unrecognized collapses to 500.
    pub fn from_cgi_status(status: &str) -> ResponseCode {
        match status {
            "400" => ResponseCode::BadRequest,
            "401" => ResponseCode::Unauthorized,
            "403" => ResponseCode::Forbidden,
            "404" => ResponseCode::NotFound,
            "408" => ResponseCode::RequestTimeout,
            "410" => ResponseCode::Gone,
            "501" => ResponseCode::NotImplemented,
            "503" => ResponseCode::Unavailable,
            _ => ResponseCode::InternalError,
        }
    }

    pub fn text(self) -> &'static str {
        match self {
            ResponseCode::BadRequest => "400 Bad Request",
            ResponseCode::Unauthorized => "401 Unauthorized",
            ResponseCode::Forbidden => "403 Forbidden",
            ResponseCode::NotFound => "404 Not Found",
            ResponseCode::RequestTimeout => "408 Request Time-out",
            ResponseCode::Gone => "410 Gone",
            ResponseCode::InternalError => "500 Internal Server Error",
            ResponseCode::NotImplemented => "501 Not Implemented",
            ResponseCode::Unavailable => "503 Service Unavailable",
        }
    }
}

impl fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.text())
    }
}
