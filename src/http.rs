use std::io::{self, Write};

use crate::error::{GophorError, ResponseCode};
use crate::gopher::{find, CRLF};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StripState {
    /// Accumulating a bounded prefix, decision pending.
    Buffering,
    /// Decision made; bytes flow straight through.
    PassThrough,
    /// HTTP error status seen; the stream is dead and the recorded status
    /// becomes the response.
    Aborted,
}

/// Write-side filter for HTTP-compatible CGI scripts. Buffers a bounded
/// prefix of the child's output looking for an HTTP header block; valid
/// headers are stripped (and an error `Status:` kills the stream), anything
/// else passes through untouched.
pub struct HeaderStripWriter<W: Write> {
    writer: W,
    buf: Vec<u8>,
    capacity: usize,
    state: StripState,
    status: Option<ResponseCode>,
}

impl<W: Write> HeaderStripWriter<W> {
    pub fn new(writer: W, capacity: usize) -> Self {
        // Room for at least one separator, whatever was configured.
        let capacity = capacity.max(4);
        HeaderStripWriter {
            writer,
            buf: Vec::with_capacity(capacity),
            capacity,
            state: StripState::Buffering,
            status: None,
        }
    }

    /// Examine the buffered prefix and leave the Buffering state. Called
    /// when the buffer fills, a blank line is seen, or the child is done.
    fn decide(&mut self) -> io::Result<()> {
        let separator = find(b"\r\n\r\n", &self.buf);
        let header_end = separator.unwrap_or(self.buf.len());
        let (valid, status) = parse_header_section(&self.buf[..header_end]);

        if valid {
            match status {
                Some(code) => {
                    // Error status: swallow the output, remember the code.
                    self.status = Some(code);
                    self.state = StripState::Aborted;
                }
                None => {
                    self.state = StripState::PassThrough;
                    if let Some(i) = separator {
                        self.writer.write_all(&self.buf[i + 4..])?;
                    }
                }
            }
        } else {
            // Not HTTP output after all; the whole prefix belongs to the
            // client.
            self.state = StripState::PassThrough;
            self.writer.write_all(&self.buf)?;
        }
        self.buf.clear();
        Ok(())
    }

    /// Must be called once the child has exited: output shorter than the
    /// prefix buffer never forces a decision on its own. Returns the error
    /// status parsed from the headers, if any.
    pub fn finish_up(&mut self) -> Option<GophorError> {
        if self.state == StripState::Buffering && !self.buf.is_empty() {
            let _ = self.decide();
        }
        self.status.map(GophorError::CgiStatus)
    }
}

impl<W: Write> Write for HeaderStripWriter<W> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        match self.state {
            StripState::PassThrough => self.writer.write(data),
            StripState::Aborted => Err(io::ErrorKind::UnexpectedEof.into()),
            StripState::Buffering => {
                let available = self.capacity - self.buf.len();
                let take = available.min(data.len());
                self.buf.extend_from_slice(&data[..take]);

                let forced = self.buf.len() == self.capacity
                    || find(b"\r\n\r\n", &self.buf).is_some();
                if !forced {
                    return Ok(take);
                }

                self.decide()?;
                match self.state {
                    StripState::PassThrough => {
                        self.writer.write_all(&data[take..])?;
                        Ok(data.len())
                    }
                    StripState::Aborted => Err(io::ErrorKind::UnexpectedEof.into()),
                    StripState::Buffering => unreachable!("decide always leaves Buffering"),
                }
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

/// Scan CRLF-separated header candidates: the section is valid HTTP once a
/// `content-type:` line appears; a non-200 `status:` line supplies the
/// response code.
fn parse_header_section(buf: &[u8]) -> (bool, Option<ResponseCode>) {
    let mut valid = false;
    let mut status = None;

    let mut rest = buf;
    loop {
        let (line, next) = match find(CRLF, rest) {
            Some(i) => (&rest[..i], Some(&rest[i + 2..])),
            None => (rest, None),
        };
        let line = line.to_ascii_lowercase();
        if line.starts_with(b"content-type:") {
            valid = true;
        } else if let Some(value) = line.strip_prefix(b"status:") {
            let value = std::str::from_utf8(value).unwrap_or("");
            let code = value.split_whitespace().next().unwrap_or("");
            if code != "200" {
                status = Some(ResponseCode::from_cgi_status(code));
            }
        }
        match next {
            Some(r) => rest = r,
            None => break,
        }
    }
    (valid, status)
}

#[cfg(test)]
mod test {
    use super::*;

    fn contains(haystack: &[u8], needle: &[u8]) -> bool {
        find(needle, haystack).is_some()
    }

    #[test]
    fn strips_headers_on_status_200() {
        let mut sink = Vec::new();
        let mut writer = HeaderStripWriter::new(&mut sink, 4096);
        writer
            .write_all(b"Content-Type: text/plain\r\nStatus: 200 OK\r\n\r\nhello gopher")
            .unwrap();
        writer.write_all(b", more").unwrap();
        assert!(writer.finish_up().is_none());
        assert_eq!(sink, b"hello gopher, more");
    }

    #[test]
    fn strips_headers_without_status() {
        let mut sink = Vec::new();
        let mut writer = HeaderStripWriter::new(&mut sink, 4096);
        writer
            .write_all(b"Content-Type: text/html\r\n\r\n<html></html>")
            .unwrap();
        assert!(writer.finish_up().is_none());
        assert_eq!(sink, b"<html></html>");
    }

    #[test]
    fn error_status_kills_the_stream() {
        let mut sink = Vec::new();
        let mut writer = HeaderStripWriter::new(&mut sink, 4096);
        let err = writer
            .write_all(b"Content-Type: text/plain\r\nStatus: 404 Not Found\r\n\r\nbody")
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
        let finish = writer.finish_up();
        // Nothing of the headers or body reaches the client.
        assert!(sink.is_empty());
        match finish {
            Some(GophorError::CgiStatus(code)) => assert_eq!(code, ResponseCode::NotFound),
            other => panic!("expected CgiStatus, got {:?}", other),
        }
    }

    #[test]
    fn unknown_status_collapses_to_500() {
        let mut sink = Vec::new();
        let mut writer = HeaderStripWriter::new(&mut sink, 4096);
        writer
            .write_all(b"Content-Type: text/plain\r\nStatus: 302 Found\r\n\r\n")
            .unwrap_err();
        match writer.finish_up() {
            Some(GophorError::CgiStatus(code)) => {
                assert_eq!(code, ResponseCode::InternalError)
            }
            other => panic!("expected CgiStatus, got {:?}", other),
        }
    }

    #[test]
    fn non_http_output_passes_through() {
        let mut sink = Vec::new();
        let mut writer = HeaderStripWriter::new(&mut sink, 4096);
        writer.write_all(b"iplain gopher output\tFAKE\tnull.host\t0\r\n").unwrap();
        assert!(writer.finish_up().is_none());
        assert_eq!(sink, b"iplain gopher output\tFAKE\tnull.host\t0\r\n");
    }

    #[test]
    fn headers_split_across_writes_still_strip() {
        let mut sink = Vec::new();
        let mut writer = HeaderStripWriter::new(&mut sink, 4096);
        writer.write_all(b"Content-Type: te").unwrap();
        writer.write_all(b"xt/plain\r\n\r").unwrap();
        writer.write_all(b"\npayload").unwrap();
        assert!(writer.finish_up().is_none());
        assert_eq!(sink, b"payload");
    }

    #[test]
    fn full_buffer_without_content_type_passes_through() {
        let mut sink = Vec::new();
        let mut writer = HeaderStripWriter::new(&mut sink, 8);
        writer.write_all(b"0123456789abcdef").unwrap();
        assert!(writer.finish_up().is_none());
        assert_eq!(sink, b"0123456789abcdef");
    }

    #[test]
    fn header_block_bytes_never_reach_the_client() {
        let mut sink = Vec::new();
        let mut writer = HeaderStripWriter::new(&mut sink, 4096);
        writer
            .write_all(b"Content-Type: text/plain\r\nX-Extra: yes\r\n\r\ntail")
            .unwrap();
        writer.finish_up();
        assert!(!contains(&sink, b"content-type"));
        assert!(!contains(&sink, b"Content-Type"));
        assert!(!contains(&sink, b"X-Extra"));
        assert_eq!(sink, b"tail");
    }
}
