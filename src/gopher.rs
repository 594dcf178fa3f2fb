use std::collections::HashMap;
use std::fmt;

use once_cell::sync::Lazy;

use crate::error::ResponseCode;

pub const CRLF: &[u8] = b"\r\n";
pub const TAB: u8 = b'\t';

/// Terminating line of every gopher menu response.
pub const LASTLINE: &[u8] = b".\r\n";

/// Placeholder host and port fields used on info lines.
pub const NULL_HOST: &str = "null.host";
pub const NULL_PORT: &str = "0";

/* Canonical item types (RFC 1436 + common extensions) */
pub const TYPE_FILE: u8 = b'0';
pub const TYPE_DIRECTORY: u8 = b'1';
pub const TYPE_ERROR: u8 = b'3';
pub const TYPE_BINARY: u8 = b'9';
pub const TYPE_INFO: u8 = b'i';

/// Replacement tokens recognized in the host and port fields of
/// pre-formatted gophermap lines.
pub const REPLACE_HOSTNAME: &[u8] = b"$hostname";
pub const REPLACE_PORT: &[u8] = b"$port";

// One line per item type: the type byte, then the extensions it covers.
const DEFAULT_ITEM_TYPES: &[&str] = &[
    "0  txt md markdown rst org log conf cfg ini json toml yaml yml xml csv c h go rs py sh pl",
    "4  hqx",
    "5  zip tar gz tgz bz2 xz 7z rar",
    "9  bin exe iso img dmg o so a deb rpm pdf",
    "g  gif",
    "h  html htm xhtml",
    "I  png jpg jpeg bmp tif tiff webp svg ico",
    "s  wav mp3 ogg oga flac aac m4a mid midi",
    ";  mp4 mkv avi mov webm mpg mpeg",
];

static ITEM_TYPES: Lazy<HashMap<&'static str, u8>> = Lazy::new(|| {
    let mut map = HashMap::new();
    for line in DEFAULT_ITEM_TYPES {
        let mut fields = line.split_whitespace();
        let item_type = fields.next().expect("item type table line is empty");
        for extension in fields {
            map.insert(extension, item_type.as_bytes()[0]);
        }
    }
    map
});

/// Item type for a file name, judged by extension. Unknown extensions are
/// served as binary.
pub fn item_type(name: &str) -> u8 {
    name.rsplit('.')
        .next()
        .and_then(|extension| ITEM_TYPES.get(extension.to_ascii_lowercase().as_str()))
        .copied()
        .unwrap_or(TYPE_BINARY)
}

/// Build a tab-separated menu line. Embedded new-lines in the display string
/// are dropped so a single entry cannot span lines.
pub fn build_line(item_type: u8, display: &str, selector: &str, host: &str, port: &str) -> Vec<u8> {
    let display: String = display.chars().filter(|&c| c != '\n' && c != '\r').collect();
    let mut line = Vec::with_capacity(display.len() + selector.len() + host.len() + port.len() + 6);
    line.push(item_type);
    line.extend_from_slice(display.as_bytes());
    line.push(TAB);
    line.extend_from_slice(selector.as_bytes());
    line.push(TAB);
    line.extend_from_slice(host.as_bytes());
    line.push(TAB);
    line.extend_from_slice(port.as_bytes());
    line.extend_from_slice(CRLF);
    line
}

/// An info line: display text only, placeholder selector/host/port.
pub fn build_info_line(text: &str) -> Vec<u8> {
    build_line(TYPE_INFO, text, "FAKE", NULL_HOST, NULL_PORT)
}

/// Raw-byte info line, used when reflowing file contents that need not be
/// valid UTF-8.
pub fn build_info_line_bytes(text: &[u8]) -> Vec<u8> {
    let mut line = Vec::with_capacity(text.len() + 24);
    line.push(TYPE_INFO);
    line.extend(text.iter().filter(|&&b| b != b'\n' && b != b'\r'));
    line.push(TAB);
    line.extend_from_slice(b"FAKE");
    line.push(TAB);
    line.extend_from_slice(NULL_HOST.as_bytes());
    line.push(TAB);
    line.extend_from_slice(NULL_PORT.as_bytes());
    line.extend_from_slice(CRLF);
    line
}

/// Pre-format the configured footer: a blank info line, an optional
/// page-width separator, the footer text as info lines, then the lastline.
/// Built once at startup; every menu response ends with these bytes.
pub fn format_footer(text: &str, separator: bool, page_width: usize) -> Vec<u8> {
    let mut footer = Vec::new();
    if !text.is_empty() {
        footer.extend(build_info_line(""));
        if separator {
            footer.extend(build_info_line(&"-".repeat(page_width)));
        }
        for line in text.split('\n') {
            footer.extend(build_info_line(line));
        }
    }
    footer.extend_from_slice(LASTLINE);
    footer
}

/// A complete gopher error response: one type-3 line plus the lastline.
pub fn error_response(code: ResponseCode) -> Vec<u8> {
    let mut response = build_line(TYPE_ERROR, code.text(), "TITLE", NULL_HOST, NULL_PORT);
    response.extend_from_slice(LASTLINE);
    response
}

/// HTML document redirecting the client to a non-gopher URL.
pub struct HtmlRedirect<'a>(pub &'a str);

impl<'a> fmt::Display for HtmlRedirect<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<!DOCTYPE html>\n\
            <html>\n\
            <head>\n\
            <meta http-equiv=\"refresh\" content=\"2;url={}\">\n\
            </head>\n\
            <body>\n\
            You are following an external link to a web site.\n\
            You will be automatically taken to the site shortly.\n\
            If you do not get sent there, please click <a href=\"{}\">here</a> to go to the web site.\n\
            </body>\n\
            </html>\n",
            self.0, self.0,
        )
    }
}

/// Replace `$hostname` and `$port` in the host and port fields of an
/// already tab-separated menu line. Lines with fewer than four fields pass
/// through untouched.
pub fn replace_placeholders(line: &[u8], hostname: &str, port: &str) -> Vec<u8> {
    let fields: Vec<&[u8]> = line.split(|&b| b == TAB).collect();
    if fields.len() < 4 {
        return line.to_vec();
    }

    let mut out = Vec::with_capacity(line.len());
    for (i, field) in fields.iter().enumerate() {
        if i > 0 {
            out.push(TAB);
        }
        match i {
            2 => out.extend(replace_all(field, REPLACE_HOSTNAME, hostname.as_bytes())),
            3 => out.extend(replace_all(field, REPLACE_PORT, port.as_bytes())),
            _ => out.extend_from_slice(field),
        }
    }
    out
}

/// Return index of first occurrence of `needle` in `haystack`.
pub fn find(needle: &[u8], haystack: &[u8]) -> Option<usize> {
    if needle.is_empty() || needle.len() > haystack.len() {
        return None;
    }
    (0..=haystack.len() - needle.len()).find(|&i| haystack[i..].starts_with(needle))
}

fn replace_all(haystack: &[u8], needle: &[u8], replacement: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(haystack.len());
    let mut rest = haystack;
    while let Some(i) = find(needle, rest) {
        out.extend_from_slice(&rest[..i]);
        out.extend_from_slice(replacement);
        rest = &rest[i + needle.len()..];
    }
    out.extend_from_slice(rest);
    out
}

/// Decode %XX (where XX are hexadecimal digits) to the byte it represents.
/// Malformed escapes pass through literally.
pub fn url_decode(url: &str) -> Vec<u8> {
    let url = url.as_bytes();
    let mut decoded = Vec::with_capacity(url.len());
    let mut i = 0;
    while i < url.len() {
        let c = url[i];
        if c == b'%'
            && i + 2 < url.len()
            && url[i + 1].is_ascii_hexdigit()
            && url[i + 2].is_ascii_hexdigit()
        {
            decoded.push(hex_to_digit(url[i + 1]) * 16 + hex_to_digit(url[i + 2]));
            i += 3;
        } else {
            decoded.push(c);
            i += 1;
        }
    }
    decoded
}

/// Convert hex digit to integer.
fn hex_to_digit(hex: u8) -> u8 {
    if hex.is_ascii_uppercase() {
        hex - b'A' + 10
    } else if hex.is_ascii_lowercase() {
        hex - b'a' + 10
    } else {
        hex - b'0'
    }
}
