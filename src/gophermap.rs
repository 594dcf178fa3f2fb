use std::collections::HashSet;
use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;

use crate::cache::read_file;
use crate::cgi;
use crate::config::ServerConfig;
use crate::error::{GophorError, Result};
use crate::gopher::{
    build_info_line, build_info_line_bytes, build_line, find, item_type, replace_placeholders,
    CRLF, NULL_HOST, NULL_PORT, TYPE_DIRECTORY, TYPE_INFO,
};
use crate::path::{join_paths, RequestPath};
use crate::request::{parse_selector, Request, Responder, Selector};
use crate::GOPHERMAP;

/// One renderable piece of a parsed gophermap. Text is pre-formatted;
/// everything else resolves lazily at render time so a cached menu stays
/// current with the resources it includes.
#[derive(Debug)]
pub enum Section {
    /// A finished menu line, host/port placeholders still unexpanded.
    Text(Vec<u8>),
    /// Directory listing rendered on demand (`*` directive).
    Directory {
        path: RequestPath,
        hidden: HashSet<String>,
    },
    /// External text file reflowed into info lines.
    FileInclude { path: RequestPath },
    /// Another gophermap parsed and rendered inline.
    SubGophermap { path: RequestPath },
    /// CGI script whose output is spliced into the menu.
    CgiInclude { request: Request },
    /// Executable gophermap run with the query as its argument.
    ExecFile { request: Request },
}

impl Section {
    pub fn render<W: Write>(&self, responder: &mut Responder<'_, W>) -> Result<()> {
        let config = responder.config;
        match self {
            Section::Text(line) => {
                responder.write(&replace_placeholders(line, config.hostname(), config.port()))
            }
            Section::Directory { path, hidden } => list_dir(path, hidden, responder),
            Section::FileInclude { path } => {
                let reflowed = read_into_gophermap(path.abs(), config.page_width)?;
                responder.write(&reflowed)
            }
            Section::SubGophermap { path } => {
                // No footer here: only the outermost menu appends one.
                let sections = parse_gophermap(config, path)?;
                render_sections(&sections, responder)
            }
            Section::CgiInclude { request } => cgi::execute_cgi(request, responder),
            Section::ExecFile { request } => cgi::execute_file(request, responder),
        }
    }
}

/// Render sections in order. A broken socket aborts; any other failure is
/// logged and the remaining sections still render.
pub fn render_sections<W: Write>(
    sections: &[Section],
    responder: &mut Responder<'_, W>,
) -> Result<()> {
    for section in sections {
        if let Err(err) = section.render(responder) {
            if err.response_code().is_none() {
                return Err(err);
            }
            responder
                .config
                .sys_log
                .error("", &format!("error rendering gophermap section: {}", err));
        }
    }
    Ok(())
}

/// What a gophermap line means, judged by its first byte.
#[derive(Debug, PartialEq, Eq)]
enum LineType<'a> {
    Info(&'a str),
    InfoNotStated,
    Title(&'a str),
    Comment,
    Hidden(&'a str),
    Include(&'a str),
    End,
    EndBeginList,
    Verbatim,
}

fn classify_line(line: &str) -> LineType<'_> {
    if line.is_empty() {
        return LineType::InfoNotStated;
    }
    let first = line.as_bytes()[0];
    if line.len() == 1 {
        return match first {
            b'.' => LineType::End,
            b'*' => LineType::EndBeginList,
            b'#' => LineType::Comment,
            b'i' => LineType::Info(""),
            b'!' => LineType::Title(""),
            _ => LineType::Verbatim,
        };
    }
    if !line.contains('\t') {
        return match first {
            b'#' => LineType::Comment,
            b'!' => LineType::Title(&line[1..]),
            b'i' => LineType::Info(&line[1..]),
            b'-' => LineType::Hidden(&line[1..]),
            b'=' => LineType::Include(&line[1..]),
            _ => LineType::InfoNotStated,
        };
    }
    LineType::Verbatim
}

/// Split file contents into lines, by CRLF if the file contains any,
/// otherwise by LF. An unterminated trailing fragment is dropped.
fn split_lines(contents: &[u8]) -> Vec<&[u8]> {
    let mut lines = Vec::new();
    let mut rest = contents;
    if find(b"\r\n", contents).is_some() {
        while let Some(i) = find(b"\r\n", rest) {
            lines.push(&rest[..i]);
            rest = &rest[i + 2..];
        }
    } else {
        while let Some(i) = rest.iter().position(|&b| b == b'\n') {
            lines.push(&rest[..i]);
            rest = &rest[i + 1..];
        }
    }
    lines
}

/// Compile a gophermap file into an ordered list of sections.
pub fn parse_gophermap(config: &ServerConfig, path: &RequestPath) -> Result<Vec<Section>> {
    let contents = read_file(path.abs())?;
    let dir_rel = path.trim_rel_suffix(GOPHERMAP);

    let mut sections = Vec::new();
    let mut hidden: HashSet<String> = HashSet::new();
    hidden.insert(path.rel().to_string());
    hidden.insert(config.cgi_bin_dir.clone());
    let mut title_seen = false;

    for raw_line in split_lines(&contents) {
        let line = String::from_utf8_lossy(raw_line);
        match classify_line(&line) {
            LineType::InfoNotStated => sections.push(Section::Text(build_info_line(&line))),
            LineType::Info(text) => sections.push(Section::Text(build_info_line(text))),
            LineType::Title(text) => {
                // Only the first title counts.
                if !title_seen {
                    sections.push(Section::Text(build_line(
                        TYPE_INFO, text, "TITLE", NULL_HOST, NULL_PORT,
                    )));
                    title_seen = true;
                }
            }
            LineType::Comment => {}
            LineType::Hidden(name) => {
                hidden.insert(join_paths(&dir_rel, name));
            }
            LineType::Include(rest) => {
                if let Some(section) = resolve_include(config, path, rest) {
                    sections.push(section);
                }
            }
            LineType::End => break,
            LineType::EndBeginList => {
                let dir = RequestPath::new(path.root(), &dir_rel);
                sections.push(Section::Directory {
                    path: dir,
                    hidden: hidden.clone(),
                });
                break;
            }
            LineType::Verbatim => {
                let mut bytes = raw_line.to_vec();
                bytes.extend_from_slice(CRLF);
                sections.push(Section::Text(bytes));
            }
        }
    }

    Ok(sections)
}

/// Resolve an `=path` include directive to a section, or None when the
/// directive is malformed, recursive, or names something other than a
/// regular file.
fn resolve_include(
    config: &ServerConfig,
    map_path: &RequestPath,
    rest: &str,
) -> Option<Section> {
    let (sel_path, query) = match parse_selector(rest) {
        Ok(Selector::Gopher { path, query }) => (path, query),
        _ => return None,
    };

    let include = RequestPath::sanitized(map_path.root(), &sel_path);
    if include.rel().is_empty() || include.rel() == "." || include.rel() == map_path.rel() {
        return None;
    }

    let stat = fs::metadata(include.abs()).ok()?;
    if !stat.is_file() {
        return None;
    }

    if include.has_abs_suffix("/gophermap") {
        if is_executable(&stat) && config.cgi_enabled {
            Some(Section::ExecFile {
                request: Request::new(include, query),
            })
        } else {
            Some(Section::SubGophermap { path: include })
        }
    } else if include.has_rel_prefix(&config.cgi_bin_dir) && config.cgi_enabled {
        Some(Section::CgiInclude {
            request: Request::new(include, query),
        })
    } else {
        Some(Section::FileInclude { path: include })
    }
}

pub fn is_executable(stat: &fs::Metadata) -> bool {
    stat.permissions().mode() & 0o100 != 0
}

/// Read a text file and reflow it into info lines no wider than the page.
/// Long lines split at raw byte boundaries.
pub fn read_into_gophermap(abs: &str, page_width: usize) -> Result<Vec<u8>> {
    let contents = read_file(abs)?;
    let mut out = Vec::new();
    for line in split_lines(&contents) {
        if line.is_empty() {
            out.extend(build_info_line(""));
            continue;
        }
        let mut rest = line;
        while !rest.is_empty() {
            let take = rest.len().min(page_width);
            out.extend(build_info_line_bytes(&rest[..take]));
            rest = &rest[take..];
        }
    }
    if !out.ends_with(CRLF) {
        out.extend_from_slice(CRLF);
    }
    Ok(out)
}

/// List a directory as menu lines: entries sorted by name, hidden and
/// restricted names skipped, virtual selectors restored via reverse remap.
pub fn list_dir<W: Write>(
    dir: &RequestPath,
    hidden: &HashSet<String>,
    responder: &mut Responder<'_, W>,
) -> Result<()> {
    let config = responder.config;

    let mut names: Vec<(String, fs::FileType)> = Vec::new();
    for entry in fs::read_dir(dir.abs()).map_err(GophorError::FileOpen)? {
        let entry = entry.map_err(GophorError::DirList)?;
        let file_type = entry.file_type().map_err(GophorError::DirList)?;
        names.push((entry.file_name().to_string_lossy().into_owned(), file_type));
    }
    names.sort_by(|a, b| a.0.cmp(&b.0));

    let mut listing = Vec::new();
    for (name, file_type) in &names {
        let mut entry_path = RequestPath::new(dir.root(), &dir.join_rel(name));
        if hidden.contains(entry_path.rel()) || config.policy.is_restricted(entry_path.rel()) {
            continue;
        }
        if let Some(virt) = config.policy.reverse_remap(entry_path.rel()) {
            entry_path.remap_virtual(virt);
        }
        if file_type.is_dir() {
            listing.extend(build_line(
                TYPE_DIRECTORY,
                name,
                &entry_path.selector(),
                config.hostname(),
                config.port(),
            ));
        } else if file_type.is_file() {
            listing.extend(build_line(
                item_type(name),
                name,
                &entry_path.selector(),
                config.hostname(),
                config.port(),
            ));
        }
        // sockets, devices, dangling symlinks: ignored
    }
    responder.write(&listing)
}

/// Directory listing used when a directory has no gophermap: a title, a
/// parent entry, the listing, then the configured footer.
pub fn list_dir_fallback<W: Write>(
    dir: &RequestPath,
    hidden: &HashSet<String>,
    responder: &mut Responder<'_, W>,
) -> Result<()> {
    let config = responder.config;
    let mut header = build_line(
        TYPE_INFO,
        &format!("[ {}{} ]", config.hostname(), dir.selector()),
        "TITLE",
        NULL_HOST,
        NULL_PORT,
    );
    header.extend(build_info_line(""));
    header.extend(build_line(
        TYPE_DIRECTORY,
        "..",
        &dir.join_selector(".."),
        config.hostname(),
        config.port(),
    ));
    responder.write(&header)?;
    list_dir(dir, hidden, responder)?;
    responder.write(&config.footer)
}
