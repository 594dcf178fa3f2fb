use anyhow::{anyhow, Context};
use regex::Regex;

/// Separator between the virtual and actual halves of a remap entry.
pub const REMAP_SEPARATOR: &str = " -> ";

/// Lexically clean a slash-separated path: collapse duplicate slashes and
/// `.` components, resolve `name/..` pairs. Leading `..` components survive
/// on relative paths and vanish on rooted ones. The empty path cleans to
/// `.`, matching the join semantics used throughout.
pub fn clean_path(path: &str) -> String {
    let rooted = path.starts_with('/');
    let mut out: Vec<&str> = Vec::new();
    for component in path.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                if out.last().map_or(false, |c| *c != "..") {
                    out.pop();
                } else if !rooted {
                    out.push("..");
                }
            }
            c => out.push(c),
        }
    }
    let joined = out.join("/");
    if rooted {
        format!("/{}", joined)
    } else if joined.is_empty() {
        ".".to_string()
    } else {
        joined
    }
}

/// Join two path fragments and clean the result.
pub fn join_paths(base: &str, ext: &str) -> String {
    if base.is_empty() {
        clean_path(ext)
    } else if ext.is_empty() {
        clean_path(base)
    } else {
        clean_path(&format!("{}/{}", base, ext))
    }
}

/// Reduce a raw selector path to a relative path confined below the root.
/// Never fails: pathological inputs normalize to the root itself.
pub fn sanitize_rel_path(root: &str, raw: &str) -> String {
    let cleaned = clean_path(raw);
    if cleaned.starts_with('/') {
        // Absolute: strip the root prefix if present, then the leading slash.
        let stripped = cleaned.strip_prefix(root).unwrap_or(&cleaned);
        stripped.trim_start_matches('/').to_string()
    } else if cleaned.starts_with("..") {
        // Anything still leading with dot-dot gets the root.
        String::new()
    } else {
        cleaned
    }
}

/// Per-request path state: the server root, the sanitized relative path,
/// the joined absolute path and the virtual selector shown to clients.
/// All operations are lexical; nothing here touches the filesystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestPath {
    root: String,
    rel: String,
    abs: String,
    sel: String,
}

impl RequestPath {
    /// Build from an already-sanitized relative path.
    pub fn new(root: &str, rel: &str) -> Self {
        RequestPath {
            root: root.to_string(),
            rel: rel.to_string(),
            abs: join_paths(root, rel.trim_end_matches('/')),
            sel: rel.to_string(),
        }
    }

    /// Sanitize a raw selector path against the root, then build.
    pub fn sanitized(root: &str, raw: &str) -> Self {
        let rel = sanitize_rel_path(root, raw);
        Self::new(root, &rel)
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn rel(&self) -> &str {
        &self.rel
    }

    pub fn abs(&self) -> &str {
        &self.abs
    }

    /// The selector clients see: the virtual relative path with a leading
    /// slash, the bare root rendering as `/`.
    pub fn selector(&self) -> String {
        if self.sel.is_empty() || self.sel == "." {
            "/".to_string()
        } else {
            format!("/{}", self.sel)
        }
    }

    /// Point this path at a different physical location, keeping the
    /// virtual selector intact.
    pub fn remap_actual(&mut self, new_rel: &str) {
        self.rel = new_rel.to_string();
        self.abs = join_paths(&self.root, new_rel.trim_end_matches('/'));
    }

    /// Change only the selector shown to clients.
    pub fn remap_virtual(&mut self, new_sel: &str) {
        self.sel = new_sel.trim_start_matches('/').to_string();
    }

    pub fn join_rel(&self, ext: &str) -> String {
        join_paths(&self.rel, ext)
    }

    pub fn join_abs(&self, ext: &str) -> String {
        join_paths(&self.abs, ext)
    }

    pub fn join_selector(&self, ext: &str) -> String {
        join_paths(&self.selector(), ext)
    }

    /// Path-component-aware prefix test on the relative path.
    pub fn has_rel_prefix(&self, prefix: &str) -> bool {
        self.rel == prefix || self.rel.starts_with(&format!("{}/", prefix))
    }

    pub fn has_rel_suffix(&self, suffix: &str) -> bool {
        self.rel.ends_with(suffix)
    }

    pub fn has_abs_suffix(&self, suffix: &str) -> bool {
        self.abs.ends_with(suffix)
    }

    /// Relative path with a trailing component and any trailing slash cut.
    pub fn trim_rel_suffix(&self, suffix: &str) -> String {
        self.rel
            .strip_suffix(suffix)
            .unwrap_or(&self.rel)
            .trim_end_matches('/')
            .to_string()
    }
}

/// One compiled remap rule: requests whose relative path matches `regex`
/// are rewritten through `template` (capture references allowed).
#[derive(Debug)]
pub struct FileRemap {
    pub regex: Regex,
    pub template: String,
}

/// Per-configuration path policy: restricted-path regexes plus
/// virtual-to-physical remap rules. For remap rules whose two sides are
/// plain literals a reverse pair is kept so directory listings can surface
/// the virtual name.
#[derive(Debug, Default)]
pub struct PathPolicy {
    restricted: Vec<Regex>,
    remaps: Vec<FileRemap>,
    reverse: Vec<(String, String)>,
}

impl PathPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compile user-supplied restriction patterns and remap entries of the
    /// form `/virtual/path -> /actual/path`.
    pub fn compile(restricted: &[String], remaps: &[String]) -> anyhow::Result<Self> {
        let mut policy = PathPolicy::new();

        for expr in restricted.iter().filter(|e| !e.is_empty()) {
            let regex = Regex::new(expr)
                .with_context(|| format!("failed compiling restriction regex `{}'", expr))?;
            policy.restricted.push(regex);
        }

        for entry in remaps.iter().filter(|e| !e.is_empty()) {
            let (virtual_half, actual_half) = entry
                .split_once(REMAP_SEPARATOR)
                .ok_or_else(|| anyhow!("invalid remap entry `{}'", entry))?;
            let virtual_half = virtual_half.trim().trim_start_matches('/');
            let actual_half = actual_half.trim().trim_start_matches('/');

            // Anchored at the end only: the rule matches any relative path
            // ending in the virtual pattern.
            let regex = Regex::new(&format!("{}$", virtual_half))
                .with_context(|| format!("failed compiling remap regex `{}'", entry))?;
            if is_literal(virtual_half) && !actual_half.contains('$') {
                policy
                    .reverse
                    .push((actual_half.to_string(), virtual_half.to_string()));
            }
            policy.remaps.push(FileRemap {
                regex,
                template: actual_half.to_string(),
            });
        }

        Ok(policy)
    }

    pub fn is_restricted(&self, rel: &str) -> bool {
        self.restricted.iter().any(|regex| regex.is_match(rel))
    }

    /// Rewrite a relative path through the first matching remap rule.
    pub fn remap(&self, rel: &str) -> Option<String> {
        for remap in &self.remaps {
            if let Some(captures) = remap.regex.captures(rel) {
                let mut actual = String::new();
                captures.expand(&remap.template, &mut actual);
                return Some(actual);
            }
        }
        None
    }

    /// Map a physical relative path back to its virtual selector, where a
    /// literal remap pair allows it.
    pub fn reverse_remap(&self, rel: &str) -> Option<&str> {
        self.reverse
            .iter()
            .find(|(actual, _)| actual == rel)
            .map(|(_, virt)| virt.as_str())
    }
}

/// True when a pattern half reads as a plain path. A bare `.` is treated
/// as literal here; filenames are full of them and a dot-for-dot reverse
/// mapping is still sound.
fn is_literal(s: &str) -> bool {
    !s.contains(|c| "\\+*?()|[]{}^$".contains(c))
}
