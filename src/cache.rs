use std::collections::{HashMap, VecDeque};
use std::fs::File;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::{Logger, ServerConfig};
use crate::error::{GophorError, Result};
use crate::gophermap::{self, Section};
use crate::path::RequestPath;
use crate::request::{Request, Responder};

pub const BYTES_PER_MEGABYTE: f64 = 1048576.0;

/// Read a whole file into memory.
pub fn read_file(path: &str) -> Result<Vec<u8>> {
    let mut fd = File::open(path).map_err(GophorError::FileOpen)?;
    let mut contents = Vec::new();
    fd.read_to_end(&mut contents)
        .map_err(GophorError::FileRead)?;
    Ok(contents)
}

/// Nanoseconds since the epoch for a SystemTime, clamped at zero.
fn unix_nanos(time: SystemTime) -> i64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

/// Bounded map with insertion-ordered FIFO eviction: putting a new key at
/// capacity evicts the oldest entry. Replacing an existing key keeps its
/// position.
#[derive(Debug)]
pub struct FixedMap<V> {
    capacity: usize,
    map: HashMap<String, V>,
    order: VecDeque<String>,
}

impl<V> FixedMap<V> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        FixedMap {
            capacity,
            map: HashMap::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
        }
    }

    pub fn get(&self, key: &str) -> Option<&V> {
        self.map.get(key)
    }

    pub fn put(&mut self, key: String, value: V) {
        if self.map.insert(key.clone(), value).is_some() {
            return;
        }
        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.map.remove(&oldest);
            }
        }
        self.order.push_back(key);
    }

    pub fn remove(&mut self, key: &str) {
        if self.map.remove(key).is_some() {
            self.order.retain(|k| k != key);
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = (&String, &V)> {
        self.map.iter()
    }
}

/// Cached content, one variant per load/render behavior. Generated entries
/// are synthetic and never go stale.
#[derive(Debug)]
pub enum Content {
    Generated(Vec<u8>),
    Regular {
        path: RequestPath,
        bytes: Vec<u8>,
    },
    Gophermap {
        path: RequestPath,
        sections: Vec<Section>,
    },
}

impl Content {
    /// Empty content of the right kind for a path; `load` fills it in.
    fn empty_for(path: &RequestPath) -> Content {
        if path.has_abs_suffix("/gophermap") {
            Content::Gophermap {
                path: path.clone(),
                sections: Vec::new(),
            }
        } else {
            Content::Regular {
                path: path.clone(),
                bytes: Vec::new(),
            }
        }
    }

    fn load(&mut self, config: &ServerConfig) -> Result<()> {
        match self {
            Content::Generated(_) => Ok(()),
            Content::Regular { path, bytes } => {
                *bytes = read_file(path.abs())?;
                Ok(())
            }
            Content::Gophermap { path, sections } => {
                *sections = gophermap::parse_gophermap(config, path)?;
                Ok(())
            }
        }
    }

    fn clear(&mut self) {
        match self {
            Content::Generated(_) => {}
            Content::Regular { bytes, .. } => bytes.clear(),
            Content::Gophermap { sections, .. } => sections.clear(),
        }
    }

    fn render<W: Write>(&self, responder: &mut Responder<'_, W>) -> Result<()> {
        match self {
            Content::Generated(bytes) => responder.write_flush(bytes),
            Content::Regular { bytes, .. } => responder.write_flush(bytes),
            Content::Gophermap { sections, .. } => {
                let config = responder.config;
                gophermap::render_sections(sections, responder)?;
                responder.write_flush(&config.footer)
            }
        }
    }
}

/// One cache slot: content behind its own RW lock, plus freshness state the
/// monitor may flip without taking the content lock.
#[derive(Debug)]
pub struct CacheEntry {
    content: RwLock<Content>,
    fresh: AtomicBool,
    last_refresh: AtomicI64,
    generated: bool,
}

impl CacheEntry {
    fn new(content: Content) -> Self {
        let generated = matches!(content, Content::Generated(_));
        CacheEntry {
            content: RwLock::new(content),
            fresh: AtomicBool::new(generated),
            last_refresh: AtomicI64::new(unix_nanos(SystemTime::now())),
            generated,
        }
    }

    fn mark_fresh(&self) {
        self.last_refresh
            .store(unix_nanos(SystemTime::now()), Ordering::SeqCst);
        self.fresh.store(true, Ordering::SeqCst);
    }

    pub fn is_fresh(&self) -> bool {
        self.fresh.load(Ordering::SeqCst)
    }
}

/// Thread-safe file cache keyed by absolute path. The map lock guards
/// membership; each entry's content lock guards loading and rendering.
#[derive(Debug)]
pub struct FileCache {
    map: RwLock<FixedMap<Arc<CacheEntry>>>,
    max_file_bytes: u64,
}

impl FileCache {
    pub fn new(capacity: usize, max_file_bytes: u64) -> Self {
        FileCache {
            map: RwLock::new(FixedMap::new(capacity)),
            max_file_bytes,
        }
    }

    /// Seed a synthetic entry (caps.txt, robots.txt). Startup only, before
    /// any worker runs; never evicted by the monitor.
    pub fn seed_generated(&self, abs: &str, bytes: Vec<u8>) {
        let entry = Arc::new(CacheEntry::new(Content::Generated(bytes)));
        self.map
            .write()
            .expect("cache map lock poisoned")
            .put(abs.to_string(), entry);
    }

    fn lookup(&self, abs: &str) -> Option<Arc<CacheEntry>> {
        self.map
            .read()
            .expect("cache map lock poisoned")
            .get(abs)
            .cloned()
    }

    /// Serve a path straight from the cache if present, bypassing the stat
    /// the dispatcher just failed. Covers generated entries with no file
    /// behind them.
    pub fn render_cached<W: Write>(
        &self,
        abs: &str,
        responder: &mut Responder<'_, W>,
    ) -> Option<Result<()>> {
        let entry = self.lookup(abs)?;
        Some(self.render_entry(&entry, responder))
    }

    /// Fetch a file through the cache: serve a hit (reloading stale
    /// content first), or admit the file on a miss. Oversized files are
    /// never admitted; they stream straight from disk.
    pub fn fetch<W: Write>(
        &self,
        request: &Request,
        responder: &mut Responder<'_, W>,
    ) -> Result<()> {
        let abs = request.path.abs();

        if let Some(entry) = self.lookup(abs) {
            return self.render_entry(&entry, responder);
        }

        // Miss. Open and stat before deciding whether to admit.
        let mut fd = File::open(abs).map_err(GophorError::FileOpen)?;
        let stat = fd.metadata().map_err(GophorError::FileStat)?;

        if stat.len() > self.max_file_bytes {
            return self.serve_uncached(&request.path, &mut fd, responder);
        }

        let entry = Arc::new(CacheEntry::new(Content::empty_for(&request.path)));
        let mut content = entry.content.write().expect("cache entry lock poisoned");
        {
            let mut map = self.map.write().expect("cache map lock poisoned");
            if let Some(existing) = map.get(abs) {
                // Another worker admitted it first; render theirs. Its
                // content lock makes us wait out the load.
                let existing = existing.clone();
                drop(map);
                drop(content);
                return self.render_entry(&existing, responder);
            }
            map.put(abs.to_string(), entry.clone());
        }

        // Load with the map unlocked but the entry write-locked: concurrent
        // fetchers of this path block on the entry, everyone else proceeds.
        if let Err(err) = content.load(responder.config) {
            drop(content);
            self.map
                .write()
                .expect("cache map lock poisoned")
                .remove(abs);
            return Err(err);
        }
        entry.mark_fresh();
        drop(content);

        let content = entry.content.read().expect("cache entry lock poisoned");
        content.render(responder)
    }

    /// Too big (or caching effectively off): gophermaps still render as
    /// menus, everything else streams raw.
    fn serve_uncached<W: Write>(
        &self,
        path: &RequestPath,
        fd: &mut File,
        responder: &mut Responder<'_, W>,
    ) -> Result<()> {
        let config = responder.config;
        if path.has_abs_suffix("/gophermap") {
            let sections = gophermap::parse_gophermap(config, path)?;
            gophermap::render_sections(&sections, responder)?;
            responder.write_flush(&config.footer)
        } else {
            responder.write_raw(fd)
        }
    }

    fn render_entry<W: Write>(
        &self,
        entry: &Arc<CacheEntry>,
        responder: &mut Responder<'_, W>,
    ) -> Result<()> {
        if !entry.is_fresh() {
            let mut content = entry.content.write().expect("cache entry lock poisoned");
            // Re-check: another worker may have reloaded while we waited.
            if !entry.is_fresh() {
                content.clear();
                content.load(responder.config)?;
                entry.mark_fresh();
            }
        }
        let content = entry.content.read().expect("cache entry lock poisoned");
        content.render(responder)
    }

    /// One monitor pass: drop entries whose file vanished, mark entries
    /// stale whose file changed on disk. Runs under the map write lock, so
    /// no render is in flight while the fresh flags flip.
    pub fn check_freshness(&self, sys_log: &Logger) {
        let mut map = self.map.write().expect("cache map lock poisoned");
        let mut dead = Vec::new();
        for (path, entry) in map.entries() {
            if entry.generated {
                continue;
            }
            match std::fs::metadata(path) {
                Err(_) => {
                    sys_log.error("", &format!("failed to stat file in cache: {}", path));
                    dead.push(path.clone());
                }
                Ok(stat) => {
                    let modified = stat.modified().map(unix_nanos).unwrap_or(0);
                    if entry.is_fresh() && entry.last_refresh.load(Ordering::SeqCst) < modified {
                        entry.fresh.store(false, Ordering::SeqCst);
                    }
                }
            }
        }
        for path in dead {
            map.remove(&path);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use std::fs;

    use crate::config::ServerConfig;

    #[test]
    fn fixed_map_evicts_oldest() {
        let mut map = FixedMap::new(2);
        map.put("a".to_string(), 1);
        map.put("b".to_string(), 2);
        map.put("c".to_string(), 3);
        assert_eq!(map.len(), 2);
        assert!(map.get("a").is_none());
        assert_eq!(map.get("b"), Some(&2));
        assert_eq!(map.get("c"), Some(&3));
    }

    #[test]
    fn fixed_map_replace_keeps_size() {
        let mut map = FixedMap::new(2);
        map.put("a".to_string(), 1);
        map.put("b".to_string(), 2);
        map.put("a".to_string(), 10);
        assert_eq!(map.len(), 2);
        assert_eq!(map.get("a"), Some(&10));
        assert_eq!(map.get("b"), Some(&2));
    }

    #[test]
    fn fixed_map_never_exceeds_capacity() {
        let mut map = FixedMap::new(3);
        for i in 0..100 {
            map.put(format!("key{}", i), i);
            assert!(map.len() <= 3);
        }
    }

    #[test]
    fn fixed_map_remove_works() {
        let mut map = FixedMap::new(2);
        map.put("a".to_string(), 1);
        map.remove("a");
        assert!(map.is_empty());
        // Removed key no longer occupies an eviction slot.
        map.put("b".to_string(), 2);
        map.put("c".to_string(), 3);
        assert_eq!(map.len(), 2);
    }

    fn fetch_to_vec(config: &ServerConfig, rel: &str) -> Result<Vec<u8>> {
        let request = Request::sanitized(&config.root, rel, String::new());
        let mut responder = Responder::new(config, "127.0.0.1".to_string(), Vec::new());
        config.cache.fetch(&request, &mut responder)?;
        Ok(responder.writer)
    }

    #[test]
    fn fetch_serves_and_caches() {
        let root = tempfile::tempdir().unwrap();
        fs::write(root.path().join("hello.txt"), b"hello world").unwrap();
        let config = ServerConfig::for_tests(root.path().to_str().unwrap());

        assert_eq!(fetch_to_vec(&config, "hello.txt").unwrap(), b"hello world");

        // Rewrite on disk; without a monitor pass the stale copy serves.
        fs::write(root.path().join("hello.txt"), b"changed").unwrap();
        assert_eq!(fetch_to_vec(&config, "hello.txt").unwrap(), b"hello world");
    }

    #[test]
    fn monitor_pass_triggers_reload() {
        let root = tempfile::tempdir().unwrap();
        fs::write(root.path().join("hello.txt"), b"first").unwrap();
        let config = ServerConfig::for_tests(root.path().to_str().unwrap());

        assert_eq!(fetch_to_vec(&config, "hello.txt").unwrap(), b"first");

        // Push the mtime well past the recorded refresh time.
        fs::write(root.path().join("hello.txt"), b"second").unwrap();
        let future = std::time::SystemTime::now() + std::time::Duration::from_secs(5);
        let file = fs::File::options()
            .append(true)
            .open(root.path().join("hello.txt"))
            .unwrap();
        file.set_modified(future).unwrap();
        drop(file);

        config.cache.check_freshness(&Logger::disabled());
        assert_eq!(fetch_to_vec(&config, "hello.txt").unwrap(), b"second");
    }

    #[test]
    fn monitor_pass_drops_vanished_files() {
        let root = tempfile::tempdir().unwrap();
        fs::write(root.path().join("gone.txt"), b"data").unwrap();
        let config = ServerConfig::for_tests(root.path().to_str().unwrap());

        fetch_to_vec(&config, "gone.txt").unwrap();
        fs::remove_file(root.path().join("gone.txt")).unwrap();
        config.cache.check_freshness(&Logger::disabled());

        assert!(config
            .cache
            .render_cached(
                &format!("{}/gone.txt", root.path().to_str().unwrap()),
                &mut Responder::new(&config, "127.0.0.1".to_string(), Vec::new()),
            )
            .is_none());
    }

    #[test]
    fn oversized_file_streams_without_caching() {
        let root = tempfile::tempdir().unwrap();
        let big = vec![b'x'; 4096];
        fs::write(root.path().join("big.bin"), &big).unwrap();

        let mut config = ServerConfig::for_tests(root.path().to_str().unwrap());
        config.cache = FileCache::new(8, 1024);

        assert_eq!(fetch_to_vec(&config, "big.bin").unwrap(), big);
        assert!(config
            .cache
            .lookup(&format!("{}/big.bin", root.path().to_str().unwrap()))
            .is_none());
    }

    #[test]
    fn generated_entries_survive_monitor() {
        let root = tempfile::tempdir().unwrap();
        let config = ServerConfig::for_tests(root.path().to_str().unwrap());
        let abs = format!("{}/caps.txt", root.path().to_str().unwrap());
        config.cache.seed_generated(&abs, b"CAPS\r\n".to_vec());

        // No file on disk backs the entry; the monitor must leave it alone.
        config.cache.check_freshness(&Logger::disabled());

        let mut responder = Responder::new(&config, "127.0.0.1".to_string(), Vec::new());
        config
            .cache
            .render_cached(&abs, &mut responder)
            .unwrap()
            .unwrap();
        assert_eq!(responder.writer, b"CAPS\r\n");
    }
}
