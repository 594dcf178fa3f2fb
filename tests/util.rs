use std::fs::{self, File};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tempfile::{tempdir, TempDir};

use gophor::cache::FileCache;
use gophor::cgi;
use gophor::config::{ConnHost, Logger, ServerConfig};
use gophor::gopher;
use gophor::path::PathPolicy;
use gophor::policy;
use gophor::worker;

/// An in-process server on an ephemeral port with a throwaway root.
pub struct Server {
    root: TempDir,
    port: u16,
}

impl Server {
    pub fn start() -> Self {
        Self::with_config(|_| {})
    }

    pub fn with_config(configure: impl FnOnce(&mut ServerConfig)) -> Self {
        let root = tempdir().expect("failed to create tempdir");
        let mut config = base_config(root.path());
        configure(&mut config);

        let listener = TcpListener::bind("127.0.0.1:0").expect("failed to bind listener");
        let port = listener.local_addr().unwrap().port();

        let config = Arc::new(config);
        policy::cache_policy_files(&config, "test server", "admin@example.org", "");

        thread::spawn(move || {
            for stream in listener.incoming() {
                match stream {
                    Ok(stream) => {
                        let config = Arc::clone(&config);
                        thread::spawn(move || worker::serve(stream, &config));
                    }
                    Err(_) => break,
                }
            }
        });

        Server { root, port }
    }

    pub fn root(&self) -> &Path {
        self.root.path()
    }

    pub fn create_dir(&self, name: &str) {
        fs::create_dir_all(self.root().join(name)).expect("failed to create directory");
    }

    pub fn create_file(&self, name: &str, contents: impl AsRef<[u8]>) {
        fs::write(self.root().join(name), contents).expect("failed to create file");
    }

    pub fn create_script(&self, name: &str, body: &str) -> File {
        let path = self.root().join(name);
        fs::write(&path, body).expect("failed to create script");
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755))
            .expect("failed to set script permissions");
        File::open(path).expect("failed to reopen script")
    }

    pub fn stream(&self) -> TcpStream {
        TcpStream::connect(("127.0.0.1", self.port)).expect("failed to connect to server")
    }

    /// Send one selector line and read the whole response.
    pub fn request(&self, selector: &str) -> Vec<u8> {
        let mut stream = self.stream();
        // Set timeouts to prevent tests from hanging.
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream
            .set_write_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        write!(stream, "{}\r\n", selector).unwrap();
        let mut buf = Vec::new();
        stream
            .read_to_end(&mut buf)
            .expect("failed to read response");
        buf
    }

    pub fn request_str(&self, selector: &str) -> String {
        String::from_utf8(self.request(selector)).expect("response is not valid UTF-8")
    }
}

fn base_config(root: &Path) -> ServerConfig {
    ServerConfig {
        root: root.to_str().expect("path is not valid UTF-8").to_string(),
        host: ConnHost {
            name: "localhost".to_string(),
            bind_port: "70".to_string(),
            fwd_port: "70".to_string(),
        },
        policy: PathPolicy::new(),
        cache: FileCache::new(64, 1024 * 1024),
        page_width: 80,
        charset: "utf-8".to_string(),
        footer: gopher::format_footer("", true, 80),
        sys_log: Logger::disabled(),
        acc_log: Logger::disabled(),
        cgi_enabled: true,
        http_compat_cgi: false,
        cgi_bin_dir: "cgi-bin".to_string(),
        cgi_env: cgi::initial_cgi_env("/usr/bin:/bin", "utf-8", 80),
        max_exec_time: Duration::from_secs(3),
        socket_write_buf: 4096,
        socket_read_buf: 1024,
        socket_read_max: 4096,
        skip_prefix_buf: 4096,
        socket_read_timeout: Duration::from_secs(5),
        socket_write_timeout: Duration::from_secs(10),
    }
}
