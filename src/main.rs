use std::io;
use std::net::TcpListener;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use nix::sys::signal::{signal, SigHandler, Signal};
use nix::unistd::{getgid, getuid};

use gophor::cache::{FileCache, BYTES_PER_MEGABYTE};
use gophor::cgi;
use gophor::config::{ConnHost, Logger, ServerConfig};
use gophor::gopher;
use gophor::path::PathPolicy;
use gophor::policy;
use gophor::worker;

static RUNNING: AtomicBool = AtomicBool::new(true);

extern "C" fn stop_running(_signal: libc::c_int) {
    RUNNING.store(false, Ordering::Relaxed);
}

fn is_running() -> bool {
    RUNNING.load(Ordering::Relaxed)
}

/// Prints message to standard error and exits with code 1.
macro_rules! abort {
    ($($arg:tt)*) => ({
        eprint!("{}: ", env!("CARGO_PKG_NAME"));
        eprintln!($($arg)*);
        std::process::exit(1);
    })
}

fn usage(argv0: &str) {
    print!(
        "usage:\t{} /path/to/gopherroot [flags]\n\n\
        flags:\t--port number (default: 70)\n\
        \t\tPort to listen on for connections.\n\n\
        \t--addr ip (default: all)\n\
        \t\tInterface address to bind the listening port to.\n\n\
        \t--hostname name (default: --addr value)\n\
        \t\tFQDN advertised in menus and the CGI environment.\n\n\
        \t--fwd-port number (default: --port value)\n\
        \t\tPort advertised in menus, for use behind a port forward.\n\n\
        \t--system-log filename, --access-log filename (default: stderr)\n\
        \t\tLog file destinations, used with `--log-output file'.\n\n\
        \t--log-output disable|stderr|file (default: stderr)\n\
        \t\tLog handling.\n\n\
        \t--log-opts opts (default: timestamp,ip)\n\
        \t\tComma-separated log line options (timestamp|ip).\n\n\
        \t--page-width number (default: 80)\n\
        \t\tPage width used when reflowing included text files.\n\n\
        \t--charset string (default: utf-8)\n\
        \t\tCharset advertised to CGI scripts.\n\n\
        \t--footer text (default: a short banner)\n\
        \t\tGophermap footer text (new-line separated lines).\n\n\
        \t--no-footer-separator\n\
        \t\tDisable the footer separator line.\n\n\
        \t--restrict regex\n\
        \t\tRestrict matching relative paths from being served.\n\
        \t\tMay be specified multiple times.\n\n\
        \t--remap \"/virtual/path -> /actual/path\"\n\
        \t\tServe a virtual path from another location under the root.\n\
        \t\tMay be specified multiple times.\n\n\
        \t--cache-size number (default: 50)\n\
        \t\tFile cache size, measured in file count.\n\n\
        \t--cache-file-max mb (default: 0.5)\n\
        \t\tLargest file size to cache, in megabytes.\n\n\
        \t--disable-cache\n\
        \t\tDisable file caching.\n\n\
        \t--file-monitor-freq secs (default: 60)\n\
        \t\tFile cache freshness check frequency.\n\n\
        \t--cgi-dir dir (default: cgi-bin)\n\
        \t\tCGI scripts directory, relative to the root.\n\n\
        \t--disable-cgi\n\
        \t\tDisable CGI and all executable support.\n\n\
        \t--http-compat-cgi\n\
        \t\tStrip HTTP headers from CGI script output.\n\n\
        \t--http-header-buf bytes (default: 4096)\n\
        \t\tRead-ahead buffer size used when stripping HTTP headers.\n\n\
        \t--safe-path path (default: /usr/bin:/bin)\n\
        \t\tPATH variable handed to executed scripts.\n\n\
        \t--max-exec-time secs (default: 3)\n\
        \t\tMaximum CGI script and executable gophermap runtime.\n\n\
        \t--socket-read-buf bytes (default: 256)\n\
        \t--socket-write-buf bytes (default: 4096)\n\
        \t\tConnection buffer sizes.\n\n\
        \t--socket-read-max count (default: 8)\n\
        \t\tMax selector line length, as a multiple of the read buffer.\n\n\
        \t--socket-read-timeout secs (default: 5)\n\
        \t--socket-write-timeout secs (default: 30)\n\
        \t\tConnection deadlines.\n\n\
        \t--description text, --admin-email text, --geoloc text\n\
        \t\tFields of the generated caps.txt.\n\n\
        \t--version\n\
        \t\tPrint version information.\n\n",
        argv0,
    );
}

#[derive(Debug)]
struct Options {
    root: String,
    bind_addr: String,
    port: u16,
    fwd_port: u16,
    hostname: String,
    system_log: String,
    access_log: String,
    log_output: String,
    log_timestamp: bool,
    log_ip: bool,
    page_width: usize,
    charset: String,
    footer_text: String,
    footer_separator: bool,
    restricted: Vec<String>,
    remaps: Vec<String>,
    cache_size: usize,
    cache_file_max_mb: f64,
    cache_disabled: bool,
    monitor_freq: u64,
    cgi_dir: String,
    cgi_disabled: bool,
    http_compat_cgi: bool,
    http_header_buf: usize,
    safe_path: String,
    max_exec_time: u64,
    socket_read_buf: usize,
    socket_write_buf: usize,
    socket_read_max: usize,
    socket_read_timeout: u64,
    socket_write_timeout: u64,
    description: String,
    admin_email: String,
    geoloc: String,
}

impl Options {
    fn new() -> Self {
        Options {
            root: String::new(),
            bind_addr: String::new(),
            port: 70,
            fwd_port: 0,
            hostname: String::new(),
            system_log: String::new(),
            access_log: String::new(),
            log_output: "stderr".to_string(),
            log_timestamp: true,
            log_ip: true,
            page_width: 80,
            charset: "utf-8".to_string(),
            footer_text: format!(" {}, a Gopher server in Rust.", env!("CARGO_PKG_NAME")),
            footer_separator: true,
            restricted: Vec::new(),
            remaps: Vec::new(),
            cache_size: 50,
            cache_file_max_mb: 0.5,
            cache_disabled: false,
            monitor_freq: 60,
            cgi_dir: "cgi-bin".to_string(),
            cgi_disabled: false,
            http_compat_cgi: false,
            http_header_buf: 4096,
            safe_path: "/usr/bin:/bin".to_string(),
            max_exec_time: 3,
            socket_read_buf: 256,
            socket_write_buf: 4096,
            socket_read_max: 8,
            socket_read_timeout: 5,
            socket_write_timeout: 30,
            description: format!("{}, a Gopher server in Rust.", env!("CARGO_PKG_NAME")),
            admin_email: String::new(),
            geoloc: String::new(),
        }
    }
}

fn parse_commandline() -> Result<Options> {
    let mut opts = Options::new();
    let mut args = std::env::args();

    let name = args.next().expect("expected at least one argument");

    match args.next().as_deref() {
        None | Some("--help") => {
            usage(&name);
            std::process::exit(0);
        }
        Some("--version") => {
            println!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
            std::process::exit(0);
        }
        Some(root) => {
            opts.root = root.trim_end_matches('/').to_string();
        }
    }

    while let Some(arg) = args.next().as_deref() {
        match arg {
            "--port" => {
                let number = args.next().context("missing number after --port")?;
                opts.port = number
                    .parse()
                    .with_context(|| format!("port number {} is invalid", number))?;
            }
            "--addr" => {
                opts.bind_addr = args.next().context("missing ip after --addr")?;
            }
            "--hostname" => {
                opts.hostname = args.next().context("missing name after --hostname")?;
            }
            "--fwd-port" => {
                let number = args.next().context("missing number after --fwd-port")?;
                opts.fwd_port = number
                    .parse()
                    .with_context(|| format!("fwd-port number {} is invalid", number))?;
            }
            "--system-log" => {
                opts.system_log = args.next().context("missing filename after --system-log")?;
            }
            "--access-log" => {
                opts.access_log = args.next().context("missing filename after --access-log")?;
            }
            "--log-output" => {
                let output = args.next().context("missing mode after --log-output")?;
                if !matches!(output.as_str(), "disable" | "stderr" | "file") {
                    return Err(anyhow!("log-output mode {} is invalid", output));
                }
                opts.log_output = output;
            }
            "--log-opts" => {
                let log_opts = args.next().context("missing options after --log-opts")?;
                opts.log_timestamp = false;
                opts.log_ip = false;
                for opt in log_opts.split(',').filter(|o| !o.is_empty()) {
                    match opt {
                        "timestamp" => opts.log_timestamp = true,
                        "ip" => opts.log_ip = true,
                        _ => return Err(anyhow!("unknown log option `{}'", opt)),
                    }
                }
            }
            "--page-width" => {
                let number = args.next().context("missing number after --page-width")?;
                opts.page_width = number
                    .parse()
                    .with_context(|| format!("page-width number {} is invalid", number))?;
            }
            "--charset" => {
                opts.charset = args.next().context("missing string after --charset")?;
            }
            "--footer" => {
                opts.footer_text = args.next().context("missing text after --footer")?;
            }
            "--no-footer-separator" => opts.footer_separator = false,
            "--restrict" => {
                opts.restricted
                    .push(args.next().context("missing regex after --restrict")?);
            }
            "--remap" => {
                opts.remaps
                    .push(args.next().context("missing entry after --remap")?);
            }
            "--cache-size" => {
                let number = args.next().context("missing number after --cache-size")?;
                opts.cache_size = number
                    .parse()
                    .with_context(|| format!("cache-size number {} is invalid", number))?;
            }
            "--cache-file-max" => {
                let number = args.next().context("missing number after --cache-file-max")?;
                opts.cache_file_max_mb = number
                    .parse()
                    .with_context(|| format!("cache-file-max number {} is invalid", number))?;
            }
            "--disable-cache" => opts.cache_disabled = true,
            "--file-monitor-freq" => {
                let number = args
                    .next()
                    .context("missing number after --file-monitor-freq")?;
                opts.monitor_freq = number
                    .parse()
                    .with_context(|| format!("file-monitor-freq number {} is invalid", number))?;
            }
            "--cgi-dir" => {
                let dir = args.next().context("missing dir after --cgi-dir")?;
                opts.cgi_dir = dir.trim_matches('/').to_string();
            }
            "--disable-cgi" => opts.cgi_disabled = true,
            "--http-compat-cgi" => opts.http_compat_cgi = true,
            "--http-header-buf" => {
                let number = args.next().context("missing number after --http-header-buf")?;
                opts.http_header_buf = number
                    .parse()
                    .with_context(|| format!("http-header-buf number {} is invalid", number))?;
            }
            "--safe-path" => {
                opts.safe_path = args.next().context("missing path after --safe-path")?;
            }
            "--max-exec-time" => {
                let number = args.next().context("missing number after --max-exec-time")?;
                opts.max_exec_time = number
                    .parse()
                    .with_context(|| format!("max-exec-time number {} is invalid", number))?;
            }
            "--socket-read-buf" => {
                let number = args.next().context("missing number after --socket-read-buf")?;
                opts.socket_read_buf = number
                    .parse()
                    .with_context(|| format!("socket-read-buf number {} is invalid", number))?;
            }
            "--socket-write-buf" => {
                let number = args.next().context("missing number after --socket-write-buf")?;
                opts.socket_write_buf = number
                    .parse()
                    .with_context(|| format!("socket-write-buf number {} is invalid", number))?;
            }
            "--socket-read-max" => {
                let number = args.next().context("missing number after --socket-read-max")?;
                opts.socket_read_max = number
                    .parse()
                    .with_context(|| format!("socket-read-max number {} is invalid", number))?;
            }
            "--socket-read-timeout" => {
                let number = args
                    .next()
                    .context("missing number after --socket-read-timeout")?;
                opts.socket_read_timeout = number
                    .parse()
                    .with_context(|| format!("socket-read-timeout number {} is invalid", number))?;
            }
            "--socket-write-timeout" => {
                let number = args
                    .next()
                    .context("missing number after --socket-write-timeout")?;
                opts.socket_write_timeout = number.parse().with_context(|| {
                    format!("socket-write-timeout number {} is invalid", number)
                })?;
            }
            "--description" => {
                opts.description = args.next().context("missing text after --description")?;
            }
            "--admin-email" => {
                opts.admin_email = args.next().context("missing text after --admin-email")?;
            }
            "--geoloc" => {
                opts.geoloc = args.next().context("missing text after --geoloc")?;
            }
            _ => {
                return Err(anyhow!("unknown argument `{}'", arg));
            }
        }
    }
    Ok(opts)
}

fn build_logger(output: &str, path: &str, timestamp: bool, prefix: bool) -> Result<Logger> {
    match output {
        "disable" => Ok(Logger::disabled()),
        "file" => {
            if path.is_empty() {
                return Err(anyhow!("log-output `file' requires a log file path"));
            }
            Logger::file(path, timestamp, prefix)
        }
        _ => Ok(Logger::stderr(timestamp, prefix)),
    }
}

fn build_config(opts: &Options) -> Result<ServerConfig> {
    let hostname = if !opts.hostname.is_empty() {
        opts.hostname.clone()
    } else if !opts.bind_addr.is_empty() {
        opts.bind_addr.clone()
    } else {
        return Err(anyhow!("cannot have both --addr and --hostname empty"));
    };

    let fwd_port = if opts.fwd_port != 0 {
        opts.fwd_port
    } else {
        opts.port
    };

    let sys_log = build_logger(&opts.log_output, &opts.system_log, opts.log_timestamp, false)
        .context("failed to build system log")?;
    let acc_log = build_logger(&opts.log_output, &opts.access_log, opts.log_timestamp, opts.log_ip)
        .context("failed to build access log")?;

    let policy = PathPolicy::compile(&opts.restricted, &opts.remaps)
        .context("failed to compile path policy")?;

    // A disabled cache is a cache that admits nothing.
    let cache = if opts.cache_disabled {
        FileCache::new(2, 0)
    } else {
        FileCache::new(
            opts.cache_size,
            (BYTES_PER_MEGABYTE * opts.cache_file_max_mb) as u64,
        )
    };

    Ok(ServerConfig {
        root: opts.root.clone(),
        host: ConnHost {
            name: hostname,
            bind_port: opts.port.to_string(),
            fwd_port: fwd_port.to_string(),
        },
        policy,
        cache,
        page_width: opts.page_width,
        charset: opts.charset.clone(),
        footer: gopher::format_footer(&opts.footer_text, opts.footer_separator, opts.page_width),
        sys_log,
        acc_log,
        cgi_enabled: !opts.cgi_disabled,
        http_compat_cgi: opts.http_compat_cgi,
        cgi_bin_dir: opts.cgi_dir.clone(),
        cgi_env: cgi::initial_cgi_env(&opts.safe_path, &opts.charset, opts.page_width),
        max_exec_time: Duration::from_secs(opts.max_exec_time),
        socket_write_buf: opts.socket_write_buf,
        socket_read_buf: opts.socket_read_buf,
        socket_read_max: opts.socket_read_buf * opts.socket_read_max,
        skip_prefix_buf: opts.http_header_buf,
        socket_read_timeout: Duration::from_secs(opts.socket_read_timeout),
        socket_write_timeout: Duration::from_secs(opts.socket_write_timeout),
    })
}

fn main() -> Result<()> {
    println!(
        "{}/{}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
    );

    let opts = parse_commandline()?;

    if getuid().is_root() || getgid().as_raw() == 0 {
        abort!("refusing to run as root");
    }

    if std::fs::metadata(&opts.root)
        .map(|stat| !stat.is_dir())
        .unwrap_or(true)
    {
        abort!("server root {} is not a directory", opts.root);
    }

    let config = Arc::new(build_config(&opts)?);

    if config.cgi_enabled {
        config.sys_log.info("", "CGI support enabled");
        config
            .sys_log
            .info("", &format!("CGI scripts directory: {}", config.cgi_bin_dir));
        if config.http_compat_cgi {
            config
                .sys_log
                .info("", "Enabling HTTP CGI script compatibility");
        }
    } else {
        config.sys_log.info("", "CGI support disabled");
    }

    policy::cache_policy_files(&config, &opts.description, &opts.admin_email, &opts.geoloc);

    // Signal handlers: flip the run flag so the accept loop can exit.
    unsafe { signal(Signal::SIGPIPE, SigHandler::SigIgn) }
        .context("failed to set SIGPIPE handler")?;
    unsafe { signal(Signal::SIGINT, SigHandler::Handler(stop_running)) }
        .context("failed to set SIGINT handler")?;
    unsafe { signal(Signal::SIGTERM, SigHandler::Handler(stop_running)) }
        .context("failed to set SIGTERM handler")?;

    // Background freshness monitor for the file cache.
    if !opts.cache_disabled && opts.monitor_freq > 0 {
        let monitor_config = Arc::clone(&config);
        let freq = Duration::from_secs(opts.monitor_freq);
        thread::spawn(move || loop {
            thread::sleep(freq);
            monitor_config
                .cache
                .check_freshness(&monitor_config.sys_log);
        });
        config.sys_log.info(
            "",
            &format!(
                "File caching enabled with: maxcount={} maxsize={:.3}MB checkfreq={}s",
                opts.cache_size, opts.cache_file_max_mb, opts.monitor_freq
            ),
        );
    } else {
        config.sys_log.info("", "File caching disabled");
    }

    let bind_addr = if opts.bind_addr.is_empty() {
        "0.0.0.0"
    } else {
        opts.bind_addr.as_str()
    };
    let listener = TcpListener::bind((bind_addr, opts.port))
        .with_context(|| format!("failed to bind {}:{}", bind_addr, opts.port))?;

    config.sys_log.info(
        "",
        &format!(
            "Listening on: gopher://{}:{} ({}:{})",
            config.hostname(),
            config.port(),
            bind_addr,
            config.host.bind_port
        ),
    );

    while is_running() {
        match listener.accept() {
            Ok((stream, _)) => {
                let worker_config = Arc::clone(&config);
                thread::spawn(move || worker::serve(stream, &worker_config));
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                config
                    .sys_log
                    .error("", &format!("error accepting connection: {}", err));
            }
        }
    }

    config.sys_log.info("", "Signal received. Shutting down...");
    Ok(())
}
