mod util;

use std::io::{Read, Write};
use std::thread;

use util::Server;

const LASTLINE: &str = ".\r\n";

#[test]
fn serves_file_bytes_exactly() {
    let server = Server::start();
    server.create_file("hello.txt", b"hello, gopher\n");
    assert_eq!(server.request("hello.txt"), b"hello, gopher\n");
}

#[test]
fn serves_root_gophermap() {
    let server = Server::start();
    server.create_file("gophermap", "!Welcome\n1Docs\t/docs\t$hostname\t$port\n");
    let response = server.request_str("");
    let lines: Vec<&str> = response.split("\r\n").collect();
    assert_eq!(lines[0], "iWelcome\tTITLE\tnull.host\t0");
    assert_eq!(lines[1], "1Docs\t/docs\tlocalhost\t70");
    assert!(response.ends_with(LASTLINE));
}

#[test]
fn lists_directory_without_gophermap() {
    let server = Server::start();
    server.create_file("b.txt", b"x");
    server.create_dir("adir");
    let response = server.request_str("");
    let parent = response.find("1..\t/\tlocalhost\t70").expect("no parent entry");
    let dir = response.find("1adir\t/adir\t").expect("no dir entry");
    let file = response.find("0b.txt\t/b.txt\t").expect("no file entry");
    assert!(parent < dir && dir < file);
    assert!(response.ends_with(LASTLINE));
}

#[test]
fn path_escape_is_confined_to_root() {
    let server = Server::start();
    server.create_file("gophermap", "isafe\n");
    let escaped = server.request_str("../../etc/passwd");
    let root = server.request_str("");
    // The traversal lands on the root menu; nothing outside leaks.
    assert_eq!(escaped, root);
    assert!(escaped.starts_with("isafe\tFAKE\tnull.host\t0\r\n"));
}

#[test]
fn url_selector_returns_html_redirect() {
    let server = Server::start();
    let response = server.request_str("URL:https://example.org/");
    assert!(response.contains("<meta http-equiv=\"refresh\""));
    assert!(response.contains("url=https://example.org/"));
    assert!(!response.ends_with(LASTLINE));
}

#[test]
fn submap_renders_inline_with_single_footer() {
    let server = Server::start();
    server.create_dir("sub");
    server.create_file("gophermap", "iroot\n=sub/gophermap\n");
    server.create_file("sub/gophermap", "ihello\n");
    assert_eq!(
        server.request_str(""),
        "iroot\tFAKE\tnull.host\t0\r\nihello\tFAKE\tnull.host\t0\r\n.\r\n"
    );
}

#[test]
fn recursive_submap_directive_is_skipped() {
    let server = Server::start();
    server.create_file("gophermap", "=gophermap\niafter\n");
    assert_eq!(
        server.request_str(""),
        "iafter\tFAKE\tnull.host\t0\r\n.\r\n"
    );
}

#[test]
fn oversized_file_streams_raw() {
    let server = Server::with_config(|config| {
        config.cache = gophor::cache::FileCache::new(8, 1024);
    });
    let big: Vec<u8> = (0..1024 * 1024).map(|i| (i % 251) as u8).collect();
    server.create_file("big.bin", &big);
    assert_eq!(server.request("big.bin"), big);

    // Not cached: a rewrite is visible immediately, no monitor needed.
    let changed = vec![0u8; 2048];
    server.create_file("big.bin", &changed);
    assert_eq!(server.request("big.bin"), changed);
}

#[test]
fn missing_file_maps_to_not_found() {
    let server = Server::start();
    assert_eq!(
        server.request_str("no-such-file.txt"),
        "3404 Not Found\tTITLE\tnull.host\t0\r\n.\r\n"
    );
}

#[test]
fn restricted_path_maps_to_forbidden() {
    let server = Server::with_config(|config| {
        config.policy =
            gophor::path::PathPolicy::compile(&["^secret".to_string()], &[]).unwrap();
    });
    server.create_file("secret.txt", b"classified");
    assert_eq!(
        server.request_str("secret.txt"),
        "3403 Forbidden\tTITLE\tnull.host\t0\r\n.\r\n"
    );
}

#[test]
fn http_request_maps_to_bad_request() {
    let server = Server::start();
    assert_eq!(
        server.request_str("GET / HTTP/1.1"),
        "3400 Bad Request\tTITLE\tnull.host\t0\r\n.\r\n"
    );
}

#[test]
fn bytes_after_tab_are_ignored() {
    let server = Server::start();
    server.create_file("hello.txt", b"hello");
    assert_eq!(server.request("hello.txt\tsearch terms"), b"hello");
}

#[test]
fn percent_encoded_selector_resolves() {
    let server = Server::start();
    server.create_file("some file.txt", b"spaced out");
    assert_eq!(server.request("some%20file.txt"), b"spaced out");
}

#[test]
fn generated_caps_txt_is_served() {
    let server = Server::start();
    let caps = server.request_str("caps.txt");
    assert!(caps.starts_with("CAPS\r\n"));
    assert!(caps.contains("ServerDescription=test server"));
}

#[test]
fn on_disk_caps_txt_wins_over_generated() {
    let server = Server::start();
    server.create_file("caps.txt", b"hand written caps");
    assert_eq!(server.request("caps.txt"), b"hand written caps");
}

#[test]
fn cgi_script_output_is_served() {
    let server = Server::start();
    server.create_dir("cgi-bin");
    server.create_script(
        "cgi-bin/greet",
        "#!/bin/sh\nprintf 'ihi %s\\tFAKE\\tnull.host\\t0\\r\\n' \"$QUERY_STRING\"\n",
    );
    assert_eq!(
        server.request_str("cgi-bin/greet?world"),
        "ihi world\tFAKE\tnull.host\t0\r\n"
    );
}

#[test]
fn cgi_disabled_hides_scripts_as_not_found() {
    let server = Server::with_config(|config| {
        config.cgi_enabled = false;
    });
    server.create_dir("cgi-bin");
    server.create_script("cgi-bin/greet", "#!/bin/sh\necho hi\n");
    assert_eq!(
        server.request_str("cgi-bin/greet"),
        "3404 Not Found\tTITLE\tnull.host\t0\r\n.\r\n"
    );
}

#[test]
fn cgi_http_error_status_diverts_to_error_line() {
    let server = Server::with_config(|config| {
        config.http_compat_cgi = true;
    });
    server.create_dir("cgi-bin");
    server.create_script(
        "cgi-bin/gone",
        "#!/bin/sh\nprintf 'Content-Type: text/plain\\r\\nStatus: 404 Not Found\\r\\n\\r\\nsecret body'\n",
    );
    let response = server.request_str("cgi-bin/gone");
    assert_eq!(response, "3404 Not Found\tTITLE\tnull.host\t0\r\n.\r\n");
    assert!(!response.contains("secret body"));
}

#[test]
fn cgi_http_headers_are_stripped_on_200() {
    let server = Server::with_config(|config| {
        config.http_compat_cgi = true;
    });
    server.create_dir("cgi-bin");
    server.create_script(
        "cgi-bin/ok",
        "#!/bin/sh\nprintf 'Content-Type: text/plain\\r\\nStatus: 200 OK\\r\\n\\r\\nplain body'\n",
    );
    assert_eq!(server.request("cgi-bin/ok"), b"plain body");
}

#[test]
fn executable_gophermap_runs() {
    let server = Server::start();
    server.create_dir("dyn");
    server.create_script(
        "dyn/gophermap",
        "#!/bin/sh\nprintf 'igenerated\\tFAKE\\tnull.host\\t0\\r\\n.\\r\\n'\n",
    );
    assert_eq!(
        server.request_str("dyn"),
        "igenerated\tFAKE\tnull.host\t0\r\n.\r\n"
    );
}

#[test]
fn remapped_selector_serves_backing_file() {
    let server = Server::with_config(|config| {
        config.policy = gophor::path::PathPolicy::compile(
            &[],
            &["/virtual.txt -> /storage/actual.txt".to_string()],
        )
        .unwrap();
    });
    server.create_dir("storage");
    server.create_file("storage/actual.txt", b"the real bytes");
    assert_eq!(server.request("virtual.txt"), b"the real bytes");

    // The listing surfaces the virtual name for the physical file.
    let listing = server.request_str("storage");
    assert!(listing.contains("0actual.txt\t/virtual.txt\tlocalhost\t70"));
}

#[test]
fn concurrent_cold_fetches_agree() {
    let server = Server::start();
    server.create_file("shared.txt", b"one consistent view");

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let response = server.stream();
            thread::spawn(move || {
                let mut stream = response;
                write!(stream, "shared.txt\r\n").unwrap();
                let mut buf = Vec::new();
                stream.read_to_end(&mut buf).unwrap();
                buf
            })
        })
        .collect();

    for handle in handles {
        assert_eq!(handle.join().unwrap(), b"one consistent view");
    }
}

#[test]
fn overlong_selector_line_is_dropped() {
    let server = Server::start();
    let mut stream = server.stream();
    stream
        .set_read_timeout(Some(std::time::Duration::from_secs(5)))
        .unwrap();
    let long = vec![b'a'; 16 * 1024];
    // The server may cut us off mid-write; only the response matters.
    let _ = stream.write_all(&long);
    let _ = stream.write_all(b"\r\n");
    let mut buf = Vec::new();
    // Connection closes with no response bytes at all.
    let _ = stream.read_to_end(&mut buf);
    assert!(buf.is_empty());
}

#[test]
fn gophermap_hides_directed_files_in_listing() {
    let server = Server::start();
    server.create_file("gophermap", "imenu\n-hidden.txt\n*\n");
    server.create_file("hidden.txt", b"x");
    server.create_file("visible.txt", b"x");
    let response = server.request_str("");
    assert!(response.contains("visible.txt"));
    assert!(!response.contains("hidden.txt"));
    // The gophermap itself stays out of its own listing.
    assert!(!response.contains("0gophermap"));
}

#[test]
fn file_include_reflows_text() {
    let server = Server::with_config(|config| {
        config.page_width = 8;
    });
    server.create_file("gophermap", "=notes.txt\n");
    server.create_file("notes.txt", b"abcdefghijkl\n");
    let response = server.request_str("");
    assert!(response.starts_with(
        "iabcdefgh\tFAKE\tnull.host\t0\r\niijkl\tFAKE\tnull.host\t0\r\n"
    ));
}
