//! End-to-end requests against both backends over real sockets.

use std::{
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use tandem::{
    Application, BackendKind, Cookie, Kernel, Response, Server, ServerConfig, ServerHandle,
    VerifyCsrfToken,
    events::RequestHandled,
    http::{ByteRange, Request},
    middleware::LoggerMiddleware,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};

const REPORT: &[u8] = b"quarterly numbers, all of them good";

static SERVERS: AtomicUsize = AtomicUsize::new(0);

struct Running {
    handle: ServerHandle,
    handled: Arc<AtomicUsize>,
    report: PathBuf,
}

fn start(backend: BackendKind) -> Running {
    let report = std::env::temp_dir().join(format!(
        "tandem-report-{}-{}-{}.txt",
        backend.as_str(),
        std::process::id(),
        SERVERS.fetch_add(1, Ordering::SeqCst)
    ));
    std::fs::write(&report, REPORT).unwrap();

    let download = report.clone();
    let kernel = Kernel::builder()
        .middleware(LoggerMiddleware)
        .middleware(VerifyCsrfToken::new().except("/hooks/*"))
        .handler(move |req: Request| {
            let download = download.clone();
            async move {
                match req.path() {
                    "/download" => {
                        Response::download(&download, Some("report.txt"), ByteRange::FULL).await
                    }
                    "/submit" | "/hooks/deploy" => Ok(Response::html("accepted")),
                    _ => Ok(Response::html("home").with_cookie(Cookie::new("theme", "dark"))),
                }
            }
        })
        .build();

    let handled = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&handled);
    let app = Application::new(kernel).listen(move |_: &RequestHandled| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let config = ServerConfig {
        port: 0,
        workers: 2,
        backend,
        ..ServerConfig::default()
    };
    let handle = Server::new(config, app).start().unwrap();
    Running {
        handle,
        handled,
        report,
    }
}

async fn send(running: &Running, raw: &str) -> String {
    let mut stream = TcpStream::connect(running.handle.local_addr()).await.unwrap();
    stream.write_all(raw.as_bytes()).await.unwrap();
    let mut out = Vec::new();
    stream.read_to_end(&mut out).await.unwrap();
    String::from_utf8_lossy(&out).into_owned()
}

fn set_cookies(raw: &str) -> Vec<&str> {
    raw.split("\r\n\r\n")
        .next()
        .unwrap_or_default()
        .lines()
        .filter_map(|line| line.strip_prefix("Set-Cookie: "))
        .collect()
}

fn token(raw: &str) -> String {
    set_cookies(raw)
        .into_iter()
        .find_map(|line| line.strip_prefix("X-XSRF-TOKEN="))
        .and_then(|rest| rest.split(';').next())
        .unwrap()
        .to_owned()
}

async fn exercise(backend: BackendKind) {
    let running = start(backend);
    assert_eq!(running.handle.backend(), backend);

    let home = send(&running, "GET / HTTP/1.1\r\nHost: test\r\nConnection: close\r\n\r\n").await;
    assert!(home.starts_with("HTTP/1.1 200 OK\r\n"), "{home}");
    assert!(home.ends_with("home"));
    let cookies = set_cookies(&home);
    assert_eq!(cookies.len(), 2, "{cookies:?}");
    assert!(cookies.contains(&"theme=dark"));
    let issued = token(&home);
    assert_eq!(issued.len(), 64);

    let accepted = send(
        &running,
        &format!(
            "POST /submit HTTP/1.1\r\nHost: test\r\nCookie: X-XSRF-TOKEN={issued}\r\n\
             X-XSRF-TOKEN: {issued}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
        ),
    )
    .await;
    assert!(accepted.starts_with("HTTP/1.1 200 OK\r\n"), "{accepted}");
    assert_ne!(token(&accepted), issued);

    let form = format!("_token={issued}&name=jane");
    let via_form = send(
        &running,
        &format!(
            "POST /submit HTTP/1.1\r\nHost: test\r\nCookie: X-XSRF-TOKEN={issued}\r\n\
             Content-Type: application/x-www-form-urlencoded\r\nContent-Length: {}\r\n\
             Connection: close\r\n\r\n{form}",
            form.len()
        ),
    )
    .await;
    assert!(via_form.starts_with("HTTP/1.1 200 OK\r\n"), "{via_form}");

    let rejected = send(
        &running,
        &format!(
            "POST /submit HTTP/1.1\r\nHost: test\r\nCookie: X-XSRF-TOKEN={issued}\r\n\
             X-CSRF-TOKEN: forged\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
        ),
    )
    .await;
    assert!(rejected.starts_with("HTTP/1.1 419 Page Expired\r\n"), "{rejected}");
    assert!(set_cookies(&rejected).is_empty());

    let hook = send(
        &running,
        "POST /hooks/deploy HTTP/1.1\r\nHost: test\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
    )
    .await;
    assert!(hook.starts_with("HTTP/1.1 200 OK\r\n"), "{hook}");

    let download = send(
        &running,
        "GET /download HTTP/1.1\r\nHost: test\r\nConnection: close\r\n\r\n",
    )
    .await;
    assert!(download.starts_with("HTTP/1.1 200 OK\r\n"), "{download}");
    assert!(download.contains("Content-Disposition: attachment;filename=\"report.txt\"\r\n"));
    let body = download.split_once("\r\n\r\n").map(|(_, body)| body).unwrap();
    assert!(body.contains(std::str::from_utf8(REPORT).unwrap()));

    let malformed = send(&running, "GET / HTTP/1.1\r\nBad Header\r\n\r\n").await;
    assert!(malformed.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{malformed}");

    let Running {
        handle,
        handled,
        report,
    } = running;
    handle.stop().await;
    std::fs::remove_file(report).unwrap();

    // The malformed request never reached the kernel.
    assert_eq!(handled.load(Ordering::SeqCst), 6);
}

#[tokio::test]
async fn prefork_backend_serves_the_pipeline() {
    exercise(BackendKind::Prefork).await;
}

#[tokio::test]
async fn dispatch_backend_serves_the_pipeline() {
    exercise(BackendKind::Dispatch).await;
}

#[tokio::test]
async fn keep_alive_serves_sequential_requests_on_one_connection() {
    for backend in [BackendKind::Prefork, BackendKind::Dispatch] {
        let running = start(backend);
        let mut stream = TcpStream::connect(running.handle.local_addr()).await.unwrap();
        stream
            .write_all(b"GET / HTTP/1.1\r\nHost: test\r\n\r\nGET / HTTP/1.1\r\nHost: test\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        let raw = String::from_utf8_lossy(&out);
        assert_eq!(raw.matches("HTTP/1.1 200 OK\r\n").count(), 2, "{backend:?}: {raw}");
        assert!(raw.contains("Connection: keep-alive\r\n"));

        let Running { handle, report, .. } = running;
        handle.stop().await;
        std::fs::remove_file(report).unwrap();
    }
}
