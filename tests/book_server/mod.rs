use std::collections::HashMap;
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::Duration;

/// Static HTML site served from memory. Unknown paths answer 404.
pub struct BookServer {
    pub base_url: String,
    requests: Arc<Mutex<Vec<String>>>,
    shutdown_tx: Option<mpsc::Sender<()>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl BookServer {
    pub fn spawn(pages: HashMap<String, (u16, String)>) -> Self {
        let server = tiny_http::Server::http("127.0.0.1:0").expect("start book server");
        let addr = server.server_addr();
        let base_url = format!("http://{addr}");
        let requests = Arc::new(Mutex::new(Vec::new()));
        let log = requests.clone();

        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

        let handle = thread::spawn(move || {
            loop {
                if shutdown_rx.try_recv().is_ok() {
                    break;
                }

                let request = match server.recv_timeout(Duration::from_millis(50)) {
                    Ok(Some(req)) => req,
                    Ok(None) => continue,
                    Err(_) => break,
                };

                let path = request.url().to_string();
                log.lock()
                    .expect("request log")
                    .push(format!("{} {path}", request.method()));

                let (status, body) = pages
                    .get(&path)
                    .cloned()
                    .unwrap_or_else(|| (404, "404 Not Found".to_string()));
                let header =
                    tiny_http::Header::from_bytes(&b"Content-Type"[..], &b"text/html; charset=utf-8"[..])
                        .expect("build header");
                let response = tiny_http::Response::from_string(body)
                    .with_status_code(status)
                    .with_header(header);
                let _ = request.respond(response);
            }
        });

        Self {
            base_url,
            requests,
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    /// Requests seen so far, as `"<METHOD> <path>"`.
    #[allow(dead_code)]
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().expect("request log").clone()
    }
}

impl Drop for BookServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

pub fn chapter_page(n: usize) -> String {
    let sentence = format!("The lighthouse keeper wrote entry {n} before the storm arrived. ");
    format!(
        "<!doctype html><html><head><title>Entry {n}</title></head><body><h1>Entry {n}</h1><p>{}</p></body></html>",
        sentence.repeat(12)
    )
}

/// A book at `/book/` with a table of contents linking `entry-<n>.html`.
pub fn lighthouse_book(chapters: usize) -> HashMap<String, (u16, String)> {
    let links = (1..=chapters)
        .map(|n| format!("<li><a href=\"entry-{n}.html\">Entry {n}</a></li>"))
        .collect::<String>();
    let mut pages = HashMap::new();
    pages.insert(
        "/book/".to_string(),
        (
            200,
            format!(
                "<!doctype html><html><head><title>Lighthouse Log</title>\
                 <meta name=\"author\" content=\"K. Keeper\"></head>\
                 <body><nav class=\"toc\"><ol>{links}</ol></nav></body></html>"
            ),
        ),
    );
    for n in 1..=chapters {
        pages.insert(format!("/book/entry-{n}.html"), (200, chapter_page(n)));
    }
    pages
}
