//! Targets and servers used by tests.

use crate::error::BoxError;
use crate::{Operation, Target, TargetHandle};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

type Behavior = dyn Fn(usize, Operation, u64) -> Result<u16, BoxError> + Send + Sync;

/// An in-memory target: every request sleeps for `latency`, then answers with whatever
/// `behavior(worker_id, op, key)` returns. The behavior may sleep further or panic.
#[derive(Clone)]
pub(crate) struct MockTarget {
    latency: Duration,
    behavior: Arc<Behavior>,
    broken_handle: Option<usize>,
    unreachable: bool,
}

impl MockTarget {
    pub(crate) fn ok(latency: Duration) -> Self {
        Self::with(latency, |_, _, _| Ok(200))
    }

    pub(crate) fn with<F>(latency: Duration, behavior: F) -> Self
    where
        F: Fn(usize, Operation, u64) -> Result<u16, BoxError> + Send + Sync + 'static,
    {
        Self {
            latency,
            behavior: Arc::new(behavior),
            broken_handle: None,
            unreachable: false,
        }
    }

    /// Creating the handle of `worker_id` fails.
    pub(crate) fn broken_handle(mut self, worker_id: usize) -> Self {
        self.broken_handle = Some(worker_id);
        self
    }

    /// The reachability probe fails.
    pub(crate) fn unreachable(mut self) -> Self {
        self.unreachable = true;
        self
    }
}

impl Target for MockTarget {
    fn handle(
        &self,
        worker_id: usize,
        _request_timeout: Duration,
    ) -> Result<Box<dyn TargetHandle>, BoxError> {
        if self.broken_handle == Some(worker_id) {
            return Err("connection refused".into());
        }
        Ok(Box::new(MockHandle {
            worker_id,
            latency: self.latency,
            behavior: self.behavior.clone(),
        }))
    }

    fn probe(&self) -> Result<(), BoxError> {
        match self.unreachable {
            true => Err("no route to host".into()),
            false => Ok(()),
        }
    }

    fn addr(&self) -> String {
        "mock".to_string()
    }
}

struct MockHandle {
    worker_id: usize,
    latency: Duration,
    behavior: Arc<Behavior>,
}

impl MockHandle {
    fn call(&self, op: Operation, key: u64) -> Result<u16, BoxError> {
        if !self.latency.is_zero() {
            thread::sleep(self.latency);
        }
        (self.behavior)(self.worker_id, op, key)
    }
}

impl TargetHandle for MockHandle {
    fn get(&mut self, key: u64) -> Result<u16, BoxError> {
        self.call(Operation::Read, key)
    }

    fn set(&mut self, key: u64, _value: &str) -> Result<u16, BoxError> {
        self.call(Operation::Write, key)
    }

    fn delete(&mut self, key: u64) -> Result<u16, BoxError> {
        self.call(Operation::Delete, key)
    }
}

// {{{ http

type Store = Arc<Mutex<HashMap<u64, String>>>;

/// A minimal HTTP/1.1 key-value server with the default endpoints of the HTTP target. A second
/// insert of the same key answers `409`.
pub(crate) struct KvServer {
    pub(crate) port: u16,
    store: Store,
}

impl KvServer {
    pub(crate) fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let store: Store = Arc::new(Mutex::new(HashMap::new()));
        let shared = store.clone();
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { return };
                let store = shared.clone();
                thread::spawn(move || serve_connection(stream, store));
            }
        });
        Self { port, store }
    }

    pub(crate) fn value(&self, key: u64) -> Option<String> {
        self.store.lock().get(&key).cloned()
    }
}

fn parse_form(s: &str) -> HashMap<String, String> {
    s.split('&')
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn serve_connection(stream: TcpStream, store: Store) {
    let mut reader = BufReader::new(stream.try_clone().unwrap());
    let mut writer = stream;
    loop {
        let mut line = String::new();
        match reader.read_line(&mut line) {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
        let mut parts = line.split_whitespace();
        let method = parts.next().unwrap_or_default().to_string();
        let target = parts.next().unwrap_or_default().to_string();

        let mut content_length = 0usize;
        loop {
            let mut header = String::new();
            if reader.read_line(&mut header).unwrap_or(0) == 0 {
                return;
            }
            let header = header.trim_end();
            if header.is_empty() {
                break;
            }
            if let Some((name, value)) = header.split_once(':') {
                if name.eq_ignore_ascii_case("content-length") {
                    content_length = value.trim().parse().unwrap_or(0);
                }
            }
        }
        let mut body = vec![0u8; content_length];
        if reader.read_exact(&mut body).is_err() {
            return;
        }

        let (path, query) = target.split_once('?').unwrap_or((target.as_str(), ""));
        let params = match method.as_str() {
            "POST" => parse_form(&String::from_utf8_lossy(&body)),
            _ => parse_form(query),
        };
        let id = params.get("id").and_then(|id| id.parse::<u64>().ok());

        let (status, payload) = {
            let mut store = store.lock();
            match (method.as_str(), path, id) {
                ("GET", "/", _) => (200, "ok".to_string()),
                ("GET", "/val", Some(id)) => match store.get(&id) {
                    Some(v) => (200, v.clone()),
                    None => (404, String::new()),
                },
                ("POST", "/save", Some(id)) => {
                    if store.contains_key(&id) {
                        (409, String::new())
                    } else {
                        let value = params.get("val").cloned().unwrap_or_default();
                        store.insert(id, value);
                        (200, String::new())
                    }
                }
                ("DELETE", "/delete", Some(id)) => match store.remove(&id) {
                    Some(_) => (200, String::new()),
                    None => (404, String::new()),
                },
                _ => (400, String::new()),
            }
        };

        let reply = format!(
            "HTTP/1.1 {} X\r\nContent-Length: {}\r\n\r\n{}",
            status,
            payload.len(),
            payload
        );
        if writer.write_all(reply.as_bytes()).is_err() || writer.flush().is_err() {
            return;
        }
    }
}

/// A server that accepts connections and never answers. Returns its port.
pub(crate) fn silent_server() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    thread::spawn(move || {
        let mut held = Vec::new();
        for stream in listener.incoming() {
            match stream {
                Ok(s) => held.push(s),
                Err(_) => return,
            }
        }
    });
    port
}

/// A server that answers every connection with bytes that are not HTTP. Returns its port.
pub(crate) fn garbage_server() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else { return };
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf);
            let _ = stream.write_all(b"this is not http\r\n\r\n");
        }
    });
    port
}

// }}} http
