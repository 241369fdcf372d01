//! A client of an HTTP key-value server.
//!
//! ## Configuration Format
//!
//! ``` toml
//! [target]
//! host = "..."            # hostname of the server
//! port = 1234             # port of the server
//! get_path = "val"        # optional, GET /val?id=<key>
//! set_path = "save"       # optional, POST /save with form fields id and val
//! delete_path = "delete"  # optional, DELETE /delete?id=<key>
//! ```
//!
//! Every worker gets its own [`reqwest::blocking::Client`], and therefore its own connection pool.
//! The request timeout of the run is applied to the whole exchange, body included.

use crate::error::BoxError;
use crate::{Target, TargetHandle};
use log::debug;
use reqwest::blocking::{Client, Response};
use serde::Deserialize;
use std::time::Duration;

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Deserialize, Clone, Debug, PartialEq)]
pub struct HttpTargetOpt {
    pub host: String,
    pub port: u16,
    pub get_path: Option<String>,
    pub set_path: Option<String>,
    pub delete_path: Option<String>,
}

impl HttpTargetOpt {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            get_path: None,
            set_path: None,
            delete_path: None,
        }
    }
}

#[derive(Clone, Debug)]
struct Urls {
    get: String,
    set: String,
    delete: String,
}

pub struct HttpTarget {
    addr: String,
    base: String,
    urls: Urls,
}

impl HttpTarget {
    pub fn new(opt: &HttpTargetOpt) -> Self {
        let addr = format!("{}:{}", opt.host, opt.port);
        let base = format!("http://{}/", addr);
        let url = |path: &Option<String>, default: &str| {
            let path = path.as_deref().unwrap_or(default);
            format!("{}{}", base, path.trim_start_matches('/'))
        };
        let urls = Urls {
            get: url(&opt.get_path, "val"),
            set: url(&opt.set_path, "save"),
            delete: url(&opt.delete_path, "delete"),
        };
        debug!("HTTP target {} with endpoints {:?}", addr, urls);
        Self { addr, base, urls }
    }
}

impl Target for HttpTarget {
    fn handle(
        &self,
        _worker_id: usize,
        request_timeout: Duration,
    ) -> Result<Box<dyn TargetHandle>, BoxError> {
        let client = Client::builder().timeout(request_timeout).build()?;
        Ok(Box::new(HttpTargetHandle {
            client,
            urls: self.urls.clone(),
        }))
    }

    fn probe(&self) -> Result<(), BoxError> {
        // any reply at all means the server is there
        let client = Client::builder().timeout(PROBE_TIMEOUT).build()?;
        let status = finish(client.get(&self.base).send()?)?;
        debug!("probe of {} answered {}", self.addr, status);
        Ok(())
    }

    fn addr(&self) -> String {
        self.addr.clone()
    }
}

pub struct HttpTargetHandle {
    client: Client,
    urls: Urls,
}

/// Read the body to the end so the exchange is fully resolved and the connection can be reused.
fn finish(response: Response) -> Result<u16, BoxError> {
    let status = response.status().as_u16();
    response.bytes()?;
    Ok(status)
}

impl TargetHandle for HttpTargetHandle {
    fn get(&mut self, key: u64) -> Result<u16, BoxError> {
        let response = self.client.get(&self.urls.get).query(&[("id", key)]).send()?;
        finish(response)
    }

    fn set(&mut self, key: u64, value: &str) -> Result<u16, BoxError> {
        let form = [("id", key.to_string()), ("val", value.to_string())];
        let response = self.client.post(&self.urls.set).form(&form).send()?;
        finish(response)
    }

    fn delete(&mut self, key: u64) -> Result<u16, BoxError> {
        let response = self
            .client
            .delete(&self.urls.delete)
            .query(&[("id", key)])
            .send()?;
        finish(response)
    }
}
