use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use reqwest::{RequestBuilder, Response, StatusCode};
use tracing::{debug, trace};

use crate::logger::{MessageLogMode, MessageLogger};
use crate::protocol::{
    device_path, parameters_query, parse_firmware_version, parse_points_response,
    parse_systems_response, points_path, truncate, write_body, DEFAULT_API_URL, SYSTEMS_PATH,
};
use crate::types::*;
use crate::{Error, Result};

type TokenSource = Box<dyn Fn() -> Option<String> + Send + Sync>;

/// Read/write access to a device's parameters.
pub trait PointApi: Send + Sync {
    fn read_points(
        &self,
        device_id: &str,
        ids: &[ParameterId],
    ) -> impl Future<Output = Result<Vec<DevicePoint>>> + Send;

    fn write_points(
        &self,
        device_id: &str,
        values: &PointValues,
    ) -> impl Future<Output = Result<()>> + Send;

    fn firmware_version(&self, device_id: &str) -> impl Future<Output = Result<String>> + Send;
}

pub struct MyUplinkClientBuilder {
    base_url: String,
    token_source: Option<TokenSource>,
    log_mode: Option<MessageLogMode>,
    log_path: Option<String>,
    timeout: Duration,
}

impl MyUplinkClientBuilder {
    pub fn new() -> Self {
        Self {
            base_url: DEFAULT_API_URL.to_string(),
            token_source: None,
            log_mode: None,
            log_path: None,
            timeout: Duration::from_secs(30),
        }
    }

    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn access_token(self, token: impl Into<String>) -> Self {
        let token = token.into();
        self.token_source(move || Some(token.clone()))
    }

    /// Called before every request. The OAuth2 layer owns refreshing.
    pub fn token_source(mut self, f: impl Fn() -> Option<String> + Send + Sync + 'static) -> Self {
        self.token_source = Some(Box::new(f));
        self
    }

    pub fn message_log(mut self, mode: MessageLogMode, path: impl Into<String>) -> Self {
        self.log_mode = Some(mode);
        self.log_path = Some(path.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn build(self) -> Result<MyUplinkClient> {
        let http = reqwest::Client::builder().timeout(self.timeout).build()?;

        let logger = match (self.log_mode, self.log_path) {
            (Some(mode), Some(path)) => Some(Mutex::new(MessageLogger::new(mode, &path)?)),
            _ => None,
        };

        Ok(MyUplinkClient {
            http,
            base_url: self.base_url,
            token_source: self.token_source,
            logger,
        })
    }
}

impl Default for MyUplinkClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

pub struct MyUplinkClient {
    http: reqwest::Client,
    base_url: String,
    token_source: Option<TokenSource>,
    logger: Option<Mutex<MessageLogger>>,
}

impl MyUplinkClient {
    pub fn builder() -> MyUplinkClientBuilder {
        MyUplinkClientBuilder::new()
    }

    pub async fn list_devices(&self, page: u32) -> Result<Vec<PairedDevice>> {
        let url = format!("{}{}", self.base_url, SYSTEMS_PATH);
        let rid = self.log(|l| l.log_request("GET", SYSTEMS_PATH, None));
        let request = self.http.get(&url).query(&[("page", page)]);
        let body = self.send(request, rid.as_deref(), "listing devices").await?;
        let devices = parse_systems_response(&body)?;
        if devices.is_empty() {
            return Err(Error::Protocol("no devices found on the account".to_string()));
        }
        Ok(devices)
    }

    fn log<R>(&self, f: impl FnOnce(&mut MessageLogger) -> R) -> Option<R> {
        let logger = self.logger.as_ref()?;
        let mut guard = logger.lock().ok()?;
        Some(f(&mut guard))
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match self.token_source.as_ref().and_then(|f| f()) {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder, rid: Option<&str>, what: &str) -> Result<String> {
        let result = match self.authorize(request).send().await {
            Ok(resp) => check_status(resp, what).await,
            Err(e) => Err(Error::Http(e)),
        };
        if let (Err(e), Some(rid)) = (&result, rid) {
            self.log(|l| l.log_error(rid, &e.to_string()));
        }
        result
    }
}

async fn check_status(resp: Response, what: &str) -> Result<String> {
    let status = resp.status();
    let body = resp.text().await?;
    if status == StatusCode::CONFLICT {
        return Err(Error::Conflict(format!("failed {what}")));
    }
    if !status.is_success() {
        return Err(Error::Status {
            status: status.as_u16(),
            body: truncate(&body, 300).to_string(),
        });
    }
    Ok(body)
}

impl PointApi for MyUplinkClient {
    async fn read_points(&self, device_id: &str, ids: &[ParameterId]) -> Result<Vec<DevicePoint>> {
        let path = points_path(device_id);
        let url = format!("{}{}", self.base_url, path);
        let query = parameters_query(ids);
        trace!(device = device_id, parameters = %query, "reading points");

        let rid = self.log(|l| l.log_request("GET", &path, None));
        let request = self.http.get(&url).query(&[("parameters", &query)]);
        let body = self
            .send(request, rid.as_deref(), &format!("reading {query}"))
            .await?;
        let points = parse_points_response(&body)?;

        if let Some(rid) = rid {
            self.log(|l| l.log_points(&rid, device_id, &points));
        }
        Ok(points)
    }

    async fn write_points(&self, device_id: &str, values: &PointValues) -> Result<()> {
        let path = points_path(device_id);
        let url = format!("{}{}", self.base_url, path);
        let body = write_body(values);
        debug!(device = device_id, body = %body, "setting parameters");

        let rid = self.log(|l| l.log_request("PATCH", &path, Some(&body)));
        let request = self.http.patch(&url).json(&body);
        let response = self
            .send(request, rid.as_deref(), &format!("setting {body}"))
            .await?;
        trace!(device = device_id, response = %response, "set response");

        if let Some(rid) = rid {
            self.log(|l| l.log_write(&rid, device_id, values, 200));
        }
        Ok(())
    }

    async fn firmware_version(&self, device_id: &str) -> Result<String> {
        let path = device_path(device_id);
        let url = format!("{}{}", self.base_url, path);
        let rid = self.log(|l| l.log_request("GET", &path, None));
        let body = self
            .send(self.http.get(&url), rid.as_deref(), "reading device info")
            .await?;
        parse_firmware_version(&body)
    }
}
