// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Management API Client
//!
//! A minimal HTTP client for the parts of the management API the topology
//! bootstrap needs: virtual hosts, users, permissions, policies and federation
//! upstreams.
//!
//! The client accepts several candidate API hosts. Before each call it checks
//! the host that answered last; when that one stops responding it checks the
//! whole list in order and remembers the first host that answers.

use crate::config::RabbitMqOptions;
use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{collections::BTreeMap, time::Duration};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(20);
const HTTP_PORT: u16 = 15672;
const HTTPS_PORT: u16 = 443;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ManagementError {
    #[error("invalid management api configuration `{0}`")]
    InvalidConfiguration(String),

    #[error("unable to connect to any of the provided api hosts")]
    NoHostResponding,

    #[error("unexpected http status `{0}`")]
    UnexpectedStatus(u16),

    #[error("failure to send request `{0}`")]
    RequestError(String),

    #[error("failure to decode response `{0}`")]
    DecodeError(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vhost {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub name: String,
    #[serde(default)]
    pub tags: serde_json::Value,
}

/// Body of a user creation request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserInfo {
    #[serde(skip)]
    name: String,
    password: String,
    tags: String,
}

impl UserInfo {
    pub fn new(name: &str, password: &str) -> Self {
        UserInfo {
            name: name.to_owned(),
            password: password.to_owned(),
            tags: String::new(),
        }
    }

    /// Comma separated tags, e.g. `administrator`.
    pub fn with_tags(mut self, tags: &str) -> Self {
        self.tags = tags.to_owned();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Permissions of a user on a virtual host; everything is granted by default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PermissionInfo {
    #[serde(skip)]
    user: String,
    #[serde(skip)]
    vhost: String,
    configure: String,
    write: String,
    read: String,
}

impl PermissionInfo {
    pub fn new(user: &User, vhost: &Vhost) -> Self {
        PermissionInfo {
            user: user.name.clone(),
            vhost: vhost.name.clone(),
            configure: ".*".to_owned(),
            write: ".*".to_owned(),
            read: ".*".to_owned(),
        }
    }

    pub fn configure(mut self, pattern: &str) -> Self {
        self.configure = pattern.to_owned();
        self
    }

    pub fn write(mut self, pattern: &str) -> Self {
        self.write = pattern.to_owned();
        self
    }

    pub fn read(mut self, pattern: &str) -> Self {
        self.read = pattern.to_owned();
        self
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn vhost(&self) -> &str {
        &self.vhost
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Policy {
    #[serde(skip)]
    pub name: String,
    pub pattern: String,
    pub definition: BTreeMap<String, serde_json::Value>,
    pub priority: i32,
    #[serde(rename = "apply-to")]
    pub apply_to: String,
}

/// A federation upstream parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FederatedExchange {
    #[serde(skip)]
    pub name: String,
    pub value: FederationUpstream,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct FederationUpstream {
    pub uri: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exchange: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prefetch_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reconnect_delay: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ack_mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_hops: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_ttl: Option<u64>,
}

/// Management operations used by the topology bootstrap.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ManagementApi: Send + Sync {
    async fn get_vhosts(&self) -> Result<Vec<Vhost>, ManagementError>;

    async fn get_vhost(&self, name: &str) -> Result<Vhost, ManagementError>;

    async fn create_vhost(&self, name: &str) -> Result<Vhost, ManagementError>;

    async fn get_users(&self) -> Result<Vec<User>, ManagementError>;

    async fn get_user(&self, name: &str) -> Result<User, ManagementError>;

    async fn create_user(&self, user: &UserInfo) -> Result<User, ManagementError>;

    async fn create_permission(&self, permission: &PermissionInfo) -> Result<(), ManagementError>;

    async fn create_policy(&self, policy: &Policy, vhost: &str) -> Result<(), ManagementError>;

    async fn create_federated_exchange(
        &self,
        exchange: &FederatedExchange,
        vhost: &str,
    ) -> Result<(), ManagementError>;
}

/// Builds the management client for a cluster.
pub trait ManagementApiFactory: Send + Sync {
    fn create(&self, options: &RabbitMqOptions) -> Result<Box<dyn ManagementApi>, ManagementError>;
}

/// [`ManagementApiFactory`] producing [`RabbitMqManagementClient`]s.
#[derive(Debug, Clone)]
pub struct HttpManagementApiFactory {
    timeout: Duration,
}

impl Default for HttpManagementApiFactory {
    fn default() -> Self {
        HttpManagementApiFactory {
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl HttpManagementApiFactory {
    pub fn with_timeout(timeout: Duration) -> Self {
        HttpManagementApiFactory { timeout }
    }
}

impl ManagementApiFactory for HttpManagementApiFactory {
    fn create(&self, options: &RabbitMqOptions) -> Result<Box<dyn ManagementApi>, ManagementError> {
        Ok(Box::new(RabbitMqManagementClient::with_timeout(
            options,
            self.timeout,
        )?))
    }
}

pub struct RabbitMqManagementClient {
    http: Client,
    username: String,
    password: String,
    addresses: Vec<String>,
    last_known: RwLock<Option<String>>,
}

impl RabbitMqManagementClient {
    pub fn new(options: &RabbitMqOptions) -> Result<Self, ManagementError> {
        Self::with_timeout(options, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(
        options: &RabbitMqOptions,
        timeout: Duration,
    ) -> Result<Self, ManagementError> {
        if options.username.trim().is_empty() {
            return Err(ManagementError::InvalidConfiguration(
                "username is empty".to_owned(),
            ));
        }
        if options.password.trim().is_empty() {
            return Err(ManagementError::InvalidConfiguration(
                "password is empty".to_owned(),
            ));
        }

        let addresses: Vec<String> = options
            .api_addresses()
            .split(',')
            .filter_map(|address| api_address(address, options.use_ssl))
            .collect();
        if addresses.is_empty() {
            return Err(ManagementError::InvalidConfiguration(format!(
                "no valid api address in `{}`",
                options.api_addresses()
            )));
        }

        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| ManagementError::InvalidConfiguration(err.to_string()))?;

        Ok(RabbitMqManagementClient {
            http,
            username: options.username.clone(),
            password: options.password.clone(),
            addresses,
            last_known: RwLock::new(None),
        })
    }

    pub fn addresses(&self) -> &[String] {
        &self.addresses
    }

    /// The host that answered the last liveness check.
    pub async fn active_address(&self) -> Option<String> {
        self.last_known.read().await.clone()
    }

    async fn endpoint(&self, segments: &[&str]) -> Result<Url, ManagementError> {
        let last_known = self.last_known.read().await.clone();
        if let Some(address) = last_known {
            if self.is_responding(&address).await {
                return api_url(&address, segments);
            }
        }

        for address in &self.addresses {
            if self.is_responding(address).await {
                *self.last_known.write().await = Some(address.clone());
                return api_url(address, segments);
            }
        }

        Err(ManagementError::NoHostResponding)
    }

    async fn is_responding(&self, address: &str) -> bool {
        match self.http.get(address).send().await {
            Ok(response) => response.status().is_success(),
            Err(err) => {
                debug!(error = err.to_string(), address, "management api host is not responding");
                false
            }
        }
    }

    async fn get<T: DeserializeOwned>(&self, segments: &[&str]) -> Result<T, ManagementError> {
        let uri = self.endpoint(segments).await?;
        let response = self
            .http
            .get(uri)
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await
            .map_err(|err| ManagementError::RequestError(err.to_string()))?;

        if response.status() != StatusCode::OK {
            return Err(ManagementError::UnexpectedStatus(response.status().as_u16()));
        }

        response
            .json()
            .await
            .map_err(|err| ManagementError::DecodeError(err.to_string()))
    }

    async fn put<T: Serialize + Sync>(
        &self,
        segments: &[&str],
        body: Option<&T>,
    ) -> Result<(), ManagementError> {
        let uri = self.endpoint(segments).await?;
        let request = self
            .http
            .put(uri)
            .basic_auth(&self.username, Some(&self.password));
        let request = match body {
            Some(body) => request.json(body),
            None => request.header(reqwest::header::CONTENT_TYPE, "application/json"),
        };

        let response = request
            .send()
            .await
            .map_err(|err| ManagementError::RequestError(err.to_string()))?;

        match response.status() {
            StatusCode::OK | StatusCode::CREATED | StatusCode::NO_CONTENT => Ok(()),
            status => Err(ManagementError::UnexpectedStatus(status.as_u16())),
        }
    }
}

#[async_trait]
impl ManagementApi for RabbitMqManagementClient {
    async fn get_vhosts(&self) -> Result<Vec<Vhost>, ManagementError> {
        self.get(&["vhosts"]).await
    }

    async fn get_vhost(&self, name: &str) -> Result<Vhost, ManagementError> {
        self.get(&["vhosts", name]).await
    }

    async fn create_vhost(&self, name: &str) -> Result<Vhost, ManagementError> {
        if name.is_empty() {
            return Err(ManagementError::InvalidConfiguration(
                "vhost name is empty".to_owned(),
            ));
        }

        self.put::<()>(&["vhosts", name], None).await?;
        self.get_vhost(name).await
    }

    async fn get_users(&self) -> Result<Vec<User>, ManagementError> {
        self.get(&["users"]).await
    }

    async fn get_user(&self, name: &str) -> Result<User, ManagementError> {
        self.get(&["users", name]).await
    }

    async fn create_user(&self, user: &UserInfo) -> Result<User, ManagementError> {
        self.put(&["users", user.name()], Some(user)).await?;
        self.get_user(user.name()).await
    }

    async fn create_permission(&self, permission: &PermissionInfo) -> Result<(), ManagementError> {
        let segments = ["permissions", permission.vhost(), permission.user()];
        self.put(&segments, Some(permission)).await
    }

    async fn create_policy(&self, policy: &Policy, vhost: &str) -> Result<(), ManagementError> {
        self.put(&["policies", vhost, policy.name.as_str()], Some(policy))
            .await
    }

    async fn create_federated_exchange(
        &self,
        exchange: &FederatedExchange,
        vhost: &str,
    ) -> Result<(), ManagementError> {
        let segments = ["parameters", "federation-upstream", vhost, exchange.name.as_str()];
        self.put(&segments, Some(exchange)).await
    }
}

/// `address` followed by `/api` and `segments`, each segment percent-encoded.
fn api_url(address: &str, segments: &[&str]) -> Result<Url, ManagementError> {
    let invalid = || ManagementError::InvalidConfiguration(address.to_owned());

    let mut url = Url::parse(address).map_err(|_| invalid())?;
    url.path_segments_mut()
        .map_err(|_| invalid())?
        .pop_if_empty()
        .push("api")
        .extend(segments);
    Ok(url)
}

/// Normalizes one configured api host into a base url, applying the default
/// management port when none is given.
fn api_address(address: &str, use_ssl: bool) -> Option<String> {
    let address = address.trim().trim_end_matches('/');
    if address.is_empty() {
        return None;
    }

    let with_scheme = if address.starts_with("http://") || address.starts_with("https://") {
        address.to_owned()
    } else if use_ssl {
        format!("https://{}", address)
    } else {
        format!("http://{}", address)
    };

    let mut url = Url::parse(&with_scheme).ok()?;
    url.host_str()?;

    let authority = with_scheme.split("://").nth(1)?.split('/').next()?;
    let has_port = authority
        .rsplit_once(':')
        .is_some_and(|(_, port)| port.parse::<u16>().is_ok());
    if !has_port {
        let port = if url.scheme() == "https" { HTTPS_PORT } else { HTTP_PORT };
        url.set_port(Some(port)).ok()?;
    }

    Some(url.as_str().trim_end_matches('/').to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        extract::{Path, State},
        http::{HeaderMap, StatusCode as AxumStatus},
        routing::get,
        Json, Router,
    };
    use serde_json::{json, Value};
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Server {
        vhosts: Vec<String>,
        puts: Vec<(String, Value)>,
    }

    type Shared = Arc<Mutex<Server>>;

    fn authorized(headers: &HeaderMap) -> bool {
        // guest:guest
        headers
            .get("authorization")
            .is_some_and(|value| value == "Basic Z3Vlc3Q6Z3Vlc3Q=")
    }

    async fn list_vhosts(
        State(server): State<Shared>,
        headers: HeaderMap,
    ) -> Result<Json<Value>, AxumStatus> {
        if !authorized(&headers) {
            return Err(AxumStatus::UNAUTHORIZED);
        }
        let names = server.lock().unwrap().vhosts.clone();
        Ok(Json(json!(names
            .into_iter()
            .map(|name| json!({ "name": name, "messages": 0 }))
            .collect::<Vec<_>>())))
    }

    async fn read_vhost(
        State(server): State<Shared>,
        Path(name): Path<String>,
    ) -> Result<Json<Value>, AxumStatus> {
        if server.lock().unwrap().vhosts.contains(&name) {
            Ok(Json(json!({ "name": name })))
        } else {
            Err(AxumStatus::NOT_FOUND)
        }
    }

    async fn put_vhost(State(server): State<Shared>, Path(name): Path<String>) -> AxumStatus {
        let mut server = server.lock().unwrap();
        server.puts.push((format!("vhosts/{}", name), Value::Null));
        server.vhosts.push(name);
        AxumStatus::CREATED
    }

    async fn put_permission(
        State(server): State<Shared>,
        Path((vhost, user)): Path<(String, String)>,
        Json(body): Json<Value>,
    ) -> AxumStatus {
        server
            .lock()
            .unwrap()
            .puts
            .push((format!("permissions/{}/{}", vhost, user), body));
        AxumStatus::CREATED
    }

    async fn put_policy(
        State(server): State<Shared>,
        Path((vhost, name)): Path<(String, String)>,
        Json(body): Json<Value>,
    ) -> AxumStatus {
        server
            .lock()
            .unwrap()
            .puts
            .push((format!("policies/{}/{}", vhost, name), body));
        AxumStatus::NO_CONTENT
    }

    async fn put_upstream(
        State(server): State<Shared>,
        Path((vhost, name)): Path<(String, String)>,
        Json(body): Json<Value>,
    ) -> AxumStatus {
        server
            .lock()
            .unwrap()
            .puts
            .push((format!("federation-upstream/{}/{}", vhost, name), body));
        AxumStatus::CREATED
    }

    async fn list_users() -> Json<Value> {
        Json(json!([{ "name": "guest", "tags": ["administrator"] }]))
    }

    /// Bind to port 0 and return the actual address.
    async fn start_server(server: Shared) -> String {
        let app = Router::new()
            .route("/", get(|| async { "ok" }))
            .route("/api/vhosts", get(list_vhosts))
            .route("/api/vhosts/:name", get(read_vhost).put(put_vhost))
            .route("/api/users", get(list_users))
            .route(
                "/api/permissions/:vhost/:user",
                axum::routing::put(put_permission),
            )
            .route("/api/policies/:vhost/:name", axum::routing::put(put_policy))
            .route(
                "/api/parameters/federation-upstream/:vhost/:name",
                axum::routing::put(put_upstream),
            )
            .with_state(server);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn options(api_address: &str) -> RabbitMqOptions {
        RabbitMqOptions {
            api_address: Some(api_address.to_owned()),
            ..Default::default()
        }
    }

    #[test]
    fn api_addresses_get_scheme_and_default_port() {
        assert_eq!(api_address(" rmq-1 ", false), Some("http://rmq-1:15672".to_owned()));
        assert_eq!(api_address("rmq-1", true), Some("https://rmq-1".to_owned()));
        assert_eq!(
            api_address("http://rmq-1:8080/", false),
            Some("http://rmq-1:8080".to_owned())
        );
        assert_eq!(api_address("", false), None);
    }

    #[test]
    fn api_path_segments_are_encoded_one_by_one() {
        let url = api_url("http://rmq-1:15672", &["permissions", "/", "ops team"]).unwrap();
        assert_eq!(url.as_str(), "http://rmq-1:15672/api/permissions/%2F/ops%20team");

        let url = api_url("https://rmq-1/mgmt", &["vhosts"]).unwrap();
        assert_eq!(url.as_str(), "https://rmq-1/mgmt/api/vhosts");
    }

    #[test]
    fn client_requires_credentials_and_addresses() {
        let no_user = RabbitMqOptions {
            username: String::new(),
            ..Default::default()
        };
        assert!(matches!(
            RabbitMqManagementClient::new(&no_user),
            Err(ManagementError::InvalidConfiguration(_))
        ));

        assert!(matches!(
            RabbitMqManagementClient::new(&options(" , ")),
            Err(ManagementError::InvalidConfiguration(_))
        ));

        let client = RabbitMqManagementClient::new(&options("rmq-1,rmq-2")).unwrap();
        assert_eq!(client.addresses(), ["http://rmq-1:15672", "http://rmq-2:15672"]);
    }

    #[tokio::test]
    async fn creates_and_lists_vhosts() {
        let server = Shared::default();
        let base = start_server(server.clone()).await;
        let client = RabbitMqManagementClient::new(&options(&base)).unwrap();

        let created = client.create_vhost("/").await.unwrap();
        let vhosts = client.get_vhosts().await.unwrap();

        assert_eq!(created.name, "/");
        assert_eq!(vhosts, vec![Vhost { name: "/".to_owned() }]);
        assert_eq!(server.lock().unwrap().puts[0].0, "vhosts//");
    }

    #[tokio::test]
    async fn grants_permissions_on_a_vhost() {
        let server = Shared::default();
        let base = start_server(server.clone()).await;
        let client = RabbitMqManagementClient::new(&options(&base)).unwrap();

        let user = client
            .get_users()
            .await
            .unwrap()
            .into_iter()
            .find(|user| user.name == "guest")
            .unwrap();
        let vhost = Vhost {
            name: "tenants".to_owned(),
        };

        client
            .create_permission(&PermissionInfo::new(&user, &vhost).write("^settix\\."))
            .await
            .unwrap();

        let puts = server.lock().unwrap().puts.clone();
        assert_eq!(puts[0].0, "permissions/tenants/guest");
        assert_eq!(
            puts[0].1,
            json!({ "configure": ".*", "write": "^settix\\.", "read": ".*" })
        );
    }

    #[tokio::test]
    async fn creates_policies_and_federation_upstreams() {
        let server = Shared::default();
        let base = start_server(server.clone()).await;
        let client = RabbitMqManagementClient::new(&options(&base)).unwrap();

        let policy = Policy {
            name: "federate-settix".to_owned(),
            pattern: "^settix\\.".to_owned(),
            definition: BTreeMap::from([("federation-upstream-set".to_owned(), json!("all"))]),
            priority: 1,
            apply_to: "exchanges".to_owned(),
        };
        client.create_policy(&policy, "/").await.unwrap();

        let upstream = FederatedExchange {
            name: "dc-2".to_owned(),
            value: FederationUpstream {
                uri: "amqp://dc-2".to_owned(),
                max_hops: Some(1),
                ..Default::default()
            },
        };
        client.create_federated_exchange(&upstream, "/").await.unwrap();

        let puts = server.lock().unwrap().puts.clone();
        assert_eq!(puts[0].0, "policies///federate-settix");
        assert_eq!(puts[0].1["apply-to"], "exchanges");
        assert_eq!(puts[1].0, "federation-upstream///dc-2");
        assert_eq!(puts[1].1, json!({ "value": { "uri": "amqp://dc-2", "max-hops": 1 } }));
    }

    #[tokio::test]
    async fn falls_back_to_the_next_responding_host() {
        let base = start_server(Shared::default()).await;
        let dead = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            drop(listener);
            format!("http://{addr}")
        };
        let hosts = format!("{},{}", dead, base);
        let client = RabbitMqManagementClient::new(&options(&hosts)).unwrap();

        assert!(client.get_vhosts().await.is_ok());
        assert_eq!(client.active_address().await, Some(base.clone()));
        assert!(client.get_vhosts().await.is_ok());
    }

    #[tokio::test]
    async fn fails_when_no_host_responds() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let client = RabbitMqManagementClient::with_timeout(
            &options(&format!("http://{addr}")),
            Duration::from_secs(2),
        )
        .unwrap();

        assert_eq!(
            client.get_vhosts().await,
            Err(ManagementError::NoHostResponding)
        );
    }

    #[tokio::test]
    async fn rejected_credentials_surface_the_status() {
        let base = start_server(Shared::default()).await;
        let client = RabbitMqManagementClient::new(&RabbitMqOptions {
            username: "intruder".to_owned(),
            ..options(&base)
        })
        .unwrap();

        assert_eq!(
            client.get_vhosts().await,
            Err(ManagementError::UnexpectedStatus(401))
        );
    }
}
