//! Client for the API requester, a companion pod that forwards structured
//! requests into the workloads under test.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Pod, Service};
use kube::api::{Api, ListParams};
use kube::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// Failures, by the layer that produced them.
#[derive(Debug, Error)]
pub enum RequestError {
    /// The companion pod could not be reached or answered with a non-JSON
    /// error.
    #[error("transport error talking to {url}: {reason}")]
    Transport { url: String, reason: String },
    /// The companion pod answered but failed to handle the request itself.
    #[error("requester failed with status {status}: {detail}")]
    Requester { status: u16, detail: String },
    /// The request was proxied but the target rejected it.
    #[error("target returned status {status:?}: {body}")]
    Application { status: Option<i64>, body: Value },
    #[error("requester discovery: {0}")]
    Discovery(String),
    #[error(transparent)]
    Kube(#[from] kube::Error),
}

impl RequestError {
    pub fn layer(&self) -> &'static str {
        match self {
            RequestError::Transport { .. } => "transport",
            RequestError::Requester { .. } => "requester",
            RequestError::Application { .. } => "application",
            RequestError::Discovery(_) | RequestError::Kube(_) => "discovery",
        }
    }
}

/// Either a name the requester resolves by convention, or an inline config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum RequestTarget {
    Name(String),
    Config(Value),
}

impl RequestTarget {
    pub fn name(name: impl Into<String>) -> Self {
        RequestTarget::Name(name.into())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequestBody<'a> {
    pub target: &'a RequestTarget,
    pub endpoint: &'a RequestTarget,
}

fn status_of(v: Option<&Value>) -> Option<i64> {
    v.and_then(Value::as_i64)
}

/// Sorts an HTTP response from the requester into success or one of the
/// three error layers.
pub fn classify(url: &str, status: u16, body: &str) -> Result<Value, RequestError> {
    let Ok(json) = serde_json::from_str::<Value>(body) else {
        if status == 200 {
            return Err(RequestError::Requester {
                status,
                detail: "response body is not JSON".to_string(),
            });
        }
        return Err(RequestError::Transport {
            url: url.to_string(),
            reason: format!("HTTP {} with non-JSON body", status),
        });
    };

    if status != 200 {
        return Err(RequestError::Requester {
            status,
            detail: json.to_string(),
        });
    }
    if let Some(exception) = json.get("exception").filter(|e| !e.is_null()) {
        return Err(RequestError::Requester {
            status,
            detail: exception.to_string(),
        });
    }

    let top_status = status_of(json.get("statusCode"));
    let inner = json.get("response");
    let inner_status = status_of(inner.and_then(|r| r.get("status_code")));
    let has_error = json.get("error").map_or(false, |e| !e.is_null())
        || inner
            .and_then(|r| r.get("error"))
            .map_or(false, |e| !e.is_null());
    if top_status.map_or(false, |s| s != 200) || inner_status.map_or(false, |s| s != 200) {
        return Err(RequestError::Application {
            status: inner_status.or(top_status),
            body: json,
        });
    }
    if has_error {
        return Err(RequestError::Application {
            status: inner_status.or(top_status),
            body: json,
        });
    }
    Ok(json)
}

/// Something that can forward a request to a target workload.
#[async_trait]
pub trait SideChannel: Send + Sync {
    async fn request(
        &self,
        target: &RequestTarget,
        endpoint: &RequestTarget,
    ) -> Result<Value, RequestError>;
}

#[derive(Debug, Clone)]
pub struct Requester {
    http: reqwest::Client,
    url: String,
}

impl Requester {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, RequestError> {
        let url = url.into();
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RequestError::Transport {
                url: url.clone(),
                reason: e.to_string(),
            })?;
        Ok(Self { http, url })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl SideChannel for Requester {
    async fn request(
        &self,
        target: &RequestTarget,
        endpoint: &RequestTarget,
    ) -> Result<Value, RequestError> {
        let transport = |e: reqwest::Error| RequestError::Transport {
            url: self.url.clone(),
            reason: e.to_string(),
        };
        debug!(url = %self.url, ?target, ?endpoint, "side-channel request");
        let resp = self
            .http
            .post(&self.url)
            .json(&RequestBody { target, endpoint })
            .send()
            .await
            .map_err(transport)?;
        let status = resp.status().as_u16();
        let text = resp.text().await.map_err(transport)?;
        classify(&self.url, status, &text)
    }
}

fn default_app() -> String {
    "api-requester".to_string()
}

fn default_path() -> String {
    "/process".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

/// Where to find the requester and how to call it.
#[derive(Debug, Clone, Deserialize)]
pub struct RequesterOptions {
    pub namespace: String,
    #[serde(default = "default_app")]
    pub app: String,
    /// Companion service exposing the requester on a node port.
    pub service: String,
    #[serde(default)]
    pub pod_name: Option<String>,
    #[serde(default)]
    pub index: Option<usize>,
    #[serde(default = "default_path")]
    pub path: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Skips discovery when set.
    #[serde(default)]
    pub url: Option<String>,
}

/// Picks a pod by exact name, else by index into the name-sorted list.
pub fn pick_pod<'a>(pods: &'a [Pod], name: Option<&str>, index: Option<usize>) -> Option<&'a Pod> {
    if let Some(name) = name {
        return pods
            .iter()
            .find(|p| p.metadata.name.as_deref() == Some(name));
    }
    let mut sorted: Vec<&Pod> = pods.iter().collect();
    sorted.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
    sorted.get(index.unwrap_or(0)).copied()
}

pub fn internal_ip(node: &Node) -> Option<&str> {
    node.status
        .as_ref()?
        .addresses
        .as_ref()?
        .iter()
        .find(|a| a.type_ == "InternalIP")
        .map(|a| a.address.as_str())
}

pub fn node_port(service: &Service) -> Option<i32> {
    service
        .spec
        .as_ref()?
        .ports
        .as_ref()?
        .iter()
        .find_map(|p| p.node_port)
}

/// Finds the requester pod by app label and builds a client addressed at
/// its node's internal IP and the companion service's node port.
pub async fn discover_requester(
    client: Client,
    options: &RequesterOptions,
) -> Result<Requester, RequestError> {
    let timeout = Duration::from_secs(options.timeout_secs);
    if let Some(url) = &options.url {
        return Requester::new(url.clone(), timeout);
    }
    let ns = options.namespace.as_str();
    let pods: Api<Pod> = Api::namespaced(client.clone(), ns);
    let list = pods
        .list(&ListParams::default().labels(&format!("app={}", options.app)))
        .await?;
    let pod = pick_pod(&list.items, options.pod_name.as_deref(), options.index).ok_or_else(
        || {
            RequestError::Discovery(format!(
                "no pod with app={} in {} (name {:?}, index {:?})",
                options.app, ns, options.pod_name, options.index
            ))
        },
    )?;
    let node_name = pod
        .spec
        .as_ref()
        .and_then(|s| s.node_name.clone())
        .ok_or_else(|| RequestError::Discovery("requester pod is not scheduled".to_string()))?;
    let node = Api::<Node>::all(client.clone()).get(&node_name).await?;
    let ip = internal_ip(&node).ok_or_else(|| {
        RequestError::Discovery(format!("node {} has no InternalIP", node_name))
    })?;
    let service = Api::<Service>::namespaced(client, ns)
        .get(&options.service)
        .await?;
    let port = node_port(&service).ok_or_else(|| {
        RequestError::Discovery(format!("service {} exposes no node port", options.service))
    })?;
    let url = format!("http://{}:{}{}", ip, port, options.path);
    info!(%url, pod = pod.metadata.name.as_deref().unwrap_or_default(), "discovered requester");
    Requester::new(url, timeout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{NodeAddress, NodeStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use serde_json::json;
    use std::io::Read;
    use tiny_http::{Response, Server};

    const URL: &str = "http://requester";

    #[test]
    fn body_serializes_kind_and_value() {
        let target = RequestTarget::name("nodes-0");
        let endpoint = RequestTarget::Config(json!({"path": "/relay/v1/messages", "method": "POST"}));
        let body = serde_json::to_value(RequestBody {
            target: &target,
            endpoint: &endpoint,
        })
        .expect("serialize");
        assert_eq!(
            body,
            json!({
                "target": {"kind": "name", "value": "nodes-0"},
                "endpoint": {"kind": "config", "value": {"path": "/relay/v1/messages", "method": "POST"}},
            })
        );
    }

    #[test]
    fn classify_success() {
        let body = r#"{"response": {"status_code": 200, "text": "ok"}}"#;
        let value = classify(URL, 200, body).expect("success");
        assert_eq!(value["response"]["text"], "ok");
    }

    #[test]
    fn classify_transport_on_non_json_error() {
        let err = classify(URL, 502, "<html>bad gateway</html>").expect_err("transport");
        assert_eq!(err.layer(), "transport");
    }

    #[test]
    fn classify_requester_failures() {
        let err = classify(URL, 500, r#"{"detail": "boom"}"#).expect_err("requester");
        assert_eq!(err.layer(), "requester");
        let err = classify(URL, 200, r#"{"exception": "KeyError: 'target'"}"#)
            .expect_err("requester");
        assert!(matches!(err, RequestError::Requester { status: 200, .. }));
    }

    #[test]
    fn classify_application_failures() {
        let err = classify(URL, 200, r#"{"response": {"status_code": 503}}"#)
            .expect_err("application");
        assert!(matches!(err, RequestError::Application { status: Some(503), .. }));
        let err = classify(URL, 200, r#"{"statusCode": 404}"#).expect_err("application");
        assert!(matches!(err, RequestError::Application { status: Some(404), .. }));
        let err = classify(
            URL,
            200,
            r#"{"response": {"status_code": 200, "error": "no peers"}}"#,
        )
        .expect_err("application");
        assert_eq!(err.layer(), "application");
    }

    #[test]
    fn picks_pod_by_name_or_sorted_index() {
        let pod = |name: &str| Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        let pods = vec![pod("requester-b"), pod("requester-a")];
        let first = pick_pod(&pods, None, None).expect("first");
        assert_eq!(first.metadata.name.as_deref(), Some("requester-a"));
        let second = pick_pod(&pods, None, Some(1)).expect("second");
        assert_eq!(second.metadata.name.as_deref(), Some("requester-b"));
        assert!(pick_pod(&pods, Some("requester-c"), None).is_none());
        assert!(pick_pod(&pods, None, Some(2)).is_none());
    }

    #[test]
    fn node_internal_ip() {
        let node = Node {
            status: Some(NodeStatus {
                addresses: Some(vec![
                    NodeAddress {
                        type_: "Hostname".to_string(),
                        address: "worker-1".to_string(),
                    },
                    NodeAddress {
                        type_: "InternalIP".to_string(),
                        address: "10.0.0.7".to_string(),
                    },
                ]),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(internal_ip(&node), Some("10.0.0.7"));
        assert_eq!(internal_ip(&Node::default()), None);
    }

    fn serve_once(status: u16, body: &'static str) -> (String, std::sync::mpsc::Receiver<String>) {
        let server = Server::http("127.0.0.1:0").expect("bind");
        let addr = server.server_addr().to_ip().expect("ip addr");
        let (tx, rx) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            if let Ok(mut request) = server.recv() {
                let mut received = String::new();
                let _ = request.as_reader().read_to_string(&mut received);
                let _ = tx.send(received);
                let response = Response::from_string(body).with_status_code(status);
                let _ = request.respond(response);
            }
        });
        (format!("http://{}/process", addr), rx)
    }

    #[tokio::test]
    async fn request_round_trip_against_local_server() {
        let (url, received) = serve_once(200, r#"{"response": {"status_code": 200, "sent": 1}}"#);
        let requester = Requester::new(url, Duration::from_secs(5)).expect("client");
        let value = requester
            .request(
                &RequestTarget::name("nodes"),
                &RequestTarget::name("publish"),
            )
            .await
            .expect("request");
        assert_eq!(value["response"]["sent"], 1);
        let body: Value = serde_json::from_str(&received.recv().expect("body")).expect("json");
        assert_eq!(body["target"]["kind"], "name");
        assert_eq!(body["endpoint"]["value"], "publish");
    }

    #[tokio::test]
    async fn application_error_from_local_server() {
        let (url, _received) = serve_once(200, r#"{"statusCode": 500, "error": "target down"}"#);
        let requester = Requester::new(url, Duration::from_secs(5)).expect("client");
        let err = requester
            .request(&RequestTarget::name("nodes"), &RequestTarget::name("publish"))
            .await
            .expect_err("application error");
        assert_eq!(err.layer(), "application");
    }

    #[tokio::test]
    async fn unreachable_requester_is_transport() {
        let requester =
            Requester::new("http://127.0.0.1:9/process", Duration::from_secs(2)).expect("client");
        let err = requester
            .request(&RequestTarget::name("nodes"), &RequestTarget::name("publish"))
            .await
            .expect_err("transport");
        assert_eq!(err.layer(), "transport");
    }
}
