//! Shared connection to the media-processing server.
//!
//! The gateway drives a Kurento-style JSON-RPC protocol over a single
//! WebSocket shared by every session. One io task owns the socket; object
//! handles ([`PipelineHandle`], [`EndpointHandle`]) talk to it through a
//! command channel, which also serves as the seam scripted backends plug
//! into for tests.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use mediagate_protocol::{BackendConfig, IceCandidate};
use serde_json::{Value, json};
use tokio::sync::{OnceCell, mpsc, oneshot};
use tracing::{debug, info, warn};

/// Errors surfaced by media server calls.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BackendError {
    /// The media server could not be reached. Not cached: the next
    /// negotiation triggers a fresh connection attempt.
    #[error("could not find media server at {uri}: {reason}")]
    Unavailable { uri: String, reason: String },
    /// The media server answered a request with a JSON-RPC error.
    #[error("media server error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("media server connection closed")]
    ConnectionClosed,
    #[error("media server reply timed out")]
    Timeout,
    #[error("unexpected media server reply: {0}")]
    Protocol(String),
}

/// Lazily-established handle to the shared media server connection.
///
/// Owned by `AppState` and threaded into the router and orchestrator. The
/// first `acquire()` connects; concurrent first callers share that one
/// attempt, and a failed attempt is retried on the next call rather than
/// cached.
pub struct MediaClient {
    uri: String,
    response_timeout: Duration,
    conn: OnceCell<Arc<BackendConn>>,
}

impl MediaClient {
    pub fn new(config: &BackendConfig) -> Self {
        Self {
            uri: config.uri.clone(),
            response_timeout: Duration::from_secs(config.response_timeout_secs),
            conn: OnceCell::new(),
        }
    }

    /// Hand out the shared connection, establishing it on first need.
    pub async fn acquire(&self) -> Result<Arc<BackendConn>, BackendError> {
        self.conn
            .get_or_try_init(|| async {
                info!(uri = %self.uri, "Connecting to media server");
                BackendConn::connect(&self.uri, self.response_timeout).await
            })
            .await
            .cloned()
    }

    /// Build a client around an already-connected (scripted) backend.
    #[cfg(test)]
    pub(crate) fn preconnected(conn: Arc<BackendConn>) -> Self {
        Self {
            uri: "ws://scripted".to_string(),
            response_timeout: Duration::from_secs(1),
            conn: OnceCell::new_with(Some(conn)),
        }
    }
}

/// Commands from object handles to the connection io task.
pub(crate) enum Command {
    Call {
        method: &'static str,
        params: Value,
        reply: oneshot::Sender<Result<Value, BackendError>>,
    },
    /// Subscribe to `OnIceCandidate` events for `object`; matching events
    /// are pushed into `sink` for the lifetime of the connection.
    Subscribe {
        object: String,
        sink: mpsc::Sender<IceCandidate>,
        reply: oneshot::Sender<Result<Value, BackendError>>,
    },
}

/// One live JSON-RPC connection to the media server.
pub struct BackendConn {
    tx: mpsc::Sender<Command>,
    response_timeout: Duration,
}

impl BackendConn {
    pub async fn connect(
        uri: &str,
        response_timeout: Duration,
    ) -> Result<Arc<Self>, BackendError> {
        let (ws, _) =
            tokio_tungstenite::connect_async(uri)
                .await
                .map_err(|e| BackendError::Unavailable {
                    uri: uri.to_string(),
                    reason: e.to_string(),
                })?;
        info!("Connected to media server");

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(io_task(ws, rx));
        Ok(Arc::new(Self {
            tx,
            response_timeout,
        }))
    }

    /// Wire a handle straight to a scripted command loop.
    #[cfg(test)]
    pub(crate) fn from_channel(tx: mpsc::Sender<Command>) -> Arc<Self> {
        Arc::new(Self {
            tx,
            response_timeout: Duration::from_secs(1),
        })
    }

    async fn call(&self, method: &'static str, params: Value) -> Result<Value, BackendError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Call {
                method,
                params,
                reply,
            })
            .await
            .map_err(|_| BackendError::ConnectionClosed)?;
        match tokio::time::timeout(self.response_timeout, rx).await {
            Err(_) => Err(BackendError::Timeout),
            Ok(Err(_)) => Err(BackendError::ConnectionClosed),
            Ok(Ok(result)) => result,
        }
    }

    /// Create a media pipeline for one negotiation.
    pub async fn create_pipeline(self: &Arc<Self>) -> Result<PipelineHandle, BackendError> {
        let result = self
            .call(
                "create",
                json!({ "type": "MediaPipeline", "constructorParams": {} }),
            )
            .await?;
        Ok(PipelineHandle {
            id: object_id(&result)?,
            conn: Arc::clone(self),
        })
    }
}

/// A media pipeline created on the backend; container for endpoints.
#[derive(Clone)]
pub struct PipelineHandle {
    id: String,
    conn: Arc<BackendConn>,
}

// Manual: the connection handle carries no useful debug state.
impl std::fmt::Debug for PipelineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineHandle").field("id", &self.id).finish()
    }
}

impl PipelineHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn create_webrtc_endpoint(&self) -> Result<EndpointHandle, BackendError> {
        self.create_endpoint("WebRtcEndpoint").await
    }

    pub async fn create_rtp_endpoint(&self) -> Result<EndpointHandle, BackendError> {
        self.create_endpoint("RtpEndpoint").await
    }

    async fn create_endpoint(&self, kind: &str) -> Result<EndpointHandle, BackendError> {
        let result = self
            .conn
            .call(
                "create",
                json!({
                    "type": kind,
                    "constructorParams": { "mediaPipeline": self.id },
                }),
            )
            .await?;
        Ok(EndpointHandle {
            id: object_id(&result)?,
            conn: Arc::clone(&self.conn),
        })
    }

    /// Release the pipeline and everything created inside it.
    pub async fn release(&self) -> Result<(), BackendError> {
        self.conn
            .call("release", json!({ "object": self.id }))
            .await?;
        Ok(())
    }
}

/// One endpoint inside a pipeline (WebRTC or RTP).
#[derive(Clone)]
pub struct EndpointHandle {
    id: String,
    conn: Arc<BackendConn>,
}

impl std::fmt::Debug for EndpointHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointHandle").field("id", &self.id).finish()
    }
}

impl EndpointHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Apply an SDP offer, producing the answer.
    pub async fn process_offer(&self, offer: &str) -> Result<String, BackendError> {
        let result = self
            .invoke("processOffer", json!({ "offer": offer }))
            .await?;
        result
            .get("value")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| BackendError::Protocol("processOffer result missing answer".into()))
    }

    /// Start local candidate gathering on the endpoint.
    pub async fn gather_candidates(&self) -> Result<(), BackendError> {
        self.invoke("gatherCandidates", json!({})).await?;
        Ok(())
    }

    pub async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), BackendError> {
        let value = serde_json::to_value(candidate)
            .map_err(|e| BackendError::Protocol(format!("unserializable candidate: {e}")))?;
        self.invoke("addIceCandidate", json!({ "candidate": value }))
            .await?;
        Ok(())
    }

    /// Connect this endpoint's media output into `sink` (pass `self` for
    /// loop-back).
    pub async fn connect(&self, sink: &EndpointHandle) -> Result<(), BackendError> {
        self.invoke("connect", json!({ "sink": sink.id })).await?;
        Ok(())
    }

    /// Register for `OnIceCandidate` events on this endpoint. Candidates
    /// are delivered into `sink` as they are gathered by the media server.
    pub async fn subscribe_ice(
        &self,
        sink: mpsc::Sender<IceCandidate>,
    ) -> Result<(), BackendError> {
        let (reply, rx) = oneshot::channel();
        self.conn
            .tx
            .send(Command::Subscribe {
                object: self.id.clone(),
                sink,
                reply,
            })
            .await
            .map_err(|_| BackendError::ConnectionClosed)?;
        match tokio::time::timeout(self.conn.response_timeout, rx).await {
            Err(_) => Err(BackendError::Timeout),
            Ok(Err(_)) => Err(BackendError::ConnectionClosed),
            Ok(Ok(result)) => result.map(|_| ()),
        }
    }

    async fn invoke(&self, operation: &'static str, params: Value) -> Result<Value, BackendError> {
        self.conn
            .call(
                "invoke",
                json!({
                    "object": self.id,
                    "operation": operation,
                    "operationParams": params,
                }),
            )
            .await
    }
}

fn object_id(result: &Value) -> Result<String, BackendError> {
    result
        .get("value")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| BackendError::Protocol("create result missing object id".into()))
}

/// Keepalive interval expected by the media server.
const PING_INTERVAL: Duration = Duration::from_secs(240);

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// The io task: sole owner of the WebSocket. Correlates responses to
/// pending requests by id, routes candidate events to subscription sinks,
/// and echoes the server-assigned session id on every request after the
/// first response (the media server uses it to recognize the client).
async fn io_task(mut ws: WsStream, mut rx: mpsc::Receiver<Command>) {
    use tokio_tungstenite::tungstenite::Message;

    let mut pending: HashMap<u64, oneshot::Sender<Result<Value, BackendError>>> = HashMap::new();
    let mut sinks: HashMap<String, mpsc::Sender<IceCandidate>> = HashMap::new();
    let mut server_session: Option<String> = None;
    let mut next_id: u64 = 0;

    let mut keepalive = tokio::time::interval(PING_INTERVAL);
    keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    keepalive.tick().await; // the first tick fires immediately

    loop {
        tokio::select! {
            cmd = rx.recv() => {
                let Some(cmd) = cmd else {
                    // Every handle dropped; close the connection.
                    let _ = ws.close(None).await;
                    break;
                };
                next_id += 1;
                let (text, reply) = match cmd {
                    Command::Call { method, params, reply } => {
                        (wire::request(next_id, method, params, server_session.as_deref()), reply)
                    }
                    Command::Subscribe { object, sink, reply } => {
                        // Register the sink before the request goes out so no
                        // event can slip through between response and routing.
                        sinks.insert(object.clone(), sink);
                        let params = json!({ "object": object, "type": "OnIceCandidate" });
                        (wire::request(next_id, "subscribe", params, server_session.as_deref()), reply)
                    }
                };
                if let Err(e) = ws.send(Message::Text(text.into())).await {
                    warn!("Media server send failed: {e}");
                    let _ = reply.send(Err(BackendError::ConnectionClosed));
                    break;
                }
                pending.insert(next_id, reply);
            }
            msg = ws.next() => {
                let text = match msg {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | None => {
                        info!("Media server closed the connection");
                        break;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        warn!("Media server connection error: {e}");
                        break;
                    }
                };
                match wire::parse(&text) {
                    Ok(wire::Incoming::Response { id, session_id, result }) => {
                        if server_session.is_none() {
                            server_session = session_id;
                        }
                        match pending.remove(&id) {
                            Some(reply) => { let _ = reply.send(result); }
                            None => debug!(id, "Response for unknown request id"),
                        }
                    }
                    Ok(wire::Incoming::IceEvent { object, candidate }) => {
                        match sinks.get(&object) {
                            Some(sink) => match sink.try_send(candidate) {
                                Ok(()) => {}
                                Err(mpsc::error::TrySendError::Full(_)) => {
                                    warn!(%object, "Candidate sink full, event dropped");
                                }
                                Err(mpsc::error::TrySendError::Closed(_)) => {
                                    sinks.remove(&object);
                                }
                            },
                            None => debug!(%object, "Candidate event for unknown endpoint"),
                        }
                    }
                    Ok(wire::Incoming::Other) => {}
                    Err(e) => warn!("Unparseable media server message: {e}"),
                }
            }
            _ = keepalive.tick() => {
                next_id += 1;
                let text = wire::request(
                    next_id,
                    "ping",
                    json!({ "interval": PING_INTERVAL.as_millis() as u64 * 2 }),
                    server_session.as_deref(),
                );
                if ws.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
                // Pong responses carry no payload anyone waits for; an
                // unknown-id response is simply logged at debug.
            }
        }
    }

    // Fail every in-flight request so callers unblock.
    for (_, reply) in pending.drain() {
        let _ = reply.send(Err(BackendError::ConnectionClosed));
    }
}

/// JSON-RPC 2.0 framing for the media server protocol.
pub(crate) mod wire {
    use super::*;

    pub fn request(id: u64, method: &str, params: Value, session_id: Option<&str>) -> String {
        let mut params = params;
        if let (Some(sid), Some(obj)) = (session_id, params.as_object_mut()) {
            obj.insert("sessionId".to_string(), json!(sid));
        }
        json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        })
        .to_string()
    }

    pub enum Incoming {
        Response {
            id: u64,
            /// Server-assigned session id, present on create/invoke results.
            session_id: Option<String>,
            result: Result<Value, BackendError>,
        },
        IceEvent {
            object: String,
            candidate: IceCandidate,
        },
        Other,
    }

    pub fn parse(text: &str) -> Result<Incoming, BackendError> {
        let msg: Value = serde_json::from_str(text)
            .map_err(|e| BackendError::Protocol(format!("invalid JSON: {e}")))?;

        if let Some(id) = msg.get("id").and_then(Value::as_u64) {
            if let Some(error) = msg.get("error") {
                let code = error.get("code").and_then(Value::as_i64).unwrap_or(0);
                let message = error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error")
                    .to_string();
                return Ok(Incoming::Response {
                    id,
                    session_id: None,
                    result: Err(BackendError::Rpc { code, message }),
                });
            }
            let result = msg.get("result").cloned().unwrap_or(Value::Null);
            let session_id = result
                .get("sessionId")
                .and_then(Value::as_str)
                .map(str::to_string);
            return Ok(Incoming::Response {
                id,
                session_id,
                result: Ok(result),
            });
        }

        if msg.get("method").and_then(Value::as_str) == Some("onEvent") {
            let value = &msg["params"]["value"];
            if value.get("type").and_then(Value::as_str) == Some("OnIceCandidate") {
                let object = value
                    .get("object")
                    .and_then(Value::as_str)
                    .ok_or_else(|| BackendError::Protocol("event missing object".into()))?
                    .to_string();
                let candidate: IceCandidate =
                    serde_json::from_value(value["data"]["candidate"].clone()).map_err(|e| {
                        BackendError::Protocol(format!("malformed candidate event: {e}"))
                    })?;
                return Ok(Incoming::IceEvent { object, candidate });
            }
            return Ok(Incoming::Other);
        }

        Ok(Incoming::Other)
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_includes_jsonrpc_envelope() {
        let text = wire::request(7, "create", json!({ "type": "MediaPipeline" }), None);
        let msg: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(msg["jsonrpc"], "2.0");
        assert_eq!(msg["id"], 7);
        assert_eq!(msg["method"], "create");
        assert_eq!(msg["params"]["type"], "MediaPipeline");
        assert!(msg["params"].get("sessionId").is_none());
    }

    #[test]
    fn request_echoes_server_session_id() {
        let text = wire::request(8, "invoke", json!({ "object": "o1" }), Some("sess-42"));
        let msg: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(msg["params"]["sessionId"], "sess-42");
    }

    #[test]
    fn parse_success_response() {
        let incoming = wire::parse(
            r#"{"jsonrpc":"2.0","id":3,"result":{"value":"pipe-1","sessionId":"sess-42"}}"#,
        )
        .unwrap();
        match incoming {
            wire::Incoming::Response {
                id,
                session_id,
                result,
            } => {
                assert_eq!(id, 3);
                assert_eq!(session_id.as_deref(), Some("sess-42"));
                assert_eq!(result.unwrap()["value"], "pipe-1");
            }
            _ => panic!("Expected Response"),
        }
    }

    #[test]
    fn parse_error_response() {
        let incoming = wire::parse(
            r#"{"jsonrpc":"2.0","id":4,"error":{"code":40101,"message":"object not found"}}"#,
        )
        .unwrap();
        match incoming {
            wire::Incoming::Response { id, result, .. } => {
                assert_eq!(id, 4);
                match result {
                    Err(BackendError::Rpc { code, message }) => {
                        assert_eq!(code, 40101);
                        assert_eq!(message, "object not found");
                    }
                    other => panic!("Expected Rpc error, got {other:?}"),
                }
            }
            _ => panic!("Expected Response"),
        }
    }

    #[test]
    fn parse_ice_event() {
        let incoming = wire::parse(
            r#"{
                "jsonrpc": "2.0",
                "method": "onEvent",
                "params": {
                    "value": {
                        "object": "ep-1",
                        "type": "OnIceCandidate",
                        "data": {
                            "candidate": {
                                "candidate": "candidate:1 1 UDP 2130706431 10.0.0.5 9 typ host",
                                "sdpMid": "0",
                                "sdpMLineIndex": 0
                            }
                        }
                    }
                }
            }"#,
        )
        .unwrap();
        match incoming {
            wire::Incoming::IceEvent { object, candidate } => {
                assert_eq!(object, "ep-1");
                assert!(candidate.candidate.contains("typ host"));
            }
            _ => panic!("Expected IceEvent"),
        }
    }

    #[test]
    fn parse_unrelated_event_is_other() {
        let incoming = wire::parse(
            r#"{"jsonrpc":"2.0","method":"onEvent","params":{"value":{"object":"ep-1","type":"MediaStateChanged","data":{}}}}"#,
        )
        .unwrap();
        assert!(matches!(incoming, wire::Incoming::Other));
    }

    #[test]
    fn parse_rejects_non_json() {
        assert!(wire::parse("definitely not json").is_err());
    }

    #[tokio::test]
    async fn create_pipeline_issues_create_call() {
        let (conn, log, _sinks) = testing::obliging_conn();
        let pipeline = conn.create_pipeline().await.unwrap();
        assert_eq!(pipeline.id(), "MediaPipeline-1");

        let log = log.lock().unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].0, "create");
        assert_eq!(log[0].1["type"], "MediaPipeline");
    }

    #[tokio::test]
    async fn endpoint_invoke_carries_object_and_operation() {
        let (conn, log, _sinks) = testing::obliging_conn();
        let pipeline = conn.create_pipeline().await.unwrap();
        let endpoint = pipeline.create_webrtc_endpoint().await.unwrap();

        let answer = endpoint.process_offer("v=0\r\noffer").await.unwrap();
        assert_eq!(answer, "v=0\r\nanswer");

        let log = log.lock().unwrap();
        let (method, params) = log.last().unwrap();
        assert_eq!(method, "invoke");
        assert_eq!(params["object"], endpoint.id());
        assert_eq!(params["operation"], "processOffer");
        assert_eq!(params["operationParams"]["offer"], "v=0\r\noffer");
    }

    #[tokio::test]
    async fn handles_debug_with_their_object_id() {
        let (conn, _log, _sinks) = testing::obliging_conn();
        let pipeline = conn.create_pipeline().await.unwrap();
        let endpoint = pipeline.create_webrtc_endpoint().await.unwrap();
        assert!(format!("{pipeline:?}").contains("MediaPipeline-1"));
        assert!(format!("{endpoint:?}").contains("WebRtcEndpoint-2"));
    }

    #[tokio::test]
    async fn rpc_error_propagates_to_caller() {
        let (conn, _log, _sinks) = testing::scripted_conn(|_, _| {
            Err(BackendError::Rpc {
                code: 40000,
                message: "no resources".into(),
            })
        });
        let err = conn.create_pipeline().await.unwrap_err();
        assert!(matches!(err, BackendError::Rpc { code: 40000, .. }));
    }

    #[tokio::test]
    async fn media_client_reuses_the_connection() {
        let (conn, log, _sinks) = testing::obliging_conn();
        let client = MediaClient::preconnected(conn);

        let a = client.acquire().await.unwrap();
        let b = client.acquire().await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        a.create_pipeline().await.unwrap();
        b.create_pipeline().await.unwrap();
        assert_eq!(log.lock().unwrap().len(), 2);
    }
}
