//! Orchestration of one `start` negotiation against the media server.
//!
//! The sequence mirrors what the media server expects: create a pipeline,
//! create a WebRTC endpoint inside it, subscribe to its candidate events
//! before applying the offer, process the offer, then commit the session
//! (which drains every candidate buffered during the round trips) and only
//! then start candidate gathering. Any failure along the way releases the
//! pipeline and rolls the session back so the client can retry.

use mediagate_protocol::{IceCandidate, RtpConfig};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::backend::{BackendError, EndpointHandle, MediaClient, PipelineHandle};
use crate::session::{CommitOutcome, NegotiationToken, SessionRecord, Sessions};

#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error(transparent)]
    Backend(#[from] BackendError),
    /// The client stopped (or disconnected) while negotiation was in
    /// flight. Resources are already released; nothing goes to the client.
    #[error("negotiation cancelled by stop")]
    Cancelled,
}

/// Run a full negotiation for `session_id`, returning the SDP answer.
/// `token` is the claim handed out by `Sessions::begin`; candidates
/// gathered by the media server flow into `ice_sink`.
pub async fn start_session(
    backend: &MediaClient,
    sessions: &Sessions,
    rtp: &RtpConfig,
    session_id: Uuid,
    token: NegotiationToken,
    sdp_offer: &str,
    ice_sink: mpsc::Sender<IceCandidate>,
) -> Result<String, StartError> {
    let conn = match backend.acquire().await {
        Ok(conn) => conn,
        Err(e) => {
            sessions.abort(session_id, token).await;
            return Err(e.into());
        }
    };

    let pipeline = match conn.create_pipeline().await {
        Ok(pipeline) => pipeline,
        Err(e) => {
            sessions.abort(session_id, token).await;
            return Err(e.into());
        }
    };

    let (endpoint, answer) = match build_endpoint(&pipeline, sdp_offer, ice_sink).await {
        Ok(built) => built,
        Err(e) => {
            sessions.abort(session_id, token).await;
            release_quietly(&pipeline).await;
            return Err(e.into());
        }
    };

    let record = SessionRecord {
        pipeline: pipeline.clone(),
        endpoint: endpoint.clone(),
    };
    if sessions.commit(session_id, token, record).await == CommitOutcome::Cancelled {
        release_quietly(&pipeline).await;
        return Err(StartError::Cancelled);
    }
    info!(session = %session_id, pipeline = %pipeline.id(), "Session established");

    // The session is live; the remaining steps only degrade media quality
    // when they fail, so they log instead of unwinding.
    if let Err(e) = endpoint.gather_candidates().await {
        warn!(session = %session_id, "Candidate gathering failed: {e}");
    }
    if let Err(e) = endpoint.connect(&endpoint).await {
        warn!(session = %session_id, "Loop-back connect failed: {e}");
    }
    if rtp.enabled {
        if let Err(e) = forward_rtp(&pipeline, &endpoint, rtp).await {
            warn!(session = %session_id, "RTP forwarding setup failed: {e}");
        }
    }

    Ok(answer)
}

/// Create the WebRTC endpoint and produce the answer. Subscribing happens
/// before `processOffer` so no gathered candidate can be emitted without a
/// registered sink.
async fn build_endpoint(
    pipeline: &PipelineHandle,
    sdp_offer: &str,
    ice_sink: mpsc::Sender<IceCandidate>,
) -> Result<(EndpointHandle, String), BackendError> {
    let endpoint = pipeline.create_webrtc_endpoint().await?;
    endpoint.subscribe_ice(ice_sink).await?;
    let answer = endpoint.process_offer(sdp_offer).await?;
    Ok((endpoint, answer))
}

async fn release_quietly(pipeline: &PipelineHandle) {
    if let Err(e) = pipeline.release().await {
        warn!(pipeline = %pipeline.id(), "Pipeline release failed: {e}");
    }
}

/// Fork the session's media into a static RTP receiver (for example an
/// external streaming server listening on a fixed port).
async fn forward_rtp(
    pipeline: &PipelineHandle,
    source: &EndpointHandle,
    rtp: &RtpConfig,
) -> Result<(), BackendError> {
    let rtp_endpoint = pipeline.create_rtp_endpoint().await?;
    rtp_endpoint
        .process_offer(&rtp_receiver_offer(&rtp.address, rtp.port))
        .await?;
    source.connect(&rtp_endpoint).await?;
    info!(address = %rtp.address, port = rtp.port, "Forwarding media over RTP");
    Ok(())
}

/// A receive-only H.264 SDP describing the fixed RTP destination. The
/// receiver never answers, so the endpoint is told everything up front.
fn rtp_receiver_offer(address: &str, port: u16) -> String {
    format!(
        "v=0\r\n\
         o=- 0 0 IN IP4 {address}\r\n\
         s=RTP forward\r\n\
         c=IN IP4 {address}\r\n\
         t=0 0\r\n\
         m=video {port} RTP/AVP 103\r\n\
         a=rtpmap:103 H264/90000\r\n\
         a=recvonly\r\n"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::testing::{obliging_conn, scripted_conn};
    use serde_json::json;

    fn no_rtp() -> RtpConfig {
        toml::from_str("").unwrap()
    }

    fn candidate(n: u32) -> IceCandidate {
        IceCandidate::new(format!("candidate:{n} 1 UDP 1 10.0.0.{n} 9 typ host"))
    }

    #[tokio::test]
    async fn happy_path_establishes_and_answers() {
        let (conn, log, _sinks) = obliging_conn();
        let backend = MediaClient::preconnected(conn);
        let sessions = Sessions::new();
        let id = Uuid::new_v4();
        let (ice_tx, _ice_rx) = mpsc::channel(8);

        let token = sessions.begin(id).await.unwrap();
        let answer = start_session(
            &backend,
            &sessions,
            &no_rtp(),
            id,
            token,
            "v=0\r\noffer",
            ice_tx,
        )
        .await
        .unwrap();
        assert_eq!(answer, "v=0\r\nanswer");
        assert!(sessions.record(id).await.is_some());

        // The backend saw the canonical sequence
        let log = log.lock().unwrap();
        let methods: Vec<String> = log
            .iter()
            .map(|(m, p)| {
                p.get("operation")
                    .and_then(serde_json::Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| m.clone())
            })
            .collect();
        assert_eq!(
            methods,
            vec![
                "create",      // MediaPipeline
                "create",      // WebRtcEndpoint
                "subscribe",   // before processOffer
                "processOffer",
                "gatherCandidates",
                "connect",
            ]
        );
    }

    #[tokio::test]
    async fn gathered_candidates_reach_the_sink() {
        let (conn, _log, mut sinks) = obliging_conn();
        let backend = MediaClient::preconnected(conn);
        let sessions = Sessions::new();
        let id = Uuid::new_v4();
        let (ice_tx, mut ice_rx) = mpsc::channel(8);

        let token = sessions.begin(id).await.unwrap();
        start_session(
            &backend,
            &sessions,
            &no_rtp(),
            id,
            token,
            "v=0\r\noffer",
            ice_tx,
        )
        .await
        .unwrap();

        let sink = sinks.recv().await.unwrap();
        sink.send(candidate(9)).await.unwrap();
        let received = ice_rx.recv().await.unwrap();
        assert!(received.candidate.starts_with("candidate:9"));
    }

    #[tokio::test]
    async fn pipeline_failure_rolls_back() {
        let (conn, _log, _sinks) = scripted_conn(|_, _| {
            Err(BackendError::Unavailable {
                uri: "ws://localhost:8888/kurento".into(),
                reason: "connection refused".into(),
            })
        });
        let backend = MediaClient::preconnected(conn);
        let sessions = Sessions::new();
        let id = Uuid::new_v4();
        let (ice_tx, _ice_rx) = mpsc::channel(8);

        let token = sessions.begin(id).await.unwrap();
        let err = start_session(
            &backend,
            &sessions,
            &no_rtp(),
            id,
            token,
            "v=0\r\noffer",
            ice_tx,
        )
        .await
        .unwrap_err();
        assert!(matches!(
            err,
            StartError::Backend(BackendError::Unavailable { .. })
        ));
        assert!(sessions.record(id).await.is_none());

        // The session is retryable afterwards
        sessions.begin(id).await.unwrap();
    }

    #[tokio::test]
    async fn offer_failure_releases_the_pipeline() {
        let mut counter = 0u32;
        let (conn, log, _sinks) = scripted_conn(move |method, params| match method {
            "create" => {
                counter += 1;
                Ok(json!({ "value": format!("obj-{counter}") }))
            }
            "invoke" if params["operation"] == "processOffer" => Err(BackendError::Rpc {
                code: 40001,
                message: "SDP_PARSE_ERROR".into(),
            }),
            _ => Ok(json!({})),
        });
        let backend = MediaClient::preconnected(conn);
        let sessions = Sessions::new();
        let id = Uuid::new_v4();
        let (ice_tx, _ice_rx) = mpsc::channel(8);

        let token = sessions.begin(id).await.unwrap();
        let err = start_session(
            &backend,
            &sessions,
            &no_rtp(),
            id,
            token,
            "garbage",
            ice_tx,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, StartError::Backend(BackendError::Rpc { .. })));

        let log = log.lock().unwrap();
        let (method, params) = log.last().unwrap();
        assert_eq!(method, "release");
        assert_eq!(params["object"], "obj-1");
    }

    #[tokio::test]
    async fn buffered_candidates_drain_after_commit() {
        let (conn, log, _sinks) = obliging_conn();
        let backend = MediaClient::preconnected(conn);
        let sessions = Sessions::new();
        let id = Uuid::new_v4();
        let (ice_tx, _ice_rx) = mpsc::channel(8);

        // Candidates arrive before start, in order
        sessions.add_candidate(id, candidate(1)).await.unwrap();
        sessions.add_candidate(id, candidate(2)).await.unwrap();

        let token = sessions.begin(id).await.unwrap();
        start_session(
            &backend,
            &sessions,
            &no_rtp(),
            id,
            token,
            "v=0\r\noffer",
            ice_tx,
        )
        .await
        .unwrap();

        let log = log.lock().unwrap();
        let drained: Vec<&str> = log
            .iter()
            .filter(|(_, p)| p["operation"] == "addIceCandidate")
            .filter_map(|(_, p)| p["operationParams"]["candidate"]["candidate"].as_str())
            .collect();
        assert_eq!(drained.len(), 2);
        assert!(drained[0].starts_with("candidate:1"));
        assert!(drained[1].starts_with("candidate:2"));

        // Draining happens before gathering starts
        let drain_pos = log
            .iter()
            .position(|(_, p)| p["operation"] == "addIceCandidate")
            .unwrap();
        let gather_pos = log
            .iter()
            .position(|(_, p)| p["operation"] == "gatherCandidates")
            .unwrap();
        assert!(drain_pos < gather_pos);
    }

    #[tokio::test]
    async fn stop_during_negotiation_releases_everything() {
        let (conn, log, _sinks) = obliging_conn();
        let backend = MediaClient::preconnected(conn);
        let sessions = Sessions::new();
        let id = Uuid::new_v4();
        let (ice_tx, _ice_rx) = mpsc::channel(8);

        let token = sessions.begin(id).await.unwrap();
        // Stop lands while the negotiation task is between backend calls
        assert!(sessions.stop(id).await.is_none());

        let err = start_session(
            &backend,
            &sessions,
            &no_rtp(),
            id,
            token,
            "v=0\r\noffer",
            ice_tx,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, StartError::Cancelled));
        assert!(sessions.record(id).await.is_none());

        // The pipeline built mid-flight was released
        let log = log.lock().unwrap();
        assert!(log.iter().any(|(m, _)| m == "release"));
        // And gathering never started
        assert!(!log.iter().any(|(_, p)| p["operation"] == "gatherCandidates"));
    }

    #[tokio::test]
    async fn channel_close_mid_negotiation_leaves_no_session_behind() {
        let (conn, log, _sinks) = obliging_conn();
        let backend = MediaClient::preconnected(conn);
        let sessions = Sessions::new();
        let id = Uuid::new_v4();
        let (ice_tx, _ice_rx) = mpsc::channel(8);

        let token = sessions.begin(id).await.unwrap();
        // The browser disconnects while the backend round trips are in flight
        assert!(sessions.close(id).await.is_none());

        let err = start_session(
            &backend,
            &sessions,
            &no_rtp(),
            id,
            token,
            "v=0\r\noffer",
            ice_tx,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, StartError::Cancelled));

        // The pipeline was released and the registry holds nothing for the
        // abandoned session
        assert_eq!(sessions.len().await, 0);
        let log = log.lock().unwrap();
        assert!(log.iter().any(|(m, _)| m == "release"));
    }

    #[tokio::test]
    async fn rtp_forwarding_builds_the_fork() {
        let (conn, log, _sinks) = obliging_conn();
        let backend = MediaClient::preconnected(conn);
        let sessions = Sessions::new();
        let id = Uuid::new_v4();
        let (ice_tx, _ice_rx) = mpsc::channel(8);

        let rtp: RtpConfig = toml::from_str(
            r#"
            enabled = true
            address = "198.51.100.20"
            port = 15000
            "#,
        )
        .unwrap();

        let token = sessions.begin(id).await.unwrap();
        start_session(
            &backend,
            &sessions,
            &rtp,
            id,
            token,
            "v=0\r\noffer",
            ice_tx,
        )
        .await
        .unwrap();

        let log = log.lock().unwrap();
        assert!(log.iter().any(|(_, p)| p["type"] == "RtpEndpoint"));
        let rtp_offer = log
            .iter()
            .filter(|(_, p)| p["operation"] == "processOffer")
            .filter_map(|(_, p)| p["operationParams"]["offer"].as_str())
            .find(|offer| offer.contains("recvonly"))
            .unwrap();
        assert!(rtp_offer.contains("198.51.100.20"));
        assert!(rtp_offer.contains("m=video 15000"));
        assert!(rtp_offer.contains("H264/90000"));
    }

    #[test]
    fn rtp_offer_shape() {
        let offer = rtp_receiver_offer("192.0.2.1", 15000);
        assert!(offer.starts_with("v=0\r\n"));
        assert!(offer.contains("c=IN IP4 192.0.2.1\r\n"));
        assert!(offer.contains("m=video 15000 RTP/AVP 103\r\n"));
        assert!(offer.ends_with("a=recvonly\r\n"));
    }
}
