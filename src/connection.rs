//! Production connection negotiator over the `webrtc` crate. One
//! `RTCPeerConnection` per remote peer, offer or answer role fixed at
//! creation, trickle disabled: each side ships a single full payload once
//! ICE gathering completes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{watch, Mutex};
use tracing::{debug, warn};
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use crate::config::MeshConfig;
use crate::error::{MeshError, Result};
use crate::media::{AudioCapture, AudioPlayback};
use crate::roster::{LinkFactory, LinkHandle, PeerLink};
use crate::session::MediaSource;
use crate::signaling::SignalBlob;

/// Acquires the microphone once and hands out a factory whose links all
/// share that capture track.
pub struct WebRtcMedia {
    config: MeshConfig,
}

impl WebRtcMedia {
    pub fn new(config: MeshConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl MediaSource for WebRtcMedia {
    async fn open(&self) -> Result<Arc<dyn LinkFactory>> {
        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                ..Default::default()
            },
            "audio".to_owned(),
            "voicemesh".to_owned(),
        ));
        let capture = AudioCapture::start(track.clone())?;

        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| MeshError::MediaSetup(e.to_string()))?;
        let api = APIBuilder::new().with_media_engine(media_engine).build();

        Ok(Arc::new(WebRtcLinkFactory {
            api,
            track,
            ice_servers: self.config.ice_servers.clone(),
            capture: Mutex::new(Some(capture)),
        }))
    }
}

pub struct WebRtcLinkFactory {
    api: API,
    track: Arc<TrackLocalStaticSample>,
    ice_servers: Vec<String>,
    capture: Mutex<Option<AudioCapture>>,
}

impl WebRtcLinkFactory {
    async fn new_connection(&self) -> Result<WebRtcLink> {
        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }],
            ..Default::default()
        };
        let pc = Arc::new(self.api.new_peer_connection(config).await?);

        pc.add_track(Arc::clone(&self.track) as Arc<dyn TrackLocal + Send + Sync>)
            .await?;

        let (ready_tx, ready_rx) = watch::channel(false);
        let ready_tx = Arc::new(ready_tx);
        let playback: Arc<Mutex<Option<AudioPlayback>>> = Arc::new(Mutex::new(None));
        let playback_slot = playback.clone();

        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let ready = ready_tx.clone();
            let slot = playback_slot.clone();
            Box::pin(async move {
                if track.kind() != RTPCodecType::Audio {
                    return;
                }
                match AudioPlayback::start(track) {
                    Ok(out) => {
                        *slot.lock().await = Some(out);
                        let _ = ready.send(true);
                    }
                    Err(e) => warn!(error = %e, "remote audio playback failed"),
                }
            })
        }));

        pc.on_peer_connection_state_change(Box::new(move |state| {
            Box::pin(async move {
                debug!(%state, "peer connection state changed");
            })
        }));

        Ok(WebRtcLink {
            pc,
            closed: AtomicBool::new(false),
            ready_rx,
            _playback: playback,
        })
    }

    /// Waits out ICE gathering and returns the full local description as the
    /// relay payload.
    async fn local_payload(pc: &RTCPeerConnection) -> Result<SignalBlob> {
        let mut gathered = pc.gathering_complete_promise().await;
        let _ = gathered.recv().await;
        let description = pc
            .local_description()
            .await
            .ok_or_else(|| MeshError::Negotiation("no local description".to_string()))?;
        Ok(SignalBlob::from_value(serde_json::to_value(&description)?))
    }
}

#[async_trait]
impl LinkFactory for WebRtcLinkFactory {
    async fn initiate(&self) -> Result<LinkHandle> {
        let link = self.new_connection().await?;
        let offer = link.pc.create_offer(None).await?;
        link.pc.set_local_description(offer).await?;
        let signal = Self::local_payload(&link.pc).await?;
        Ok(LinkHandle {
            link: Box::new(link),
            signal,
        })
    }

    async fn respond(&self, remote: SignalBlob) -> Result<LinkHandle> {
        let link = self.new_connection().await?;
        let offer: RTCSessionDescription = serde_json::from_value(remote.into_value())?;
        link.pc.set_remote_description(offer).await?;
        let answer = link.pc.create_answer(None).await?;
        link.pc.set_local_description(answer).await?;
        let signal = Self::local_payload(&link.pc).await?;
        Ok(LinkHandle {
            link: Box::new(link),
            signal,
        })
    }

    async fn release(&self) {
        if let Some(capture) = self.capture.lock().await.take() {
            capture.stop();
        }
    }
}

pub struct WebRtcLink {
    pc: Arc<RTCPeerConnection>,
    closed: AtomicBool,
    ready_rx: watch::Receiver<bool>,
    // Keeps the output stream alive for the lifetime of the link.
    _playback: Arc<Mutex<Option<AudioPlayback>>>,
}

#[async_trait]
impl PeerLink for WebRtcLink {
    async fn apply_remote(&self, signal: SignalBlob) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(());
        }
        let description: RTCSessionDescription = serde_json::from_value(signal.into_value())?;
        match self.pc.set_remote_description(description).await {
            Ok(()) => Ok(()),
            // A completion racing our own close is not a failure.
            Err(_) if self.closed.load(Ordering::SeqCst) => Ok(()),
            Err(e) => Err(MeshError::Negotiation(e.to_string())),
        }
    }

    fn remote_ready(&self) -> watch::Receiver<bool> {
        self.ready_rx.clone()
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Err(e) = self.pc.close().await {
            debug!(error = %e, "peer connection close");
        }
    }
}
