//! str0m media engine: a peer-to-peer WebRTC session per call.
//!
//! ```text
//!   Client A ──WebRTC (UDP)──▶ Client B
//!        ▲                          ▲
//!        └──── relay: SDP + ICE ────┘
//! ```
//!
//! Uses `str0m` in Sans-IO style:
//! - We drive the I/O (one UDP socket per session) ourselves
//! - str0m handles DTLS, SRTP, ICE, SDP negotiation
//! - The driver task is woken whenever negotiation changes the session
//!
//! Only host candidates are gathered; configured ICE servers are not contacted.
//! Capture devices are not opened either: local media is a reservation of one
//! audio and one video send track that the application feeds.

use crate::engine::{
    EngineError, EngineResult, LocalMedia, LocalTrack, MediaEngine, MediaStream, PeerSession,
    RemoteStream, SessionEvents,
};
use async_trait::async_trait;
use echo_common::models::{IceCandidate, IceServer, MediaKind, SdpType, SessionDescription};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use str0m::change::{SdpAnswer, SdpOffer, SdpPendingOffer};
use str0m::media::{Direction, MediaKind as RtcMediaKind};
use str0m::net::{Protocol, Receive};
use str0m::{Candidate, Event, IceConnectionState, Input, Output, Rtc, RtcError};
use tokio::net::UdpSocket;
use tokio::sync::Notify;

/// Media engine backed by str0m.
#[derive(Debug, Clone)]
pub struct RtcEngine {
    /// Interface address the per-session UDP socket binds to.
    bind_ip: IpAddr,
}

impl RtcEngine {
    pub fn new(bind_ip: IpAddr) -> Self {
        Self { bind_ip }
    }
}

/// One audio and one video send track.
struct ReservedTracks {
    live: AtomicBool,
}

impl MediaStream for ReservedTracks {
    fn tracks(&self) -> Vec<LocalTrack> {
        vec![
            LocalTrack {
                id: "echo-audio".into(),
                kind: MediaKind::Audio,
            },
            LocalTrack {
                id: "echo-video".into(),
                kind: MediaKind::Video,
            },
        ]
    }

    fn stop(&self) {
        if self.live.swap(false, Ordering::SeqCst) {
            tracing::debug!("Local tracks released");
        }
    }
}

#[async_trait]
impl MediaEngine for RtcEngine {
    async fn acquire_local_media(&self) -> EngineResult<LocalMedia> {
        Ok(LocalMedia::new(ReservedTracks {
            live: AtomicBool::new(true),
        }))
    }

    async fn create_session(
        &self,
        ice_servers: &[IceServer],
        events: SessionEvents,
    ) -> EngineResult<Arc<dyn PeerSession>> {
        if self.bind_ip.is_unspecified() {
            return Err(EngineError::Rtc(
                "bind address must be a concrete interface, not unspecified".into(),
            ));
        }

        // Bind a UDP socket for this session
        let socket = UdpSocket::bind(SocketAddr::new(self.bind_ip, 0)).await?;
        let local_addr = socket.local_addr()?;

        tracing::debug!(
            generation = events.generation(),
            addr = %local_addr,
            ice_servers = ice_servers.len(),
            "Bound UDP socket for session (host candidates only)"
        );

        let mut rtc = Rtc::builder().build(Instant::now());

        // Our only local candidate is the socket we bound
        let candidate = Candidate::host(local_addr, Protocol::Udp)
            .map_err(|e| EngineError::Rtc(e.to_string()))?;
        rtc.add_local_candidate(candidate.clone());

        let session = Arc::new(RtcSession {
            inner: Arc::new(Mutex::new(RtcInner {
                rtc,
                local_kinds: Vec::new(),
                pending_offer: None,
                remote_offer: None,
            })),
            wake: Arc::new(Notify::new()),
            closed: Arc::new(AtomicBool::new(false)),
        });

        tokio::spawn(drive(
            session.inner.clone(),
            socket,
            local_addr,
            events.clone(),
            session.wake.clone(),
            session.closed.clone(),
        ));

        events.local_candidate(IceCandidate {
            candidate: candidate.to_sdp_string(),
            sdp_mid: None,
            sdp_m_line_index: Some(0),
        });

        Ok(session)
    }
}

struct RtcInner {
    rtc: Rtc,
    local_kinds: Vec<MediaKind>,
    /// Our offer, waiting for the peer's answer.
    pending_offer: Option<SdpPendingOffer>,
    /// The peer's offer, waiting for us to answer.
    remote_offer: Option<SdpOffer>,
}

/// A single peer connection managed by str0m.
struct RtcSession {
    inner: Arc<Mutex<RtcInner>>,
    wake: Arc<Notify>,
    closed: Arc<AtomicBool>,
}

fn lock(inner: &Mutex<RtcInner>) -> MutexGuard<'_, RtcInner> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

fn rtc_kind(kind: MediaKind) -> RtcMediaKind {
    match kind {
        MediaKind::Audio => RtcMediaKind::Audio,
        MediaKind::Video => RtcMediaKind::Video,
    }
}

fn echo_kind(kind: RtcMediaKind) -> MediaKind {
    match kind {
        RtcMediaKind::Audio => MediaKind::Audio,
        RtcMediaKind::Video => MediaKind::Video,
    }
}

fn rtc_error(e: RtcError) -> EngineError {
    EngineError::Rtc(e.to_string())
}

impl RtcSession {
    fn ensure_open(&self) -> EngineResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(EngineError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl PeerSession for RtcSession {
    async fn add_track(&self, track: &LocalTrack) -> EngineResult<()> {
        self.ensure_open()?;
        lock(&self.inner).local_kinds.push(track.kind);
        Ok(())
    }

    async fn create_offer(&self) -> EngineResult<SessionDescription> {
        self.ensure_open()?;
        let mut inner = lock(&self.inner);
        let kinds = inner.local_kinds.clone();

        let mut change = inner.rtc.sdp_api();
        for kind in kinds {
            change.add_media(rtc_kind(kind), Direction::SendRecv, None, None, None);
        }
        let Some((offer, pending)) = change.apply() else {
            return Err(EngineError::Sdp("no media to offer".into()));
        };
        inner.pending_offer = Some(pending);
        Ok(SessionDescription::offer(offer.to_sdp_string()))
    }

    async fn create_answer(&self) -> EngineResult<SessionDescription> {
        self.ensure_open()?;
        let answer = {
            let mut inner = lock(&self.inner);
            let offer = inner
                .remote_offer
                .take()
                .ok_or_else(|| EngineError::Sdp("no remote offer to answer".into()))?;
            // Accepting adds media lines matching what the peer offered
            inner.rtc.sdp_api().accept_offer(offer).map_err(rtc_error)?
        };
        self.wake.notify_one();
        Ok(SessionDescription::answer(answer.to_sdp_string()))
    }

    async fn set_local_description(&self, description: &SessionDescription) -> EngineResult<()> {
        // str0m applies local changes when it produces them; nothing left to do
        self.ensure_open()?;
        tracing::trace!(kind = ?description.kind, "Local description in place");
        Ok(())
    }

    async fn set_remote_description(&self, description: &SessionDescription) -> EngineResult<()> {
        self.ensure_open()?;
        {
            let mut inner = lock(&self.inner);
            match description.kind {
                SdpType::Offer => {
                    let offer = SdpOffer::from_sdp_string(&description.sdp)
                        .map_err(|e| EngineError::Sdp(e.to_string()))?;
                    inner.remote_offer = Some(offer);
                }
                SdpType::Answer => {
                    let answer = SdpAnswer::from_sdp_string(&description.sdp)
                        .map_err(|e| EngineError::Sdp(e.to_string()))?;
                    let pending = inner
                        .pending_offer
                        .take()
                        .ok_or_else(|| EngineError::Sdp("answer without a pending offer".into()))?;
                    inner
                        .rtc
                        .sdp_api()
                        .accept_answer(pending, answer)
                        .map_err(rtc_error)?;
                }
            }
        }
        self.wake.notify_one();
        Ok(())
    }

    async fn add_candidate(&self, candidate: &IceCandidate) -> EngineResult<()> {
        self.ensure_open()?;
        let parsed = Candidate::from_sdp_string(&candidate.candidate)
            .map_err(|e| EngineError::Candidate(e.to_string()))?;
        lock(&self.inner).rtc.add_remote_candidate(parsed);
        self.wake.notify_one();
        Ok(())
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            lock(&self.inner).rtc.disconnect();
            self.wake.notify_one();
        }
    }
}

/// What one pass over `poll_output` produced.
struct Polled {
    transmits: Vec<(SocketAddr, Vec<u8>)>,
    deadline: Instant,
    lost: bool,
}

fn poll_rtc(inner: &Mutex<RtcInner>, events: &SessionEvents) -> Result<Polled, RtcError> {
    let mut inner = lock(inner);
    let mut transmits = Vec::new();
    loop {
        match inner.rtc.poll_output()? {
            Output::Timeout(deadline) => {
                return Ok(Polled {
                    transmits,
                    deadline,
                    lost: false,
                });
            }
            Output::Transmit(transmit) => {
                transmits.push((transmit.destination, transmit.contents.to_vec()));
            }
            Output::Event(Event::MediaAdded(added)) => {
                events.remote_stream(RemoteStream {
                    id: added.mid.to_string(),
                    kinds: vec![echo_kind(added.kind)],
                });
            }
            Output::Event(Event::IceConnectionStateChange(IceConnectionState::Disconnected)) => {
                return Ok(Polled {
                    transmits,
                    deadline: Instant::now(),
                    lost: true,
                });
            }
            Output::Event(_) => {}
        }
    }
}

/// Run the session's I/O loop until it is closed or connectivity is lost.
async fn drive(
    inner: Arc<Mutex<RtcInner>>,
    socket: UdpSocket,
    local_addr: SocketAddr,
    events: SessionEvents,
    wake: Arc<Notify>,
    closed: Arc<AtomicBool>,
) {
    let generation = events.generation();
    let mut buf = vec![0u8; 2000]; // MTU-sized buffer

    loop {
        if closed.load(Ordering::SeqCst) {
            break;
        }

        let polled = match poll_rtc(&inner, &events) {
            Ok(polled) => polled,
            Err(e) => {
                tracing::warn!(generation, error = %e, "WebRTC session failed");
                events.connection_lost();
                break;
            }
        };

        for (destination, contents) in &polled.transmits {
            if let Err(e) = socket.send_to(contents, *destination).await {
                tracing::debug!(generation, error = %e, "UDP send error");
            }
        }

        if polled.lost {
            tracing::info!(generation, "ICE disconnected");
            events.connection_lost();
            break;
        }

        let deadline = tokio::time::Instant::from_std(polled.deadline);
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => {
                lock(&inner).rtc.handle_input(Input::Timeout(Instant::now())).ok();
            }
            _ = wake.notified() => {}
            received = socket.recv_from(&mut buf) => {
                match received {
                    Ok((len, source)) => {
                        match Receive::new(Protocol::Udp, source, local_addr, &buf[..len]) {
                            Ok(receive) => {
                                let input = Input::Receive(Instant::now(), receive);
                                if let Err(e) = lock(&inner).rtc.handle_input(input) {
                                    tracing::debug!(generation, error = %e, "Dropped inbound packet");
                                }
                            }
                            Err(e) => {
                                tracing::debug!(generation, error = ?e, "Unparseable datagram");
                            }
                        }
                    }
                    Err(e) => {
                        tracing::warn!(generation, error = %e, "UDP recv error");
                        events.connection_lost();
                        break;
                    }
                }
            }
        }
    }

    tracing::debug!(generation, "Session driver stopped");
}
