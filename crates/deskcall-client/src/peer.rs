//! Peer-connection seam between the negotiation engine and an RTC stack.
//!
//! The engine only ever manipulates SDP and candidate strings through
//! [`PeerSession`], so a browser bridge, a native stack or a test double can
//! slot in without the engine noticing. [`SdpPeer`] is the built-in
//! implementation: it fabricates a minimal SDP pair and models ICE state
//! locally, which is all the signaling plane needs. STUN/TURN server URLs
//! are supplied at construction and never hard-coded.

use std::sync::atomic::{AtomicU64, Ordering};

use deskcall_common::{Error, Result};

/// ICE connectivity as seen by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceState {
    New,
    Checking,
    Connected,
    Failed,
}

/// One peer connection's worth of negotiation state.
pub trait PeerSession: Send {
    /// Create the local offer and start gathering candidates.
    fn create_offer(&mut self) -> Result<String>;
    /// Create an answer to the remote offer set beforehand.
    fn create_answer(&mut self) -> Result<String>;
    fn set_remote_description(&mut self, sdp: &str) -> Result<()>;
    fn has_remote_description(&self) -> bool;
    fn add_ice_candidate(&mut self, candidate: &str) -> Result<()>;
    /// Drain candidates gathered since the last call.
    fn take_local_candidates(&mut self) -> Vec<String>;
    fn ice_state(&self) -> IceState;
    fn close(&mut self);
}

/// Creates peer sessions. Injected into the engine so tests can substitute
/// deterministic doubles.
pub trait PeerFactory: Send + Sync {
    fn connect(&self, ice_servers: &[String]) -> Result<Box<dyn PeerSession>>;
}

static SDP_SESSION_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Default signaling-plane peer. Produces syntactically plausible SDP and
/// host/server-reflexive candidate lines; connectivity is modeled as
/// reached once a remote candidate is applied after the remote description.
pub struct SdpPeer {
    ice_servers: Vec<String>,
    session_tag: u64,
    local_sdp: Option<String>,
    remote_sdp: Option<String>,
    gathered: Vec<String>,
    ice: IceState,
    closed: bool,
}

impl SdpPeer {
    fn new(ice_servers: Vec<String>) -> Self {
        Self {
            ice_servers,
            session_tag: SDP_SESSION_COUNTER.fetch_add(1, Ordering::Relaxed),
            local_sdp: None,
            remote_sdp: None,
            gathered: Vec::new(),
            ice: IceState::New,
            closed: false,
        }
    }

    fn build_sdp(&self, setup: &str) -> String {
        format!(
            "v=0\r\n\
             o=deskcall {tag} 0 IN IP4 0.0.0.0\r\n\
             s=deskcall\r\n\
             t=0 0\r\n\
             m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n\
             a=setup:{setup}\r\n\
             m=video 9 UDP/TLS/RTP/SAVPF 96\r\n\
             a=setup:{setup}\r\n",
            tag = self.session_tag,
        )
    }

    fn gather_candidates(&mut self) {
        self.gathered
            .push("candidate:1 1 udp 2122260223 0.0.0.0 9 typ host".to_string());
        for (index, server) in self.ice_servers.iter().enumerate() {
            self.gathered.push(format!(
                "candidate:{} 1 udp 1686052607 0.0.0.0 9 typ srflx raddr 0.0.0.0 rport 9 via {server}",
                index + 2,
            ));
        }
        self.ice = IceState::Checking;
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::internal("peer session already closed"));
        }
        Ok(())
    }
}

impl PeerSession for SdpPeer {
    fn create_offer(&mut self) -> Result<String> {
        self.ensure_open()?;
        let sdp = self.build_sdp("actpass");
        self.local_sdp = Some(sdp.clone());
        self.gather_candidates();
        Ok(sdp)
    }

    fn create_answer(&mut self) -> Result<String> {
        self.ensure_open()?;
        if self.remote_sdp.is_none() {
            return Err(Error::internal(
                "cannot answer before the remote description is set",
            ));
        }
        let sdp = self.build_sdp("active");
        self.local_sdp = Some(sdp.clone());
        self.gather_candidates();
        Ok(sdp)
    }

    fn set_remote_description(&mut self, sdp: &str) -> Result<()> {
        self.ensure_open()?;
        if !sdp.starts_with("v=0") {
            return Err(Error::serialization("malformed SDP description"));
        }
        self.remote_sdp = Some(sdp.to_string());
        Ok(())
    }

    fn has_remote_description(&self) -> bool {
        self.remote_sdp.is_some()
    }

    fn add_ice_candidate(&mut self, candidate: &str) -> Result<()> {
        self.ensure_open()?;
        if !candidate.starts_with("candidate:") {
            return Err(Error::serialization("malformed ICE candidate"));
        }
        // A workable pair needs both descriptions; the first candidate
        // applied after that point completes connectivity in this model.
        if self.remote_sdp.is_some() && self.local_sdp.is_some() {
            self.ice = IceState::Connected;
        }
        Ok(())
    }

    fn take_local_candidates(&mut self) -> Vec<String> {
        std::mem::take(&mut self.gathered)
    }

    fn ice_state(&self) -> IceState {
        self.ice
    }

    fn close(&mut self) {
        self.closed = true;
        self.ice = IceState::Failed;
    }
}

/// Factory for [`SdpPeer`] sessions.
#[derive(Default)]
pub struct SdpPeerFactory;

impl PeerFactory for SdpPeerFactory {
    fn connect(&self, ice_servers: &[String]) -> Result<Box<dyn PeerSession>> {
        Ok(Box::new(SdpPeer::new(ice_servers.to_vec())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> Box<dyn PeerSession> {
        SdpPeerFactory
            .connect(&["stun:stun.example.org:3478".to_string()])
            .expect("connect")
    }

    #[test]
    fn test_offer_carries_media_sections_and_candidates() {
        let mut p = peer();
        let offer = p.create_offer().expect("offer");
        assert!(offer.starts_with("v=0"));
        assert!(offer.contains("m=audio"));
        assert!(offer.contains("m=video"));

        let candidates = p.take_local_candidates();
        assert_eq!(candidates.len(), 2);
        assert!(candidates[1].contains("stun.example.org"));
        assert!(p.take_local_candidates().is_empty());
    }

    #[test]
    fn test_answer_requires_remote_description() {
        let mut p = peer();
        assert!(p.create_answer().is_err());
        p.set_remote_description("v=0\r\nm=audio 9").expect("set");
        assert!(p.create_answer().is_ok());
    }

    #[test]
    fn test_ice_connects_after_description_and_candidate() {
        let mut p = peer();
        p.create_offer().expect("offer");
        assert_eq!(p.ice_state(), IceState::Checking);
        p.add_ice_candidate("candidate:1 1 udp 1 0.0.0.0 9 typ host")
            .expect("early candidate");
        assert_eq!(p.ice_state(), IceState::Checking);

        p.set_remote_description("v=0\r\nm=audio 9").expect("set");
        p.add_ice_candidate("candidate:2 1 udp 1 0.0.0.0 9 typ host")
            .expect("candidate");
        assert_eq!(p.ice_state(), IceState::Connected);
    }

    #[test]
    fn test_rejects_malformed_payloads() {
        let mut p = peer();
        assert!(p.set_remote_description("hello").is_err());
        assert!(p.add_ice_candidate("not-a-candidate").is_err());
    }

    #[test]
    fn test_closed_session_refuses_work() {
        let mut p = peer();
        p.close();
        assert!(p.create_offer().is_err());
        assert_eq!(p.ice_state(), IceState::Failed);
    }
}
