use chrono::{DateTime, Utc};

use palaver_core::envelope::CallEvent;
use palaver_core::{EngineError, SessionId, UserId};

/// An in-progress call on a peer-to-peer topic.
#[derive(Clone, Debug)]
pub struct CallInProgress {
    pub initiator: UserId,
    pub initiator_sid: SessionId,
    pub callee: UserId,
    pub state: CallState,
    pub started: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallState {
    /// Invite sent, waiting for the callee to pick up.
    Ringing,
    /// Both parties in; SDP/ICE exchange and media flow.
    Accepted,
}

impl CallInProgress {
    pub fn new(initiator: UserId, initiator_sid: SessionId, callee: UserId) -> Self {
        Self {
            initiator,
            initiator_sid,
            callee,
            state: CallState::Ringing,
            started: Utc::now(),
        }
    }

    pub fn other_party(&self, uid: UserId) -> UserId {
        if uid == self.initiator {
            self.callee
        } else {
            self.initiator
        }
    }

    pub fn is_participant(&self, uid: UserId) -> bool {
        uid == self.initiator || uid == self.callee
    }
}

/// What the topic actor should do with a call event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CallDecision {
    /// Begin ringing: record the call and arm the establishment timer.
    Start { callee: UserId },
    /// Forward the event to the other participant.
    Relay { to: UserId },
    /// Callee picked up: disarm the timer and forward.
    Accept { to: UserId },
    /// Call over: clear state and notify the other participant.
    Terminate { notify: UserId },
    /// Event violates the state machine; drop it.
    Reject(EngineError),
}

/// Pure transition function for the call state machine. `participants`
/// are the two users of the p2p topic; events from anyone else are
/// rejected before they can disturb an ongoing call.
pub fn decide(
    call: Option<&CallInProgress>,
    event: CallEvent,
    from: UserId,
    participants: (UserId, UserId),
) -> CallDecision {
    let (a, b) = participants;
    if from != a && from != b {
        return CallDecision::Reject(EngineError::PermissionDenied);
    }

    match (call, event) {
        (None, CallEvent::Invite) => {
            let callee = if from == a { b } else { a };
            CallDecision::Start { callee }
        }
        (None, _) => CallDecision::Reject(EngineError::Malformed("no call in progress".into())),
        (Some(c), _) if !c.is_participant(from) => {
            CallDecision::Reject(EngineError::PermissionDenied)
        }
        (Some(_), CallEvent::Invite) => {
            CallDecision::Reject(EngineError::AlreadyAttached("call in progress".into()))
        }
        (Some(c), CallEvent::Ringing) => {
            // Only the callee reports ringing, and only before pickup.
            if from == c.callee && c.state == CallState::Ringing {
                CallDecision::Relay { to: c.initiator }
            } else {
                CallDecision::Reject(EngineError::Malformed("unexpected ringing".into()))
            }
        }
        (Some(c), CallEvent::Accept) => {
            if from == c.callee && c.state == CallState::Ringing {
                CallDecision::Accept { to: c.initiator }
            } else {
                CallDecision::Reject(EngineError::Malformed("unexpected accept".into()))
            }
        }
        (Some(c), CallEvent::Offer | CallEvent::Answer | CallEvent::IceCandidate) => {
            if c.state == CallState::Accepted {
                CallDecision::Relay {
                    to: c.other_party(from),
                }
            } else {
                CallDecision::Reject(EngineError::Malformed("call not established".into()))
            }
        }
        (Some(c), CallEvent::HangUp) => CallDecision::Terminate {
            notify: c.other_party(from),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALICE: UserId = UserId(1);
    const BOB: UserId = UserId(2);
    const EVE: UserId = UserId(9);

    fn ringing() -> CallInProgress {
        CallInProgress::new(ALICE, SessionId::new(), BOB)
    }

    fn accepted() -> CallInProgress {
        let mut c = ringing();
        c.state = CallState::Accepted;
        c
    }

    #[test]
    fn invite_starts_ringing() {
        let d = decide(None, CallEvent::Invite, ALICE, (ALICE, BOB));
        assert_eq!(d, CallDecision::Start { callee: BOB });
    }

    #[test]
    fn outsider_cannot_touch_the_call() {
        let d = decide(None, CallEvent::Invite, EVE, (ALICE, BOB));
        assert!(matches!(d, CallDecision::Reject(_)));
        let c = ringing();
        let d = decide(Some(&c), CallEvent::HangUp, EVE, (ALICE, BOB));
        assert!(matches!(d, CallDecision::Reject(_)));
    }

    #[test]
    fn second_invite_rejected() {
        let c = ringing();
        let d = decide(Some(&c), CallEvent::Invite, BOB, (ALICE, BOB));
        assert!(matches!(d, CallDecision::Reject(_)));
    }

    #[test]
    fn callee_accepts_ringing_call() {
        let c = ringing();
        let d = decide(Some(&c), CallEvent::Accept, BOB, (ALICE, BOB));
        assert_eq!(d, CallDecision::Accept { to: ALICE });
    }

    #[test]
    fn initiator_cannot_accept_own_call() {
        let c = ringing();
        let d = decide(Some(&c), CallEvent::Accept, ALICE, (ALICE, BOB));
        assert!(matches!(d, CallDecision::Reject(_)));
    }

    #[test]
    fn sdp_requires_established_call() {
        let c = ringing();
        let d = decide(Some(&c), CallEvent::Offer, ALICE, (ALICE, BOB));
        assert!(matches!(d, CallDecision::Reject(_)));

        let c = accepted();
        let d = decide(Some(&c), CallEvent::Offer, ALICE, (ALICE, BOB));
        assert_eq!(d, CallDecision::Relay { to: BOB });
        let d = decide(Some(&c), CallEvent::IceCandidate, BOB, (ALICE, BOB));
        assert_eq!(d, CallDecision::Relay { to: ALICE });
    }

    #[test]
    fn either_party_can_hang_up() {
        let c = ringing();
        let d = decide(Some(&c), CallEvent::HangUp, ALICE, (ALICE, BOB));
        assert_eq!(d, CallDecision::Terminate { notify: BOB });

        let c = accepted();
        let d = decide(Some(&c), CallEvent::HangUp, BOB, (ALICE, BOB));
        assert_eq!(d, CallDecision::Terminate { notify: ALICE });
    }

    #[test]
    fn events_without_call_rejected() {
        for ev in [CallEvent::Accept, CallEvent::Offer, CallEvent::HangUp] {
            let d = decide(None, ev, ALICE, (ALICE, BOB));
            assert!(matches!(d, CallDecision::Reject(_)), "{ev:?}");
        }
    }
}
