//! Inbound frame dispatch.
//!
//! [`decide`] maps one decoded frame to an [`Action`] without side effects;
//! [`execute`] applies it against the hub or the sender's own queue.

use std::sync::Arc;

use tracing::{debug, instrument};

use super::frame::{Frame, FrameKind};
use super::hub::HubHandle;
use super::session::{Session, SessionId};
use crate::errors::{EnqueueError, GatewayError};

/// Effect of one inbound frame.
#[derive(Clone, Debug, PartialEq)]
pub enum Action {
    /// Subscribe the sender to a channel.
    Join(String),
    /// Fan the frame out; `from` is already stamped.
    Relay(Frame),
    /// Reply to the sender only.
    Reply(Frame),
    /// Discard.
    Ignore,
}

/// Interpret a frame sent by `sender`.
pub fn decide(sender: &SessionId, mut frame: Frame) -> Action {
    match frame.kind() {
        FrameKind::Join => match frame.target_channel() {
            Some(channel) => Action::Join(channel.to_string()),
            None => Action::Ignore,
        },
        FrameKind::Chat => {
            frame.from = Some(sender.to_string());
            Action::Relay(frame)
        }
        FrameKind::Ping => Action::Reply(Frame::pong()),
        FrameKind::Pong | FrameKind::Other => Action::Ignore,
    }
}

/// Apply an [`Action`] on behalf of `session`.
pub async fn execute(
    action: Action,
    session: &Session,
    hub: &HubHandle,
) -> Result<(), GatewayError> {
    match action {
        Action::Join(channel) => hub.join(session.id().clone(), channel).await,
        Action::Relay(frame) => hub.relay(session.id().clone(), frame).await,
        Action::Reply(frame) => {
            let payload: Arc<str> = frame.encode()?;
            match session.outbound().push(payload) {
                Ok(()) => {}
                Err(EnqueueError::Full) => {
                    debug!(session_id = %session.id(), "reply dropped, outbound queue full");
                }
                Err(EnqueueError::Closed) => {}
            }
            Ok(())
        }
        Action::Ignore => Ok(()),
    }
}

/// Decide and execute in one step.
#[instrument(skip_all, fields(session_id = %session.id(), kind = %frame.kind))]
pub async fn dispatch(frame: Frame, session: &Session, hub: &HubHandle) -> Result<(), GatewayError> {
    let action = decide(session.id(), frame);
    if action == Action::Ignore {
        debug!("frame ignored");
    }
    execute(action, session, hub).await
}
