//! Inbound frame dispatch.

use std::sync::Arc;

use tracing::{debug, info, warn};

use replicant_core::{ClientMessage, ServerMessage};

use crate::error::{Result, ServerError};
use crate::hooks::ReplicantHooks;
use crate::manager::ReplicantSessionManager;
use crate::session::ReplicantSession;

impl<H: ReplicantHooks> ReplicantSessionManager<H> {
    /// Handle one text frame received from a session's client.
    ///
    /// Malformed frames, commands other than `ping` and `auth` before a
    /// successful `auth`, failed authorization and protocol violations close
    /// the session with an error frame.
    pub async fn handle_message(&self, session_id: &str, text: &str) -> Result<()> {
        let session = self
            .session(session_id)
            .await
            .ok_or_else(|| ServerError::SessionNotFound(session_id.to_string()))?;

        let message = match ClientMessage::decode(text) {
            Ok(message) => message,
            Err(err) => {
                warn!(session = %session_id, error = %err, "Malformed message");
                self.close_session(session_id, Some(&format!("malformed message: {}", err)))
                    .await;
                return Err(err.into());
            }
        };
        debug!(session = %session_id, request = message.request_id(), kind = message.name(), "Received message");

        match message {
            ClientMessage::Ping { req } => self.acknowledge(&session, req).await,
            ClientMessage::Auth { req, token } => {
                if !self.hooks().authorize(session_id, &token).await {
                    warn!(session = %session_id, "Authorization failed");
                    self.close_session(session_id, Some("not authorized")).await;
                    return Err(ServerError::NotAuthorized(session_id.to_string()));
                }
                info!(session = %session_id, "Session authenticated");
                session.set_authenticated();
                self.acknowledge(&session, req).await
            }
            message if !session.is_authenticated() => {
                warn!(session = %session_id, kind = message.name(), "Command before authentication");
                self.close_session(session_id, Some("not authenticated")).await;
                Err(ServerError::NotAuthorized(session_id.to_string()))
            }
            ClientMessage::Etags { req, etags } => self.set_etags(session_id, Some(req), etags).await,
            ClientMessage::Sub { req, channel, filter } => {
                self.subscribe(session_id, Some(req), channel, filter).await
            }
            ClientMessage::BulkSub { req, channels, filter } => {
                self.bulk_subscribe(session_id, Some(req), channels, filter).await
            }
            ClientMessage::Unsub { req, channel } => self.unsubscribe(session_id, Some(req), channel).await,
            ClientMessage::BulkUnsub { req, channels } => {
                self.bulk_unsubscribe(session_id, Some(req), channels).await
            }
            ClientMessage::Exec { req, command, payload } => {
                match self.hooks().execute(session_id, &command, &payload).await {
                    Ok(messages) => {
                        self.process_entity_messages(messages, Some((session_id, req)))
                            .await
                    }
                    Err(err) => {
                        warn!(session = %session_id, request = req, command = %command, error = %err, "Command failed");
                        if session
                            .queue(ServerMessage::Error {
                                req: Some(req),
                                message: err.to_string(),
                            })
                            .await
                            .is_ok()
                        {
                            self.broker().queue_session(Arc::clone(&session));
                        }
                        Err(ServerError::Collector(err))
                    }
                }
            }
        }
    }

    async fn acknowledge(&self, session: &Arc<ReplicantSession>, req: u32) -> Result<()> {
        session.queue(ServerMessage::Ok { req }).await?;
        self.broker().queue_session(Arc::clone(session));
        Ok(())
    }
}
