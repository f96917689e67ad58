//! Session actors and their manager.
//!
//! Each session is a long-lived task owning a [`SessionCtx`], fed by an
//! mpsc mailbox with oneshot replies. All operations on one session are
//! strictly serialized by that mailbox. A panic inside a turn is caught
//! and tolerated once per session; the second panic terminates the actor
//! (escalation), after which the manager reports it dead.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::FutureExt;
use osa_domain::error::{Error, Result};
use osa_domain::signal::Signal;
use osa_sessions::{lines_to_messages, SessionMeta, TranscriptLine};
use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::classifier;
use crate::state::AppState;
use crate::turn::{self, SessionCtx, SessionStatus, TurnRequest, TurnResult};

const MAILBOX_CAP: usize = 16;
/// Panics tolerated per session before the actor escalates.
const MAX_RESTARTS: u32 = 1;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Actor protocol
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

enum SessionRequest {
    Process {
        req: TurnRequest,
        reply: oneshot::Sender<Result<TurnResult>>,
    },
    /// Late-arriving LLM refinement of the fast signal.
    AttachSignal(Signal),
    Shutdown,
}

/// Cheap cloneable handle to a session actor.
#[derive(Clone)]
pub struct SessionHandle {
    pub session_id: String,
    tx: mpsc::Sender<SessionRequest>,
}

impl SessionHandle {
    /// Process one message. Synchronous to the caller; serialized by the
    /// actor's mailbox.
    pub async fn process_message(&self, req: TurnRequest) -> Result<TurnResult> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(SessionRequest::Process {
                req,
                reply: reply_tx,
            })
            .await
            .map_err(|_| Error::Other(format!("session '{}' is gone", self.session_id)))?;
        reply_rx
            .await
            .map_err(|_| Error::Other(format!("session '{}' dropped the reply", self.session_id)))?
    }

    pub fn is_alive(&self) -> bool {
        !self.tx.is_closed()
    }

    async fn shutdown(&self) {
        let _ = self.tx.send(SessionRequest::Shutdown).await;
    }

    fn attach_signal(&self, signal: Signal) {
        let _ = self.tx.try_send(SessionRequest::AttachSignal(signal));
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Actor loop
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn actor_loop(
    state: AppState,
    mut ctx: SessionCtx,
    handle: SessionHandle,
    mut rx: mpsc::Receiver<SessionRequest>,
) {
    let mut restarts: u32 = 0;

    while let Some(request) = rx.recv().await {
        match request {
            SessionRequest::Process { req, reply } => {
                // Kick off the background signal refinement for this
                // message; the result lands as AttachSignal later.
                if state.config.signal_refine {
                    spawn_refinement(&state, &handle, &req.message);
                }

                let outcome =
                    std::panic::AssertUnwindSafe(turn::run_turn(&state, &mut ctx, req))
                        .catch_unwind()
                        .await;
                match outcome {
                    Ok(result) => {
                        let _ = reply.send(result);
                    }
                    Err(_) => {
                        restarts += 1;
                        tracing::error!(
                            session_id = %ctx.session_id,
                            restarts,
                            "session turn panicked"
                        );
                        let _ = reply.send(Err(Error::Other(
                            "the session crashed while processing this message".into(),
                        )));
                        if restarts > MAX_RESTARTS {
                            tracing::error!(
                                session_id = %ctx.session_id,
                                "session exceeded restart budget, escalating"
                            );
                            break;
                        }
                        // Restart semantics: rebuild the in-memory view
                        // from the durable transcript.
                        ctx.messages = lines_to_messages(
                            &state
                                .transcripts
                                .read(&ctx.session_id)
                                .unwrap_or_default(),
                        );
                    }
                }
            }
            SessionRequest::AttachSignal(signal) => {
                ctx.signal = Some(signal);
            }
            SessionRequest::Shutdown => break,
        }
    }
    tracing::debug!(session_id = %ctx.session_id, "session actor stopped");
}

fn spawn_refinement(state: &AppState, handle: &SessionHandle, message: &str) {
    let router = state.router.clone();
    let handle = handle.clone();
    let message = message.to_string();
    tokio::spawn(async move {
        match classifier::refine(&router, &message).await {
            Ok(signal) => handle.attach_signal(signal),
            Err(e) => {
                // Refinement is best-effort by contract.
                tracing::debug!(error = %e, "async signal refinement failed");
            }
        }
    });
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// SessionManager
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    pub session_id: Option<String>,
    pub user_id: Option<String>,
    pub channel: Option<String>,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub plan_mode: Option<bool>,
}

/// Result of [`SessionManager::create`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateOutcome {
    Created(String),
    AlreadyStarted(String),
}

impl CreateOutcome {
    pub fn session_id(&self) -> &str {
        match self {
            CreateOutcome::Created(id) | CreateOutcome::AlreadyStarted(id) => id,
        }
    }
}

pub struct SessionManager {
    state: AppState,
    handles: RwLock<HashMap<String, SessionHandle>>,
}

impl SessionManager {
    pub fn new(state: AppState) -> Arc<Self> {
        Arc::new(Self {
            state,
            handles: RwLock::new(HashMap::new()),
        })
    }

    /// Create a session actor. Auto-generates an id when omitted;
    /// idempotent when the id is already live.
    pub fn create(&self, opts: SessionOptions) -> CreateOutcome {
        let session_id = opts
            .session_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        {
            let handles = self.handles.read();
            if let Some(handle) = handles.get(&session_id) {
                if handle.is_alive() {
                    return CreateOutcome::AlreadyStarted(session_id);
                }
            }
        }

        let channel = opts.channel.clone().unwrap_or_else(|| "cli".to_string());
        let mut meta = SessionMeta::new(session_id.clone(), channel.clone());
        meta.user_id = opts.user_id.clone();
        meta.provider = opts.provider.clone();
        meta.model = opts.model.clone();
        self.state.sessions.insert(meta);

        // Rehydrate history from the durable transcript, if any.
        let messages = lines_to_messages(
            &self
                .state
                .transcripts
                .read(&session_id)
                .unwrap_or_default(),
        );

        let ctx = SessionCtx {
            session_id: session_id.clone(),
            channel,
            messages,
            plan_mode: opts.plan_mode.unwrap_or(self.state.config.plan.enabled),
            status: SessionStatus::Idle,
            signal: None,
            provider: opts.provider,
            model: opts.model,
        };

        let (tx, rx) = mpsc::channel(MAILBOX_CAP);
        let handle = SessionHandle {
            session_id: session_id.clone(),
            tx,
        };
        tokio::spawn(actor_loop(
            self.state.clone(),
            ctx,
            handle.clone(),
            rx,
        ));
        self.handles.write().insert(session_id.clone(), handle);
        tracing::info!(session_id = %session_id, "session created");
        CreateOutcome::Created(session_id)
    }

    /// Return the existing actor or create a new one over the persisted
    /// transcript.
    pub fn resume(&self, session_id: &str, mut opts: SessionOptions) -> SessionHandle {
        if let Some(handle) = self.get(session_id) {
            if handle.is_alive() {
                return handle;
            }
        }
        opts.session_id = Some(session_id.to_string());
        let outcome = self.create(opts);
        self.get(outcome.session_id())
            .expect("session just created")
    }

    pub fn get(&self, session_id: &str) -> Option<SessionHandle> {
        self.handles.read().get(session_id).cloned()
    }

    /// Graceful stop; the actor drains its mailbox entry and exits.
    pub async fn close(&self, session_id: &str) {
        let handle = self.handles.write().remove(session_id);
        if let Some(handle) = handle {
            handle.shutdown().await;
        }
        self.state.sessions.remove(session_id);
        tracing::info!(session_id, "session closed");
    }

    pub fn alive(&self, session_id: &str) -> bool {
        self.get(session_id).map(|h| h.is_alive()).unwrap_or(false)
    }

    pub fn list(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.handles.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// The persisted message log (the durable record, not actor state).
    pub fn get_messages(&self, session_id: &str) -> Vec<TranscriptLine> {
        self.state
            .transcripts
            .read(session_id)
            .unwrap_or_default()
    }

    /// One-shot convenience used by the scheduler: create, process a
    /// single message, close.
    pub async fn run_once(
        &self,
        channel: &str,
        message: &str,
    ) -> Result<TurnResult> {
        let outcome = self.create(SessionOptions {
            channel: Some(channel.to_string()),
            ..Default::default()
        });
        let session_id = outcome.session_id().to_string();
        let handle = self
            .get(&session_id)
            .ok_or_else(|| Error::Other("one-shot session vanished".into()))?;
        let result = handle
            .process_message(TurnRequest {
                message: message.to_string(),
                ..Default::default()
            })
            .await;
        self.close(&session_id).await;
        result
    }
}
