//! Server dispatch loop.
//!
//! One [`MessageRouter::run`] call drives one connection: it reads a command,
//! handles it to completion (including any file transfer) and only then reads
//! the next. Application failures are answered with an `error` message and
//! the connection stays usable; protocol violations and integrity failures
//! close it with the matching status.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use chrono::{Datelike, Local};
use protocol::messages::{
    self, CdRequest, GetRequest, GetResponse, Inbound, MotdResponse, PutRequest, Request, Response,
};
use protocol::throttle::mbps_from_bytes_per_second;
use protocol::transfer::{self, Direction, FileOutcome, TransferObserver, TransferOptions};
use protocol::{
    send_json, CloseFrame, FileEntry, MessageChannel, ProtocolError, Result, WireMessage,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::files::{list_directory, SessionRoot};
use crate::motd;
use crate::session::{resolve_target, Session, SessionPhase};
use crate::status::Status;

/// Everything a connection needs from the process. Immutable after startup.
#[derive(Debug)]
pub struct DispatchContext {
    pub root: Arc<SessionRoot>,
    pub status: Arc<Status>,
    pub transfer: TransferOptions,
}

impl DispatchContext {
    pub fn new(root: SessionRoot, status: Arc<Status>, transfer: TransferOptions) -> Self {
        Self {
            root: Arc::new(root),
            status,
            transfer,
        }
    }

    /// The advertised cap in megabits per second (0 = unlimited).
    pub fn megabit_per_second_limit(&self) -> f64 {
        mbps_from_bytes_per_second(self.transfer.max_bytes_per_second)
    }
}

/// Wraps a channel and records every message in the process counters.
pub struct CountingChannel<C> {
    inner: C,
    status: Arc<Status>,
}

impl<C> CountingChannel<C> {
    pub fn new(inner: C, status: Arc<Status>) -> Self {
        Self { inner, status }
    }

    pub fn into_inner(self) -> C {
        self.inner
    }
}

impl<C: MessageChannel> MessageChannel for CountingChannel<C> {
    fn send<'a>(
        &'a mut self,
        message: WireMessage,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let counted = match &message {
                WireMessage::Text(_) => Some(None),
                WireMessage::Binary(data) => Some(Some(data.len() as u64)),
                WireMessage::Close(_) => None,
            };
            self.inner.send(message).await?;
            match counted {
                Some(None) => self.status.record_text_sent(),
                Some(Some(bytes)) => self.status.record_binary_sent(bytes),
                None => {}
            }
            Ok(())
        })
    }

    fn recv<'a>(&'a mut self) -> Pin<Box<dyn Future<Output = Result<WireMessage>> + Send + 'a>> {
        Box::pin(async move {
            let message = self.inner.recv().await?;
            match &message {
                WireMessage::Text(_) => self.status.record_text_received(),
                WireMessage::Binary(data) => self.status.record_binary_received(data.len() as u64),
                WireMessage::Close(_) => {}
            }
            Ok(message)
        })
    }

    fn close<'a>(
        &'a mut self,
        frame: CloseFrame,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        self.inner.close(frame)
    }
}

/// Logs per-file transfer outcomes for one session.
struct TransferLog {
    session: Uuid,
}

impl TransferObserver for TransferLog {
    fn file_finished(&mut self, entry: &FileEntry, outcome: FileOutcome) {
        match outcome {
            FileOutcome::Skipped => {
                info!(session = %self.session, name = %entry.name, "Destination exists, file skipped")
            }
            _ => {
                debug!(session = %self.session, name = %entry.name, length = entry.length, ?outcome, "File done")
            }
        }
    }
}

/// Dispatches commands for connections.
#[derive(Debug, Clone)]
pub struct MessageRouter {
    context: Arc<DispatchContext>,
}

impl MessageRouter {
    pub fn new(context: Arc<DispatchContext>) -> Self {
        Self { context }
    }

    pub fn context(&self) -> &Arc<DispatchContext> {
        &self.context
    }

    /// Serves one connection until the peer closes or a fatal error occurs.
    pub async fn run<C: MessageChannel>(&self, channel: C) {
        let mut channel = CountingChannel::new(channel, Arc::clone(&self.context.status));
        let mut session = Session::new(Arc::clone(&self.context.root));
        info!(session = %session.id(), "Session started");

        loop {
            session.set_phase(SessionPhase::Idle);
            let outcome = match channel.recv().await {
                Ok(WireMessage::Text(text)) => {
                    session.set_phase(SessionPhase::Dispatching);
                    self.route(&mut channel, &mut session, &text).await
                }
                Ok(WireMessage::Binary(_)) => Err(ProtocolError::UnexpectedBinary),
                Ok(WireMessage::Close(frame)) => {
                    match frame {
                        Some(frame) => info!(session = %session.id(), %frame, "Client closed session"),
                        None => info!(session = %session.id(), "Connection ended"),
                    }
                    break;
                }
                Err(e) => Err(e),
            };

            if let Err(e) = outcome {
                warn!(session = %session.id(), error = %e, "Ending session");
                if let Some(frame) = e.close_frame() {
                    if let Err(close_err) = channel.close(frame).await {
                        debug!(session = %session.id(), error = %close_err, "Close handshake failed");
                    }
                }
                break;
            }
        }

        session.set_phase(SessionPhase::Closed);
    }

    /// Handles one text message.
    ///
    /// Returns `Ok(())` when the connection should continue, including when
    /// an `error` response was sent.
    pub async fn route<C: MessageChannel + ?Sized>(
        &self,
        channel: &mut C,
        session: &mut Session,
        text: &str,
    ) -> Result<()> {
        let request = match messages::decode::<Request>(text)? {
            Inbound::Known(request) => request,
            Inbound::Unmapped(kind) => return self.handle_unmapped(channel, session, &kind).await,
        };
        debug!(session = %session.id(), kind = %messages::Tagged::type_name(&request), "Routing request");

        match request {
            Request::Motd => self.handle_motd(channel, session).await,
            Request::Cd(req) => self.handle_cd(channel, session, req).await,
            Request::Ls => self.handle_ls(channel, session).await,
            Request::Get(req) => self.handle_get(channel, session, req).await,
            Request::Put(req) => self.handle_put(channel, session, req).await,
            // A trailer only means something inside an upload.
            Request::PutEnd(_) => self.handle_unmapped(channel, session, "putend").await,
        }
    }

    async fn handle_unmapped<C: MessageChannel + ?Sized>(
        &self,
        channel: &mut C,
        session: &Session,
        kind: &str,
    ) -> Result<()> {
        warn!(session = %session.id(), kind = %kind, "Unmapped message type");
        send_json(
            channel,
            &Response::error(format!("Type.{kind} is not mapped for handling.")),
        )
        .await
    }

    async fn handle_motd<C: MessageChannel + ?Sized>(
        &self,
        channel: &mut C,
        session: &Session,
    ) -> Result<()> {
        let message = motd::greeting(&mut rand::thread_rng(), Local::now().weekday());
        let response = Response::Motd(MotdResponse {
            message,
            current_directory: session.display_dir(),
            megabit_per_second_limit: self.context.megabit_per_second_limit(),
            status: self.context.status.snapshot(),
        });
        send_json(channel, &response).await
    }

    async fn handle_cd<C: MessageChannel + ?Sized>(
        &self,
        channel: &mut C,
        session: &mut Session,
        req: CdRequest,
    ) -> Result<()> {
        info!(session = %session.id(), target = %req.target, "Attempting to change directory");
        let root = Arc::clone(session.root());
        let current = session.current_dir().to_path_buf();
        let target = req.target;
        let resolved = blocking(move || resolve_target(&root, &current, &target)).await?;

        match resolved {
            Ok(dir) => {
                session.enter(dir);
                self.handle_ls(channel, session).await
            }
            Err(e) => send_json(channel, &Response::error(e.to_string())).await,
        }
    }

    async fn handle_ls<C: MessageChannel + ?Sized>(
        &self,
        channel: &mut C,
        session: &Session,
    ) -> Result<()> {
        let root = Arc::clone(session.root());
        let current = session.current_dir().to_path_buf();
        let listing = blocking(move || list_directory(&root, &current)).await?;

        let response = match listing {
            Ok(listing) => Response::Ls(listing),
            Err(e) => {
                warn!(session = %session.id(), error = %e, "Listing failed");
                Response::error(e.to_string())
            }
        };
        send_json(channel, &response).await
    }

    async fn handle_get<C: MessageChannel + ?Sized>(
        &self,
        channel: &mut C,
        session: &mut Session,
        req: GetRequest,
    ) -> Result<()> {
        info!(session = %session.id(), target = %req.target, "Download requested");
        let current = session.current_dir().to_path_buf();
        let pattern = req.target.clone();
        let planned = match blocking(move || transfer::plan_files(&current, &pattern)).await? {
            Ok(planned) => planned,
            Err(e) => {
                warn!(session = %session.id(), error = %e, "Planning download failed");
                return send_json(channel, &Response::error(e.to_string())).await;
            }
        };

        if planned.is_empty() {
            return send_json(
                channel,
                &Response::error(format!(
                    "Could not find any files in {} for {}",
                    session.display_dir(),
                    req.target
                )),
            )
            .await;
        }

        let files = planned.iter().map(|p| p.entry.clone()).collect();
        send_json(channel, &Response::Get(GetResponse { files })).await?;

        session.set_phase(SessionPhase::Transferring);
        let mut observer = TransferLog {
            session: session.id(),
        };
        let summary = transfer::send_files(
            channel,
            Direction::Download,
            &planned,
            &self.context.transfer,
            &mut observer,
        )
        .await?;
        info!(
            session = %session.id(),
            files = summary.files_transferred,
            bytes = summary.bytes,
            "Download complete"
        );
        Ok(())
    }

    async fn handle_put<C: MessageChannel + ?Sized>(
        &self,
        channel: &mut C,
        session: &mut Session,
        req: PutRequest,
    ) -> Result<()> {
        info!(session = %session.id(), files = req.files.len(), "Upload announced");
        session.set_phase(SessionPhase::Transferring);

        let dest: PathBuf = session.current_dir().to_path_buf();
        let mut observer = TransferLog {
            session: session.id(),
        };
        let summary = transfer::receive_files(
            channel,
            Direction::Upload,
            &dest,
            &req.files,
            &self.context.transfer,
            &mut observer,
        )
        .await?;
        info!(
            session = %session.id(),
            written = summary.files_transferred,
            skipped = summary.files_skipped,
            bytes = summary.bytes,
            "Upload complete"
        );
        Ok(())
    }
}

/// Runs filesystem work off the async workers.
async fn blocking<T, F>(work: F) -> Result<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| ProtocolError::TransferFailed(format!("blocking task failed: {e}")))
}
