//! Client session: command parsing and the interactive loop.
//!
//! Downloads and uploads go through a local mirror: the remote directory
//! `/a/b` maps to `<working dir>/a/b`, so files land in (and are taken from)
//! the same relative place on both ends.

use std::io::Write as _;
use std::path::PathBuf;
use std::time::Duration;

use protocol::messages::{
    self, CdRequest, GetRequest, Inbound, LsResponse, MotdResponse, PutRequest, Request, Response,
};
use protocol::throttle::bytes_per_second_from_mbps;
use protocol::transfer::{self, resolve_destination, Direction, TransferOptions};
use protocol::{
    send_json, CloseCode, CloseFrame, MessageChannel, ProtocolError, TransferObserver,
    TransferSummary, WireMessage,
};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{debug, info, warn};

use crate::display::{self, ProgressObserver};
use crate::error::{ClientError, Result};

/// Default maximum session duration (3 days).
pub const DEFAULT_MAX_SESSION_DURATION: Duration = Duration::from_secs(3 * 24 * 60 * 60);

/// One line of user input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientCommand {
    Cd(String),
    Ls,
    Motd,
    Get(String),
    Put(String),
    Help,
    Quit,
}

impl ClientCommand {
    /// Parses `cd <name>`, `ls`, `motd`, `get <glob>`, `put <glob>`,
    /// `h`/`help` and `q`/`quit`. Arguments keep inner spaces.
    pub fn parse(line: &str) -> Result<Self> {
        let trimmed = line.trim();
        let (verb, argument) = match trimmed.split_once(char::is_whitespace) {
            Some((verb, rest)) => (verb, Some(rest.trim()).filter(|a| !a.is_empty())),
            None => (trimmed, None),
        };

        let command = match (verb, argument) {
            ("cd", Some(target)) => ClientCommand::Cd(target.to_string()),
            ("get", Some(glob)) => ClientCommand::Get(glob.to_string()),
            ("put", Some(glob)) => ClientCommand::Put(glob.to_string()),
            ("ls", None) => ClientCommand::Ls,
            ("motd", None) => ClientCommand::Motd,
            ("h" | "help", None) => ClientCommand::Help,
            ("q" | "quit", None) => ClientCommand::Quit,
            _ => return Err(ClientError::UnknownCommand(trimmed.to_string())),
        };
        Ok(command)
    }
}

/// What a command produced.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Listing(LsResponse),
    Motd(MotdResponse),
    /// The server (or local planning) reported an application error.
    Error(String),
    Downloaded(TransferSummary),
    Uploaded(TransferSummary),
    Help,
    Quit,
}

impl Outcome {
    /// Text shown to the user.
    pub fn render(&self) -> String {
        match self {
            Outcome::Listing(listing) => display::format_listing(listing),
            Outcome::Motd(motd) => display::format_motd(motd),
            Outcome::Error(payload) => format!("ERROR:\n{payload}\n"),
            Outcome::Downloaded(summary) => {
                format!("{}\n", display::format_summary("Downloaded", summary))
            }
            Outcome::Uploaded(summary) => {
                format!("{}\n", display::format_summary("Uploaded", summary))
            }
            Outcome::Help => format!("{}\n", display::HELP),
            Outcome::Quit => String::new(),
        }
    }
}

/// Drives one session over a connected channel.
pub struct Orchestrator<C> {
    channel: C,
    working_dir: PathBuf,
    remote_dir: String,
    megabit_per_second_limit: f64,
    /// Local cap replacing the advertised one.
    mbps_override: Option<f64>,
    options: TransferOptions,
    show_progress: bool,
}

impl<C: MessageChannel> Orchestrator<C> {
    pub fn new(channel: C, working_dir: PathBuf) -> Self {
        Self {
            channel,
            working_dir,
            remote_dir: "/".to_string(),
            megabit_per_second_limit: 0.0,
            mbps_override: None,
            options: TransferOptions::default(),
            show_progress: true,
        }
    }

    /// Turns progress bars on or off.
    pub fn with_progress(mut self, show_progress: bool) -> Self {
        self.show_progress = show_progress;
        self
    }

    pub fn with_transfer_options(mut self, options: TransferOptions) -> Self {
        self.options = options;
        self
    }

    /// Caps local file streams at `mbps` instead of the server's advertised
    /// limit (0 = unlimited).
    pub fn with_mbps_limit(mut self, mbps: f64) -> Self {
        self.mbps_override = Some(mbps);
        self.options.max_bytes_per_second = bytes_per_second_from_mbps(mbps);
        self
    }

    /// Options used for the local side of transfers.
    pub fn transfer_options(&self) -> &TransferOptions {
        &self.options
    }

    /// The server's current directory as last reported.
    pub fn remote_dir(&self) -> &str {
        &self.remote_dir
    }

    /// The bandwidth cap the server advertised in `motd`.
    pub fn megabit_per_second_limit(&self) -> f64 {
        self.megabit_per_second_limit
    }

    pub fn into_channel(self) -> C {
        self.channel
    }

    /// Local directory mirroring the remote current directory.
    pub fn local_dir(&self) -> Result<PathBuf> {
        match self.remote_dir.trim_start_matches('/') {
            "" => Ok(self.working_dir.clone()),
            relative => Ok(resolve_destination(&self.working_dir, relative)?),
        }
    }

    /// Sends `motd` then `ls` to learn the starting state.
    pub async fn seed(&mut self) -> Result<Vec<Outcome>> {
        let motd = self.execute(ClientCommand::Motd).await?;
        let ls = self.execute(ClientCommand::Ls).await?;
        Ok(vec![motd, ls])
    }

    /// Runs one command to completion.
    pub async fn execute(&mut self, command: ClientCommand) -> Result<Outcome> {
        debug!(?command, "Executing command");
        match command {
            ClientCommand::Motd => {
                self.send(&Request::Motd).await?;
                match self.recv().await? {
                    Response::Motd(motd) => {
                        self.remote_dir = motd.current_directory.clone();
                        self.megabit_per_second_limit = motd.megabit_per_second_limit;
                        let mbps = self.mbps_override.unwrap_or(motd.megabit_per_second_limit);
                        self.options.max_bytes_per_second = bytes_per_second_from_mbps(mbps);
                        debug!(mbps, "Applied file stream cap");
                        Ok(Outcome::Motd(motd))
                    }
                    other => self.unexpected("motd", other),
                }
            }
            ClientCommand::Ls => {
                self.send(&Request::Ls).await?;
                self.expect_listing().await
            }
            ClientCommand::Cd(target) => {
                self.send(&Request::Cd(CdRequest { target })).await?;
                self.expect_listing().await
            }
            ClientCommand::Get(target) => self.get(target).await,
            ClientCommand::Put(pattern) => self.put(pattern).await,
            ClientCommand::Help => Ok(Outcome::Help),
            ClientCommand::Quit => {
                self.channel.close(CloseFrame::normal()).await?;
                Ok(Outcome::Quit)
            }
        }
    }

    /// Reads commands from `input` until `quit`, end of input or `max_duration`.
    ///
    /// Unknown input and application errors are printed and the loop goes
    /// on; protocol failures end the session.
    pub async fn run<R>(&mut self, input: R, max_duration: Duration) -> Result<()>
    where
        R: AsyncBufRead + Unpin + Send,
    {
        let outcome = tokio::time::timeout(max_duration, self.interact(input)).await;
        match outcome {
            Ok(result) => result,
            Err(_) => {
                warn!(seconds = max_duration.as_secs(), "Maximum session duration reached");
                let frame = CloseFrame::new(CloseCode::Normal, "Session expired.");
                if let Err(e) = self.channel.close(frame).await {
                    debug!(error = %e, "Close after expiry failed");
                }
                Err(ClientError::SessionExpired(max_duration.as_secs()))
            }
        }
    }

    async fn interact<R>(&mut self, input: R) -> Result<()>
    where
        R: AsyncBufRead + Unpin + Send,
    {
        for outcome in self.seed().await? {
            print!("{}", outcome.render());
        }

        let mut lines = input.lines();
        loop {
            print!("{}> ", self.remote_dir);
            std::io::stdout().flush()?;

            let Some(line) = lines.next_line().await? else {
                info!("Input closed, ending session");
                self.execute(ClientCommand::Quit).await?;
                return Ok(());
            };
            if line.trim().is_empty() {
                continue;
            }

            let command = match ClientCommand::parse(&line) {
                Ok(command) => command,
                Err(e) => {
                    println!("{e}");
                    continue;
                }
            };
            let outcome = self.execute(command).await?;
            print!("{}", outcome.render());
            if outcome == Outcome::Quit {
                return Ok(());
            }
        }
    }

    async fn get(&mut self, target: String) -> Result<Outcome> {
        self.send(&Request::Get(GetRequest { target })).await?;
        let files = match self.recv().await? {
            Response::Get(get) => get.files,
            Response::Error(error) => return Ok(Outcome::Error(error.payload)),
            other => return self.unexpected("get", other),
        };

        let dest = self.local_dir()?;
        tokio::fs::create_dir_all(&dest).await?;
        let mut observer = self.observer();
        let result = transfer::receive_files(
            &mut self.channel,
            Direction::Download,
            &dest,
            &files,
            &self.options,
            observer.as_mut(),
        )
        .await;
        let summary = self.fail_on_violation(result).await?;
        Ok(Outcome::Downloaded(summary))
    }

    async fn put(&mut self, pattern: String) -> Result<Outcome> {
        let source = self.local_dir()?;
        let planned = {
            let source = source.clone();
            let pattern = pattern.clone();
            tokio::task::spawn_blocking(move || transfer::plan_files(&source, &pattern))
                .await
                .map_err(|e| ProtocolError::TransferFailed(e.to_string()))??
        };
        if planned.is_empty() {
            return Ok(Outcome::Error(format!(
                "Could not find any files in {} for {}",
                source.display(),
                pattern
            )));
        }

        let files = planned.iter().map(|p| p.entry.clone()).collect();
        self.send(&Request::Put(PutRequest { files })).await?;
        let mut observer = self.observer();
        let result = transfer::send_files(
            &mut self.channel,
            Direction::Upload,
            &planned,
            &self.options,
            observer.as_mut(),
        )
        .await;
        let summary = self.fail_on_violation(result).await?;
        Ok(Outcome::Uploaded(summary))
    }

    fn observer(&self) -> Box<dyn TransferObserver> {
        if self.show_progress {
            Box::new(ProgressObserver::new())
        } else {
            Box::new(ProgressObserver::hidden())
        }
    }

    /// Closes the session with the matching status before surfacing a
    /// fatal transfer error.
    async fn fail_on_violation<T>(&mut self, result: protocol::Result<T>) -> Result<T> {
        match result {
            Ok(value) => Ok(value),
            Err(e) => {
                if let Some(frame) = e.close_frame() {
                    if let Err(close_err) = self.channel.close(frame).await {
                        debug!(error = %close_err, "Close after failure failed");
                    }
                }
                Err(e.into())
            }
        }
    }

    async fn expect_listing(&mut self) -> Result<Outcome> {
        match self.recv().await? {
            Response::Ls(listing) => {
                self.remote_dir = listing.current_directory.clone();
                Ok(Outcome::Listing(listing))
            }
            Response::Error(error) => Ok(Outcome::Error(error.payload)),
            other => self.unexpected("ls", other),
        }
    }

    async fn send(&mut self, request: &Request) -> Result<()> {
        Ok(send_json(&mut self.channel, request).await?)
    }

    /// Receives the next response. Errors are returned as values so callers
    /// can decide whether they are expected.
    async fn recv(&mut self) -> Result<Response> {
        let text = match self.channel.recv().await? {
            WireMessage::Text(text) => text,
            WireMessage::Binary(_) => return Err(ProtocolError::UnexpectedBinary.into()),
            WireMessage::Close(frame) => {
                return Err(ProtocolError::ConnectionClosed(match frame {
                    Some(frame) => frame.to_string(),
                    None => "server ended the connection".to_string(),
                })
                .into())
            }
        };
        match messages::decode::<Response>(&text)? {
            Inbound::Known(response) => Ok(response),
            Inbound::Unmapped(kind) => Err(ProtocolError::UnexpectedMessage {
                expected: "response",
                got: kind,
            }
            .into()),
        }
    }

    fn unexpected<T>(&self, expected: &'static str, got: Response) -> Result<T> {
        Err(ProtocolError::UnexpectedMessage {
            expected,
            got: messages::Tagged::type_name(&got).to_string(),
        }
        .into())
    }
}
