//! Log retrieval
//!
//! Requests the endpoint's log bundle and waits for the matching response.
//! Only one retrieval may be outstanding at a time; the response must echo
//! the request id it answers.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{arm_timeout, FeatureError, FeatureHandler, FeatureKind, RequestState};
use crate::connection::{Connection, ConnectionEvent};
use crate::dispatch::MessageHandler;
use crate::events::{EndReason, FeatureEvent, Notifier};
use crate::messages::{LogFile, Message, MessageKind};
use crate::sync::lock;

const OPERATION: &str = "retrieve logs";

/// Subdirectory of a connection's download directory holding log files
pub const LOGS_SUBDIRECTORY: &str = "Logs";

#[derive(Debug, Default)]
struct LogState {
    /// Correlation id of the outstanding request
    pending: Option<u64>,
}

pub struct LogRetrievalHandler {
    connection: Connection,
    notifier: Notifier,
    timeout: Duration,
    next_request_id: AtomicU64,
    state: Arc<Mutex<LogState>>,
}

impl LogRetrievalHandler {
    pub(crate) fn new(connection: Connection, notifier: Notifier, timeout: Duration) -> Self {
        Self {
            connection,
            notifier,
            timeout,
            next_request_id: AtomicU64::new(1),
            state: Arc::new(Mutex::new(LogState::default())),
        }
    }

    pub fn state(&self) -> RequestState {
        match lock(&self.state).pending {
            Some(_) => RequestState::AwaitingResponse,
            None => RequestState::Idle,
        }
    }

    /// Correlation id of the outstanding request, if any
    pub fn pending_request(&self) -> Option<u64> {
        lock(&self.state).pending
    }

    /// Ask the endpoint for its log bundle. Returns the request id.
    pub fn retrieve_logs(&self) -> Result<u64, FeatureError> {
        let request_id = {
            let mut state = lock(&self.state);
            if state.pending.is_some() {
                return Err(FeatureError::RequestPending);
            }

            let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
            self.connection.send(&Message::GetLogs { request_id })?;
            state.pending = Some(request_id);
            request_id
        };

        self.notifier.notify(FeatureEvent::Status {
            message: "Retrieving logs...".to_string(),
        });

        let state = Arc::downgrade(&self.state);
        let notifier = self.notifier.clone();
        arm_timeout(self.timeout, move || {
            if let Some(state) = state.upgrade() {
                Self::expire(&state, &notifier, request_id);
            }
        });

        Ok(request_id)
    }

    fn expire(state: &Mutex<LogState>, notifier: &Notifier, request_id: u64) {
        let mut state = lock(state);
        if state.pending != Some(request_id) {
            return;
        }
        state.pending = None;
        drop(state);

        warn!("Log retrieval request {} timed out", request_id);
        notifier.notify(FeatureEvent::RequestTimedOut {
            operation: OPERATION.to_string(),
        });
    }

    fn on_response(
        &self,
        request_id: u64,
        files: &[LogFile],
        is_error: bool,
        error_msg: &str,
    ) {
        {
            let mut state = lock(&self.state);
            if state.pending != Some(request_id) {
                warn!(
                    "Unmatched log response {} (outstanding: {:?}), dropping",
                    request_id, state.pending
                );
                return;
            }
            state.pending = None;
        }

        if is_error {
            self.notifier.notify(FeatureEvent::RequestFailed {
                operation: OPERATION.to_string(),
                error: error_msg.to_string(),
            });
        } else {
            info!(
                "Retrieved {} log file(s) from {}",
                files.len(),
                self.connection.info().endpoint
            );
            self.notifier.notify(FeatureEvent::LogsRetrieved {
                request_id,
                files: files.to_vec(),
            });
        }
    }
}

impl MessageHandler for LogRetrievalHandler {
    fn name(&self) -> &'static str {
        "log-retrieval"
    }

    fn handle(&self, message: &Message) {
        match message {
            Message::GetLogsResponse {
                request_id,
                files,
                is_error,
                error_msg,
            } => self.on_response(*request_id, files, *is_error, error_msg),
            other => debug!("Log retrieval ignoring {}", other.kind()),
        }
    }
}

impl FeatureHandler for LogRetrievalHandler {
    const FEATURE: FeatureKind = FeatureKind::LogRetrieval;

    fn message_kinds(&self) -> &'static [MessageKind] {
        &[MessageKind::GetLogsResponse]
    }

    fn connection_changed(&self, event: &ConnectionEvent) {
        if event.is_connected {
            return;
        }

        if let Some(request_id) = lock(&self.state).pending.take() {
            debug!("Abandoning log request {} on disconnect", request_id);
        }
        self.notifier.notify(FeatureEvent::SessionEnded {
            reason: EndReason::Disconnected,
        });
    }
}

/// Retrieved log files stored under a connection's download directory
#[derive(Debug, Clone)]
pub struct LogArchive {
    root: PathBuf,
}

impl LogArchive {
    /// Archive rooted at `<download_directory>/Logs`
    pub fn new(download_directory: &Path) -> Self {
        Self {
            root: download_directory.join(LOGS_SUBDIRECTORY),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Write files, creating the directory if needed. Returns stored paths.
    ///
    /// Only the final path component of each name is used, so an endpoint
    /// cannot write outside the archive.
    pub fn store(&self, files: &[LogFile]) -> io::Result<Vec<PathBuf>> {
        std::fs::create_dir_all(&self.root)?;

        let mut stored = Vec::with_capacity(files.len());
        for file in files {
            let Some(name) = sanitize_file_name(&file.name) else {
                warn!("Skipping log file with unusable name {:?}", file.name);
                continue;
            };
            let path = self.root.join(name);
            std::fs::write(&path, &file.contents)?;
            stored.push(path);
        }
        Ok(stored)
    }

    /// File names currently in the archive, sorted. A missing directory
    /// is an empty archive.
    pub fn list(&self) -> io::Result<Vec<String>> {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                names.push(entry.file_name().to_string_lossy().to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    /// Read one archived file by name
    pub fn read(&self, name: &str) -> io::Result<String> {
        let name = sanitize_file_name(name)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "invalid log file name"))?;
        std::fs::read_to_string(self.root.join(name))
    }
}

fn sanitize_file_name(name: &str) -> Option<&str> {
    let last = name.rsplit(|c: char| c == '/' || c == '\\').next()?;
    match last {
        "" | "." | ".." => None,
        other => Some(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionInfo;
    use crate::events::{notification_channel, Notification, NotificationReceiver};
    use crate::transport::{channel_pair, ChannelEnd};

    fn setup(
        timeout: Duration,
    ) -> (LogRetrievalHandler, Connection, ChannelEnd, NotificationReceiver) {
        let (local, remote) = channel_pair();
        let connection = Connection::new(ConnectionInfo::new("host:1", "host"), local.transport);
        connection.connect();
        let (tx, rx) = notification_channel();
        let notifier = Notifier::new(connection.id(), FeatureKind::LogRetrieval, tx);
        let handler = LogRetrievalHandler::new(connection.clone(), notifier, timeout);
        (handler, connection, remote, rx)
    }

    fn drain(rx: &mut NotificationReceiver) -> Vec<Notification> {
        let mut out = Vec::new();
        while let Ok(n) = rx.try_recv() {
            out.push(n);
        }
        out
    }

    fn response(request_id: u64, is_error: bool, error_msg: &str) -> Message {
        Message::GetLogsResponse {
            request_id,
            files: vec![LogFile {
                name: "Log_2024-01-01".to_string(),
                contents: b"entry".to_vec(),
            }],
            is_error,
            error_msg: error_msg.to_string(),
        }
    }

    #[tokio::test]
    async fn test_request_response_cycle() {
        let (handler, _conn, mut remote, mut rx) = setup(Duration::from_secs(30));

        let id = handler.retrieve_logs().unwrap();
        assert_eq!(handler.state(), RequestState::AwaitingResponse);
        let frame = remote.inbound.recv().await.unwrap();
        assert_eq!(Message::decode(&frame).unwrap(), Message::GetLogs { request_id: id });

        handler.handle(&response(id, false, ""));
        assert_eq!(handler.state(), RequestState::Idle);

        let events: Vec<_> = drain(&mut rx).into_iter().map(|n| n.event).collect();
        assert!(matches!(events[0], FeatureEvent::Status { .. }));
        assert!(matches!(
            &events[1],
            FeatureEvent::LogsRetrieved { request_id, files } if *request_id == id && files.len() == 1
        ));
    }

    #[tokio::test]
    async fn test_error_response_is_terminal() {
        let (handler, _conn, mut remote, mut rx) = setup(Duration::from_secs(30));
        let id = handler.retrieve_logs().unwrap();
        drain(&mut rx);

        handler.handle(&response(id, true, "Log directory not found"));

        assert_eq!(handler.state(), RequestState::Idle);
        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert_eq!(
            events[0].event,
            FeatureEvent::RequestFailed {
                operation: OPERATION.to_string(),
                error: "Log directory not found".to_string(),
            }
        );

        // no automatic retry went out
        remote.inbound.recv().await.unwrap();
        assert!(remote.inbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unmatched_response_is_dropped() {
        let (handler, _conn, _remote, mut rx) = setup(Duration::from_secs(30));

        handler.handle(&response(99, false, ""));
        assert_eq!(handler.state(), RequestState::Idle);

        let id = handler.retrieve_logs().unwrap();
        drain(&mut rx);
        handler.handle(&response(id + 1, false, ""));

        assert_eq!(handler.pending_request(), Some(id));
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_second_request_while_pending() {
        let (handler, _conn, _remote, _rx) = setup(Duration::from_secs(30));
        handler.retrieve_logs().unwrap();
        assert_eq!(handler.retrieve_logs(), Err(FeatureError::RequestPending));
    }

    #[tokio::test]
    async fn test_not_connected() {
        let (handler, conn, _remote, _rx) = setup(Duration::from_secs(30));
        conn.disconnect();
        assert_eq!(handler.retrieve_logs(), Err(FeatureError::NotConnected));
        assert_eq!(handler.state(), RequestState::Idle);
    }

    #[tokio::test]
    async fn test_disconnect_ends_session_once() {
        let (handler, conn, _remote, mut rx) = setup(Duration::from_secs(30));
        let id = handler.retrieve_logs().unwrap();
        drain(&mut rx);

        handler.connection_changed(&ConnectionEvent {
            connection: conn.id(),
            is_connected: false,
        });
        assert_eq!(handler.state(), RequestState::Idle);

        // a late response changes nothing
        handler.handle(&response(id, false, ""));
        assert_eq!(handler.state(), RequestState::Idle);

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert_eq!(
            events[0].event,
            FeatureEvent::SessionEnded {
                reason: EndReason::Disconnected
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_returns_to_idle() {
        let (handler, _conn, _remote, mut rx) = setup(Duration::from_secs(5));
        handler.retrieve_logs().unwrap();
        drain(&mut rx);

        tokio::time::sleep(Duration::from_secs(6)).await;

        assert_eq!(handler.state(), RequestState::Idle);
        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0].event, FeatureEvent::RequestTimedOut { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_answered_request_does_not_time_out() {
        let (handler, _conn, _remote, mut rx) = setup(Duration::from_secs(5));
        let id = handler.retrieve_logs().unwrap();
        handler.handle(&response(id, false, ""));
        drain(&mut rx);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_archive_store_and_list() {
        let dir = tempfile::tempdir().unwrap();
        let archive = LogArchive::new(dir.path());
        assert!(archive.list().unwrap().is_empty());

        let stored = archive
            .store(&[
                LogFile {
                    name: "b.log".to_string(),
                    contents: b"second".to_vec(),
                },
                LogFile {
                    name: "..\\..\\a.log".to_string(),
                    contents: b"first".to_vec(),
                },
                LogFile {
                    name: "..".to_string(),
                    contents: vec![],
                },
            ])
            .unwrap();

        assert_eq!(stored.len(), 2);
        assert!(stored.iter().all(|p| p.starts_with(archive.root())));
        assert_eq!(archive.list().unwrap(), vec!["a.log", "b.log"]);
        assert_eq!(archive.read("a.log").unwrap(), "first");
        assert!(archive.read("..").is_err());
    }
}
