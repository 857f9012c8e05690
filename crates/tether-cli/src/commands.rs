//! Operator commands
//!
//! Each command opens one feature session, issues its requests and presents
//! notifications until the outcome is known. Returns whether the operation
//! succeeded.

use tether_core::events::{EventSink, StdoutEventSink};
use tether_core::features::LogArchive;
use tether_core::messages::RegistryValueKind;
use tether_core::{
    Connection, Console, ConsoleError, FeatureEvent, NotificationReceiver, Result, TransportError,
};

pub struct Operator<'a> {
    pub console: &'a Console,
    pub connection: Connection,
    pub notifications: NotificationReceiver,
    pub sink: StdoutEventSink,
}

/// A registry edit to perform
#[derive(Debug, Clone)]
pub enum RegistryEdit {
    CreateKey { parent: String },
    DeleteKey { parent: String, name: String },
    CreateValue { key: String, kind: RegistryValueKind },
    DeleteValue { key: String, name: String },
}

fn is_failure(event: &FeatureEvent) -> bool {
    matches!(
        event,
        FeatureEvent::RequestFailed { .. }
            | FeatureEvent::RequestTimedOut { .. }
            | FeatureEvent::SessionEnded { .. }
    )
}

impl Operator<'_> {
    /// Present notifications until `done` accepts one, and return it
    async fn present_until<F>(&mut self, mut done: F) -> Result<FeatureEvent>
    where
        F: FnMut(&FeatureEvent) -> bool,
    {
        while let Some(notification) = self.notifications.recv().await {
            if let Err(e) = self.sink.emit(&notification).await {
                tracing::warn!("Failed to present notification: {}", e);
            }
            if done(&notification.event) {
                return Ok(notification.event);
            }
        }
        Err(ConsoleError::Transport(TransportError::Closed))
    }

    /// Retrieve the log bundle and store it under the download directory
    pub async fn logs(&mut self, list: bool) -> Result<bool> {
        let session = self.console.open_log_retrieval(self.connection.id())?;
        session.retrieve_logs()?;

        let event = self.present_until(FeatureEvent::is_terminal).await?;
        let FeatureEvent::LogsRetrieved { files, .. } = event else {
            return Ok(false);
        };

        let archive = LogArchive::new(&self.connection.info().download_directory);
        let stored = archive.store(&files)?;
        tracing::info!(
            "Stored {} log file(s) in {}",
            stored.len(),
            archive.root().display()
        );

        if list {
            for name in archive.list()? {
                println!("{name}");
            }
        }
        Ok(true)
    }

    pub async fn registry(&mut self, edit: RegistryEdit) -> Result<bool> {
        let session = self.console.open_registry_editor(self.connection.id())?;
        match &edit {
            RegistryEdit::CreateKey { parent } => session.create_key(parent)?,
            RegistryEdit::DeleteKey { parent, name } => session.delete_key(parent, name)?,
            RegistryEdit::CreateValue { key, kind } => session.create_value(key, *kind)?,
            RegistryEdit::DeleteValue { key, name } => session.delete_value(key, name)?,
        }

        let event = self.present_until(FeatureEvent::is_terminal).await?;
        Ok(!is_failure(&event))
    }

    /// Stream `frames` audio frames from `device` and stop
    pub async fn audio(&mut self, device: u32, bitrate: u32, frames: usize) -> Result<bool> {
        let session = self.console.open_audio_capture(self.connection.id())?;

        session.refresh_devices()?;
        let listed = self.present_until(FeatureEvent::is_terminal).await?;
        if is_failure(&listed) {
            return Ok(false);
        }

        session.set_bitrate(bitrate)?;
        let params = session.start_stream(device)?;
        tracing::info!(
            "Capturing from device {} at {} Hz ({} quality)",
            params.device_index,
            params.bitrate,
            tether_core::features::audio::quality_label(params.bitrate)
        );

        let mut received = 0;
        let last = self
            .present_until(|event| {
                if matches!(event, FeatureEvent::AudioFrame { .. }) {
                    received += 1;
                }
                received >= frames || is_failure(event)
            })
            .await?;
        if is_failure(&last) {
            return Ok(false);
        }

        session.stop_stream(device);
        self.present_until(|event| {
            matches!(event, FeatureEvent::StreamStopped { .. }) || is_failure(event)
        })
        .await?;
        Ok(true)
    }
}
