//! ---
//! sbus_section: "02-messaging-ipc-data-model"
//! sbus_subsection: "module"
//! sbus_type: "source"
//! sbus_scope: "code"
//! sbus_description: "Envelope model, action dispatch, and wire transports."
//! sbus_version: "v0.0.0-prealpha"
//! sbus_owner: "tbd"
//! ---
//! Handlers that materialise distributed service code on disk.
use std::path::PathBuf;

use async_trait::async_trait;
use tracing::{debug, info};

use super::basic::render_value;
use super::{Handler, HandlerError, HandlerOutcome};
use crate::archive;
use crate::envelope::Envelope;

const BUNDLE_KEYS: [&str; 2] = ["payload", "resposta"];
const NAME_KEYS: [&str; 2] = ["servico", "nome"];
const BYTES_KEYS: [&str; 2] = ["bytecode", "payload"];
const ERROR_KEYS: [&str; 2] = ["erro", "error"];

/// Extracts a zipped bundle of service files into the models directory.
#[derive(Debug, Clone)]
pub struct ServiceDistributionHandler {
    models_dir: PathBuf,
}

impl ServiceDistributionHandler {
    /// Handler extracting into `models_dir`.
    pub fn new(models_dir: impl Into<PathBuf>) -> Self {
        Self {
            models_dir: models_dir.into(),
        }
    }
}

#[async_trait]
impl Handler for ServiceDistributionHandler {
    async fn process(&self, envelope: &Envelope) -> Result<HandlerOutcome, HandlerError> {
        let payload = envelope.content().first_str_field(&BUNDLE_KEYS)?.to_owned();
        debug!(origin = envelope.origin(), bytes = payload.len(), "received service bundle");

        let target = self.models_dir.clone();
        let files = tokio::task::spawn_blocking(move || archive::unpack_archive(&payload, target))
            .await
            .map_err(|err| HandlerError::Task(err.to_string()))??;

        info!(target = %self.models_dir.display(), files = files.len(), "service bundle extracted");
        Ok(HandlerOutcome::text(format!(
            "Service files decoded and extracted into {} ({} files).",
            self.models_dir.display(),
            files.len()
        )))
    }
}

/// Stores a single service artifact, or reports the error the peer sent instead.
#[derive(Debug, Clone)]
pub struct ServiceResultHandler {
    services_dir: PathBuf,
}

impl ServiceResultHandler {
    /// Handler writing into `services_dir`.
    pub fn new(services_dir: impl Into<PathBuf>) -> Self {
        Self {
            services_dir: services_dir.into(),
        }
    }
}

#[async_trait]
impl Handler for ServiceResultHandler {
    async fn process(&self, envelope: &Envelope) -> Result<HandlerOutcome, HandlerError> {
        let content = envelope.content();

        // A peer-reported error is a normal outcome, not a failure.
        if let Some(error) = ERROR_KEYS.iter().find_map(|key| content.get(key)) {
            return Ok(HandlerOutcome::text(render_value(error)));
        }

        let name = content.first_str_field(&NAME_KEYS)?.to_owned();
        let bytes = content.first_str_field(&BYTES_KEYS)?.to_owned();

        let target = self.services_dir.clone();
        let file_name = name.clone();
        let path =
            tokio::task::spawn_blocking(move || archive::write_file(&bytes, target, &file_name))
                .await
                .map_err(|err| HandlerError::Task(err.to_string()))??;

        info!(service = %name, path = %path.display(), "service artifact saved");
        Ok(HandlerOutcome::text(format!(
            "Service {name} received and saved as {}",
            path.display()
        )))
    }
}
