//! Shared state threaded through every operation.

use crate::bundle::BundleDecoder;
use crate::config::PatchConfig;
use crate::diagnostics::DiagnosticSink;
use crate::registry::Registry;
use crate::storage::PatchStorage;
use crate::transport::Transport;

/// Collaborators and mutable state of one pipeline instance.
///
/// A [`PatchSystem`](crate::system::PatchSystem) owns exactly one context and
/// lends it to the head operation on every pump. Nothing in the pipeline is
/// global: separate contexts are fully isolated.
pub struct PatchContext {
    pub(crate) config: PatchConfig,
    pub(crate) storage: Box<dyn PatchStorage>,
    pub(crate) transport: Box<dyn Transport>,
    pub(crate) decoder: Box<dyn BundleDecoder>,
    pub(crate) sink: Box<dyn DiagnosticSink>,
    pub(crate) registry: Registry,
    pub(crate) manifest_version: Option<u32>,
}

impl PatchContext {
    /// Assemble a context with an empty registry.
    pub fn new(
        config: PatchConfig,
        storage: Box<dyn PatchStorage>,
        transport: Box<dyn Transport>,
        decoder: Box<dyn BundleDecoder>,
        sink: Box<dyn DiagnosticSink>,
    ) -> Self {
        Self {
            config,
            storage,
            transport,
            decoder,
            sink,
            registry: Registry::new(),
            manifest_version: None,
        }
    }

    /// Active configuration.
    pub fn config(&self) -> &PatchConfig {
        &self.config
    }

    /// The bundle and asset registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Mutable access to the registry.
    pub fn registry_mut(&mut self) -> &mut Registry {
        &mut self.registry
    }

    /// Local patch storage.
    pub fn storage(&self) -> &dyn PatchStorage {
        self.storage.as_ref()
    }

    /// Where unsuppressed failures are reported.
    pub fn sink(&self) -> &dyn DiagnosticSink {
        self.sink.as_ref()
    }

    /// Version of the aggregate manifest currently installed, if known.
    pub fn manifest_version(&self) -> Option<u32> {
        self.manifest_version
    }

    /// Whether progress messages should be logged.
    pub(crate) fn verbose(&self) -> bool {
        self.config.log_mode.is_verbose()
    }
}

impl std::fmt::Debug for PatchContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PatchContext")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .field("manifest_version", &self.manifest_version)
            .finish_non_exhaustive()
    }
}
