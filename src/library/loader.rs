//! Loading the native engine library.

use super::native::NativeLibrary;
use super::QueryEngineLibrary;
use crate::config::EngineConfig;
use crate::engine::ErrorContext;
use crate::error::EngineResult;
use crate::locate::{locate_engine, ArtifactKind};
use std::sync::Arc;
use tracing::info;

/// Produces the library an engine binds to
pub trait LibraryLoader: Send + Sync {
    fn load(
        &self,
        config: &EngineConfig,
        context: &ErrorContext,
    ) -> EngineResult<Arc<dyn QueryEngineLibrary>>;
}

/// Locates the platform library on disk and opens it
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultLibraryLoader;

impl LibraryLoader for DefaultLibraryLoader {
    fn load(
        &self,
        config: &EngineConfig,
        context: &ErrorContext,
    ) -> EngineResult<Arc<dyn QueryEngineLibrary>> {
        let path = locate_engine(config, ArtifactKind::Library, context)?;
        let library = NativeLibrary::open(&path).map_err(|e| {
            context.initialization(
                format!(
                    "Unable to load the query engine library at {}: {e}\n\
                     Make sure the library was built for platform \"{}\".",
                    path.display(),
                    config.platform
                ),
                None,
            )
        })?;
        info!(path = %path.display(), "📚 Loaded query engine library");
        Ok(Arc::new(Arc::new(library)))
    }
}

/// Hands out an already constructed library
#[derive(Clone)]
pub struct StaticLibraryLoader {
    library: Arc<dyn QueryEngineLibrary>,
}

impl StaticLibraryLoader {
    pub fn new(library: Arc<dyn QueryEngineLibrary>) -> Self {
        Self { library }
    }
}

impl LibraryLoader for StaticLibraryLoader {
    fn load(&self, _: &EngineConfig, _: &ErrorContext) -> EngineResult<Arc<dyn QueryEngineLibrary>> {
        Ok(self.library.clone())
    }
}
