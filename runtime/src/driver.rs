//! CPU driver: the host-facing entry point for creating script instances.

use std::path::Path;
use std::sync::Arc;

use bon::bon;
use tracing::info;

use crate::compiler::{ClangCompiler, ScriptCompiler};
use crate::config::RuntimeConfig;
use crate::dispatcher::{Dispatcher, RayonDispatcher};
use crate::error::Result;
use crate::loader::{ModuleImage, ModuleLoader};
use crate::script::ScriptInstance;
use crate::sink::{ErrorSink, TracingSink};

/// Bundles configuration with the compiler, error sink and dispatcher every
/// script created through it shares.
pub struct CpuDriver {
    config: RuntimeConfig,
    compiler: Arc<dyn ScriptCompiler>,
    sink: Arc<dyn ErrorSink>,
    dispatcher: Arc<dyn Dispatcher>,
}

impl std::fmt::Debug for CpuDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CpuDriver").field("config", &self.config).finish_non_exhaustive()
    }
}

impl Default for CpuDriver {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[bon]
impl CpuDriver {
    #[builder]
    pub fn new(
        #[builder(default = RuntimeConfig::from_env())] config: RuntimeConfig,
        #[builder(default = Arc::new(ClangCompiler::default()) as Arc<dyn ScriptCompiler>)]
        compiler: Arc<dyn ScriptCompiler>,
        #[builder(default = Arc::new(TracingSink) as Arc<dyn ErrorSink>)] sink: Arc<dyn ErrorSink>,
        #[builder(default = Arc::new(RayonDispatcher) as Arc<dyn Dispatcher>)] dispatcher: Arc<dyn Dispatcher>,
    ) -> Self {
        Self { config, compiler, sink, dispatcher }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Load script `name` and create an instance of it.
    ///
    /// With `source`, the script is built (or taken from the compiler's cache);
    /// without, a prebuilt artifact is searched for. Instances never share
    /// globals, even when they come from the same artifact.
    ///
    /// # Safety
    ///
    /// Loading runs the artifact's initializers, and every export is trusted
    /// to follow the kscript ABI.
    pub unsafe fn create_script(&self, name: &str, cache_dir: &Path, source: Option<&[u8]>) -> Result<ScriptInstance> {
        let loader = ModuleLoader::new(&self.config, self.compiler.as_ref());
        let module = unsafe { loader.load(name, cache_dir, source)? };
        info!(script.name = %name, mapping = %module.mapping(), "script created");
        Ok(ScriptInstance::new(module, Arc::clone(&self.sink), Arc::clone(&self.dispatcher)))
    }

    /// Create an instance over an in-memory image.
    ///
    /// # Safety
    ///
    /// Every symbol registered in `image` must follow the kscript ABI.
    pub unsafe fn create_script_from_image(&self, name: &str, image: ModuleImage) -> Result<ScriptInstance> {
        let loader = ModuleLoader::new(&self.config, self.compiler.as_ref());
        let module = loader.load_image(name, image)?;
        Ok(ScriptInstance::new(module, Arc::clone(&self.sink), Arc::clone(&self.dispatcher)))
    }
}
