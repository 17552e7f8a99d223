//! Loading and binding user code. Real function loading (import, class
//! instantiation, lifecycle hooks) is out of scope; this crate only needs
//! the trait boundary and a stand-in registry so the pipeline runs
//! end-to-end against plain closures in tests and demos.

use futures::future::BoxFuture;
use icm_common::FunctionShape;
use std::collections::HashMap;
use std::sync::Arc;

pub type SyncCallable = Arc<dyn Fn(serde_json::Value) -> Result<serde_json::Value, String> + Send + Sync>;
pub type AsyncCallable =
    Arc<dyn Fn(serde_json::Value) -> BoxFuture<'static, Result<serde_json::Value, String>> + Send + Sync>;
pub type BatchedCallable =
    Arc<dyn Fn(Vec<Vec<serde_json::Value>>) -> Result<Vec<serde_json::Value>, String> + Send + Sync>;
pub type GeneratorCallable = Arc<
    dyn Fn(serde_json::Value, tokio::sync::mpsc::Sender<serde_json::Value>) -> BoxFuture<'static, Result<(), String>>
        + Send
        + Sync,
>;

/// The post-loading representation of a user callable, together with the
/// shape flags the executor dispatches on.
#[derive(Clone)]
pub struct FinalizedFunction {
    pub method_name: String,
    pub shape: FunctionShape,
    pub param_names: Vec<String>,
    pub callable: Callable,
}

#[derive(Clone)]
pub enum Callable {
    Sync(SyncCallable),
    Async(AsyncCallable),
    Batched(BatchedCallable),
    Generator(GeneratorCallable),
}

pub trait FunctionLoader: Send + Sync {
    fn resolve(&self, method_name: &str) -> Option<Arc<FinalizedFunction>>;
}

/// In-memory registry, the stand-in used by `main` and by integration
/// tests in place of real module/class loading.
#[derive(Default)]
pub struct StaticFunctionLoader {
    functions: HashMap<String, Arc<FinalizedFunction>>,
}

impl StaticFunctionLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, function: FinalizedFunction) -> Self {
        self.functions.insert(function.method_name.clone(), Arc::new(function));
        self
    }
}

impl FunctionLoader for StaticFunctionLoader {
    fn resolve(&self, method_name: &str) -> Option<Arc<FinalizedFunction>> {
        self.functions.get(method_name).cloned()
    }
}
