//! Invokes user code for a fetched `IoContext` and turns the outcome into
//! one `GenericResult` per input id.

use crate::classify;
use crate::context::{CallArgs, IoContext};
use crate::function::{Callable, FinalizedFunction, FunctionLoader};
use crate::generator_sink::GeneratorSink;
use icm_common::codec::{Codec, DataFormat};
use icm_common::{ArgPayload, GenericResult, MAX_OBJECT_SIZE_BYTES};
use icm_rpc::BlobStore;
use std::sync::Arc;
use tokio::sync::mpsc;

pub struct Executor {
    loader: Arc<dyn FunctionLoader>,
    codec: Arc<dyn Codec>,
    blobs: Arc<dyn BlobStore>,
    sink: Arc<GeneratorSink>,
}

impl Executor {
    pub fn new(
        loader: Arc<dyn FunctionLoader>,
        codec: Arc<dyn Codec>,
        blobs: Arc<dyn BlobStore>,
        sink: Arc<GeneratorSink>,
    ) -> Self {
        Self { loader, codec, blobs, sink }
    }

    /// Never returns an `Err`: every failure mode is classified into a
    /// `GenericResult` so the caller always has exactly one result per input
    /// id to push.
    pub async fn execute(&self, ctx: Arc<IoContext>) -> Vec<GenericResult> {
        let function = match self.loader.resolve(&ctx.method_name) {
            Some(f) => f,
            None => {
                return classify::batch_invariant_violation(
                    &format!("no function registered for method {}", ctx.method_name),
                    ctx.batch_size(),
                )
            }
        };

        match &function.callable {
            Callable::Sync(callable) => {
                let callable = callable.clone();
                self.run_blocking(&ctx, move |arg| callable(arg)).await
            }
            Callable::Async(callable) => {
                let callable = callable.clone();
                self.run_async(&ctx, move |arg| callable(arg)).await
            }
            Callable::Batched(callable) => self.run_batched(&ctx, &function, callable.clone()).await,
            Callable::Generator(callable) => self.run_generator(&ctx, callable.clone()).await,
        }
    }

    fn single_arg(ctx: &IoContext) -> Result<serde_json::Value, GenericResult> {
        match &ctx.args {
            CallArgs::Single(v) => Ok(v.clone()),
            CallArgs::Batched(_) => {
                Err(classify::user_failure("expected a single-input context, got a batch", ""))
            }
        }
    }

    async fn run_blocking<F>(&self, ctx: &Arc<IoContext>, f: F) -> Vec<GenericResult>
    where
        F: FnOnce(serde_json::Value) -> Result<serde_json::Value, String> + Send + 'static,
    {
        let arg = match Self::single_arg(ctx) {
            Ok(v) => v,
            Err(result) => return vec![result],
        };
        let handle = tokio::task::spawn_blocking(move || f(arg));
        let abort_handle = handle.abort_handle();
        ctx.set_cancel_hook(Box::new(move || abort_handle.abort()));

        match handle.await {
            Ok(Ok(value)) => vec![self.serialize_success(&value).await],
            Ok(Err(e)) => vec![classify::user_failure(&e, "")],
            Err(e) if e.is_cancelled() => vec![classify::terminated()],
            Err(e) => vec![classify::user_failure(&e.to_string(), "")],
        }
    }

    async fn run_async<F, Fut>(&self, ctx: &Arc<IoContext>, f: F) -> Vec<GenericResult>
    where
        F: FnOnce(serde_json::Value) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<serde_json::Value, String>> + Send + 'static,
    {
        let arg = match Self::single_arg(ctx) {
            Ok(v) => v,
            Err(result) => return vec![result],
        };
        let handle = tokio::spawn(f(arg));
        let abort_handle = handle.abort_handle();
        ctx.set_cancel_hook(Box::new(move || abort_handle.abort()));

        match handle.await {
            Ok(Ok(value)) => vec![self.serialize_success(&value).await],
            Ok(Err(e)) => vec![classify::user_failure(&e, "")],
            Err(e) if e.is_cancelled() => vec![classify::terminated()],
            Err(e) => vec![classify::user_failure(&e.to_string(), "")],
        }
    }

    async fn run_batched(
        &self,
        ctx: &Arc<IoContext>,
        function: &FinalizedFunction,
        callable: crate::function::BatchedCallable,
    ) -> Vec<GenericResult> {
        let n = ctx.batch_size();
        let raw = match &ctx.args {
            CallArgs::Batched(values) => values.clone(),
            CallArgs::Single(v) => vec![v.clone()],
        };

        let param_count = function.param_names.len().max(1);
        let columns = match reshape_batch_args(&raw, param_count) {
            Ok(columns) => columns,
            Err(message) => return classify::batch_invariant_violation(&message, n),
        };

        let handle = tokio::task::spawn_blocking(move || callable(columns));
        let abort_handle = handle.abort_handle();
        ctx.set_cancel_hook(Box::new(move || abort_handle.abort()));

        match handle.await {
            Ok(Ok(values)) if values.len() == n => {
                let mut results = Vec::with_capacity(n);
                for v in values {
                    results.push(self.serialize_success(&v).await);
                }
                results
            }
            Ok(Ok(values)) => classify::batch_invariant_violation(
                &format!("expected {} return values, got {}", n, values.len()),
                n,
            ),
            Ok(Err(e)) => classify::batch_invariant_violation(&e, n),
            Err(e) if e.is_cancelled() => (0..n).map(|_| classify::terminated()).collect(),
            Err(e) => classify::batch_invariant_violation(&e.to_string(), n),
        }
    }

    async fn run_generator(
        &self,
        ctx: &Arc<IoContext>,
        callable: crate::function::GeneratorCallable,
    ) -> Vec<GenericResult> {
        let arg = match Self::single_arg(ctx) {
            Ok(v) => v,
            Err(result) => return vec![result],
        };
        let function_call_id = ctx.function_call_ids[0].clone();

        let (item_tx, item_rx) = mpsc::channel(16);
        let sink = self.sink.clone();
        let sink_handle = tokio::spawn(async move { sink.run(function_call_id, item_rx).await });

        let handle = tokio::spawn(callable(arg, item_tx));
        let abort_handle = handle.abort_handle();
        ctx.set_cancel_hook(Box::new(move || abort_handle.abort()));

        let run_result = handle.await;
        let items_total = sink_handle.await.unwrap_or(0);

        match run_result {
            Ok(Ok(())) => vec![self.serialize_success(&serde_json::json!({ "items_total": items_total })).await],
            Ok(Err(e)) => vec![classify::user_failure(&e, "")],
            Err(e) if e.is_cancelled() => vec![classify::terminated()],
            Err(e) => vec![classify::user_failure(&e.to_string(), "")],
        }
    }

    async fn serialize_success(&self, value: &serde_json::Value) -> GenericResult {
        match self.codec.serialize(value, DataFormat::Json) {
            Ok(bytes) if bytes.len() > MAX_OBJECT_SIZE_BYTES => match self.blobs.upload(bytes).await {
                Ok(handle) => classify::success(ArgPayload::Blob(handle)),
                Err(e) => classify::user_failure(&format!("failed to upload oversize output: {}", e), ""),
            },
            Ok(bytes) => classify::success(ArgPayload::Inline(bytes)),
            Err(e) => classify::serialization_failure(&e.to_string()),
        }
    }
}

/// Reshapes one JSON array of positional arguments per input into parallel
/// per-parameter columns. Every input must supply exactly `param_count`
/// positional values; a mismatch anywhere fails the whole batch with one
/// message, matching how the host platform reports arity errors.
fn reshape_batch_args(
    raw: &[serde_json::Value],
    param_count: usize,
) -> Result<Vec<Vec<serde_json::Value>>, String> {
    let mut columns = vec![Vec::with_capacity(raw.len()); param_count];
    for value in raw {
        let arr = value
            .as_array()
            .ok_or_else(|| format!("takes {} positional arguments", param_count))?;
        if arr.len() != param_count {
            return Err(format!("takes {} positional arguments", param_count));
        }
        for (col, item) in columns.iter_mut().zip(arr.iter()) {
            col.push(item.clone());
        }
    }
    Ok(columns)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::IoContext;
    use crate::function::{Callable, FinalizedFunction, StaticFunctionLoader};
    use icm_common::codec::JsonCodec;
    use icm_common::FunctionShape;
    use icm_rpc::fake::FakeBlobStore;

    fn make_executor(loader: StaticFunctionLoader) -> Executor {
        let rpc = Arc::new(icm_rpc::fake::FakeRpcClient::new());
        let blobs: Arc<dyn BlobStore> = Arc::new(FakeBlobStore::new());
        let sink = Arc::new(GeneratorSink::new(rpc, blobs.clone(), Arc::new(JsonCodec)));
        Executor::new(Arc::new(loader), Arc::new(JsonCodec), blobs, sink)
    }

    fn single_ctx(value: i64) -> Arc<IoContext> {
        Arc::new(IoContext::new(
            vec!["in-1".into()],
            vec![0],
            vec!["fc-1".into()],
            "square".into(),
            CallArgs::Single(serde_json::json!(value)),
        ))
    }

    #[tokio::test]
    async fn simple_success_produces_one_output() {
        let loader = StaticFunctionLoader::new().register(FinalizedFunction {
            method_name: "square".into(),
            shape: FunctionShape::Sync,
            param_names: vec!["x".into()],
            callable: Callable::Sync(Arc::new(|v| {
                let x = v.as_i64().unwrap_or_default();
                Ok(serde_json::json!(x * x))
            })),
        });
        let executor = make_executor(loader);
        let results = executor.execute(single_ctx(42)).await;
        assert_eq!(results.len(), 1);
        match &results[0].data {
            Some(ArgPayload::Inline(bytes)) => {
                let v: serde_json::Value = serde_json::from_slice(bytes).unwrap();
                assert_eq!(v, serde_json::json!(1764));
            }
            other => panic!("expected inline success data, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn user_exception_produces_failure_output() {
        let loader = StaticFunctionLoader::new().register(FinalizedFunction {
            method_name: "raises".into(),
            shape: FunctionShape::Sync,
            param_names: vec![],
            callable: Callable::Sync(Arc::new(|_| Err("Failure!".to_string()))),
        });
        let executor = make_executor(loader);
        let ctx = Arc::new(IoContext::new(
            vec!["in-1".into()],
            vec![0],
            vec!["fc-1".into()],
            "raises".into(),
            CallArgs::Single(serde_json::Value::Null),
        ));
        let results = executor.execute(ctx).await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].status, icm_common::ResultStatus::Failure);
        assert!(results[0].exception.as_deref().unwrap().contains("Failure!"));
    }

    #[tokio::test]
    async fn cancellation_produces_terminated_not_failure() {
        let loader = StaticFunctionLoader::new().register(FinalizedFunction {
            method_name: "sleepy".into(),
            shape: FunctionShape::Async,
            param_names: vec!["x".into()],
            callable: Callable::Async(Arc::new(|v| {
                Box::pin(async move {
                    let secs = v.as_f64().unwrap_or_default();
                    tokio::time::sleep(std::time::Duration::from_secs_f64(secs)).await;
                    Ok(v)
                })
            })),
        });
        let executor = Arc::new(make_executor(loader));
        let ctx = Arc::new(IoContext::new(
            vec!["in-1".into()],
            vec![0],
            vec!["fc-1".into()],
            "sleepy".into(),
            CallArgs::Single(serde_json::json!(20.0)),
        ));

        let exec2 = executor.clone();
        let ctx2 = ctx.clone();
        let handle = tokio::spawn(async move { exec2.execute(ctx2).await });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        ctx.cancel();

        let results = tokio::time::timeout(std::time::Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].status, icm_common::ResultStatus::Terminated);
    }

    #[tokio::test]
    async fn batch_arity_mismatch_fails_every_input_with_same_message() {
        let loader = StaticFunctionLoader::new().register(FinalizedFunction {
            method_name: "add".into(),
            shape: FunctionShape::Batched,
            param_names: vec!["a".into(), "b".into()],
            callable: Callable::Batched(Arc::new(|columns| {
                let a = &columns[0];
                let b = &columns[1];
                Ok(a.iter()
                    .zip(b.iter())
                    .map(|(x, y)| serde_json::json!(x.as_i64().unwrap_or(0) + y.as_i64().unwrap_or(0)))
                    .collect())
            })),
        });
        let executor = make_executor(loader);
        let ctx = Arc::new(IoContext::new(
            vec!["in-1".into(), "in-2".into()],
            vec![0, 0],
            vec!["fc-1".into(), "fc-1".into()],
            "add".into(),
            CallArgs::Batched(vec![serde_json::json!([1, 2]), serde_json::json!([1, 2, 3])]),
        ));
        let results = executor.execute(ctx).await;
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].exception, results[1].exception);
        assert_eq!(results[0].exception.as_deref(), Some("takes 2 positional arguments"));
    }

    #[tokio::test]
    async fn batch_with_valid_arity_produces_n_outputs() {
        let loader = StaticFunctionLoader::new().register(FinalizedFunction {
            method_name: "add".into(),
            shape: FunctionShape::Batched,
            param_names: vec!["a".into(), "b".into()],
            callable: Callable::Batched(Arc::new(|columns| {
                let a = &columns[0];
                let b = &columns[1];
                Ok(a.iter()
                    .zip(b.iter())
                    .map(|(x, y)| serde_json::json!(x.as_i64().unwrap_or(0) + y.as_i64().unwrap_or(0)))
                    .collect())
            })),
        });
        let executor = make_executor(loader);
        let ctx = Arc::new(IoContext::new(
            vec!["in-1".into(), "in-2".into()],
            vec![0, 0],
            vec!["fc-1".into(), "fc-1".into()],
            "add".into(),
            CallArgs::Batched(vec![serde_json::json!([1, 2]), serde_json::json!([3, 4])]),
        ));
        let results = executor.execute(ctx).await;
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.status == icm_common::ResultStatus::Success));
    }
}
