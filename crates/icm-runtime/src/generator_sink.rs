//! Coalesces a generator's or web endpoint's emitted messages into
//! size-bounded chunks written to the function-call's `data_out` stream.

use icm_common::codec::{Codec, DataFormat};
use icm_common::MAX_OBJECT_SIZE_BYTES;
use icm_rpc::model::{FunctionCallDataChunk, PutFunctionCallDataRequest};
use icm_rpc::{BlobStore, RpcClient};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::warn;

/// Sleep after the first message of a function call, to let a naturally
/// paired second message (e.g. web headers plus the first body chunk)
/// coalesce into one chunk. Empirical, not principled; do not remove it to
/// "simplify" the loop.
pub const GENERATOR_COALESCE_DELAY: Duration = Duration::from_millis(1);

/// Cap on the estimated total payload of one coalesced chunk.
pub const GENERATOR_COALESCE_CAP_BYTES: usize = 16 * 1024 * 1024;

/// Conservative per-message framing allowance added to the serialized size
/// when deciding whether a message still fits in the current chunk.
const FRAMING_OVERHEAD_BYTES: usize = 512;

pub struct GeneratorSink {
    rpc: Arc<dyn RpcClient>,
    blobs: Arc<dyn BlobStore>,
    codec: Arc<dyn Codec>,
}

impl GeneratorSink {
    pub fn new(rpc: Arc<dyn RpcClient>, blobs: Arc<dyn BlobStore>, codec: Arc<dyn Codec>) -> Self {
        Self { rpc, blobs, codec }
    }

    /// Drains `rx` until the sender side is dropped (the Rust-idiomatic
    /// stand-in for an explicit EOF sentinel), flushing any pending chunk on
    /// exit. Returns the number of items observed, for the terminal
    /// "generator done" record.
    pub async fn run(&self, function_call_id: String, mut rx: mpsc::Receiver<serde_json::Value>) -> usize {
        let mut index: u64 = 0;
        let mut items_total = 0usize;
        let mut first = true;

        while let Some(first_item) = rx.recv().await {
            if first {
                first = false;
                tokio::time::sleep(GENERATOR_COALESCE_DELAY).await;
            }

            let mut batch = vec![first_item];
            let mut estimated = Self::estimate_size(&batch[0]);
            while estimated < GENERATOR_COALESCE_CAP_BYTES {
                match rx.try_recv() {
                    Ok(item) => {
                        estimated += Self::estimate_size(&item);
                        batch.push(item);
                    }
                    Err(_) => break,
                }
            }

            let mut chunks = Vec::with_capacity(batch.len());
            for value in batch {
                index += 1;
                items_total += 1;
                chunks.push(self.build_chunk(index, &value).await);
            }

            if let Err(e) = self
                .rpc
                .put_function_call_data(PutFunctionCallDataRequest {
                    function_call_id: function_call_id.clone(),
                    chunks,
                })
                .await
            {
                warn!(error = %e, function_call_id, "failed to push generator chunk");
            }
        }

        items_total
    }

    async fn build_chunk(&self, index: u64, value: &serde_json::Value) -> FunctionCallDataChunk {
        match self.codec.serialize(value, DataFormat::Json) {
            Ok(bytes) if bytes.len() > MAX_OBJECT_SIZE_BYTES => match self.blobs.upload(bytes).await {
                Ok(handle) => FunctionCallDataChunk {
                    index,
                    data: serde_json::to_vec(&serde_json::json!({ "blob": handle })).unwrap_or_default(),
                },
                Err(e) => {
                    warn!(error = %e, "failed to offload oversize generator chunk to blob store");
                    FunctionCallDataChunk { index, data: Vec::new() }
                }
            },
            Ok(bytes) => FunctionCallDataChunk { index, data: bytes },
            Err(e) => {
                warn!(error = %e, "failed to serialize generator chunk");
                FunctionCallDataChunk { index, data: Vec::new() }
            }
        }
    }

    fn estimate_size(value: &serde_json::Value) -> usize {
        serde_json::to_vec(value).map(|b| b.len()).unwrap_or(0) + FRAMING_OVERHEAD_BYTES
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use icm_common::codec::JsonCodec;
    use icm_rpc::fake::{FakeBlobStore, FakeRpcClient};

    fn make_sink() -> (Arc<FakeRpcClient>, GeneratorSink) {
        let rpc = Arc::new(FakeRpcClient::new());
        let blobs = Arc::new(FakeBlobStore::new());
        let sink = GeneratorSink::new(rpc.clone(), blobs, Arc::new(JsonCodec));
        (rpc, sink)
    }

    #[tokio::test]
    async fn assigns_monotonic_indices_starting_at_one() {
        let (_rpc, sink) = make_sink();
        let (tx, rx) = mpsc::channel(8);
        for i in 0..3 {
            tx.send(serde_json::json!(i)).await.unwrap();
        }
        drop(tx);
        let total = sink.run("fc-1".into(), rx).await;
        assert_eq!(total, 3);
    }

    #[tokio::test]
    async fn items_total_matches_observed_chunk_count() {
        let (_rpc, sink) = make_sink();
        let (tx, rx) = mpsc::channel(8);
        tokio::spawn(async move {
            for i in 0..5 {
                tx.send(serde_json::json!({ "n": i })).await.unwrap();
            }
        });
        let total = sink.run("fc-1".into(), rx).await;
        assert_eq!(total, 5);
    }

    #[tokio::test]
    async fn empty_stream_produces_zero_items_and_no_rpc_calls() {
        let (rpc, sink) = make_sink();
        let (tx, rx) = mpsc::channel::<serde_json::Value>(1);
        drop(tx);
        let total = sink.run("fc-1".into(), rx).await;
        assert_eq!(total, 0);
        assert!(rpc.pushed_outputs.lock().unwrap().is_empty());
    }
}
