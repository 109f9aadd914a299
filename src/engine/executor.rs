use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, info, warn};

use super::{demux, Engine};
use crate::types::{BatchKey, BatchObject};
use crate::utils::task::spawn_supervised;
use crate::Result;

/// Drives one emitted batch through its whole upstream lifecycle: upload
/// the payload, create the batch, poll it to a terminal status, route the
/// result files back to the waiting callers, and clean up. Every failure
/// path ends with a synthesized error to each caller this batch still owns.
pub(crate) async fn run(
    engine: Arc<Engine>,
    key: BatchKey,
    payload: Vec<u8>,
    mut owned: HashSet<String>,
) {
    engine.stats().track_batch_start();
    let started = Instant::now();
    info!(requests = owned.len(), endpoint = %key.endpoint, "starting to process batch");

    let file_id = match engine.upstream.upload_file(&key.credential, payload).await {
        Ok(file_id) => file_id,
        Err(err) => {
            error!("failed to upload batch input file: {err}");
            engine.synthesize_error_all(&owned, &format!("Failed to upload file: {err}"));
            engine.stats().track_batch_end(false, started.elapsed());
            return;
        }
    };
    info!(file_id = %file_id, "batch input file uploaded");

    let batch_id = match engine
        .upstream
        .create_batch(&key.credential, &file_id, &key.endpoint)
        .await
    {
        Ok(batch_id) => batch_id,
        Err(err) => {
            error!("failed to create batch: {err}");
            if let Err(delete_err) = engine.upstream.delete_file(&key.credential, &file_id).await {
                warn!(file_id = %file_id, "failed to delete input file: {delete_err}");
            }
            engine.synthesize_error_all(&owned, &format!("Failed to create batch: {err}"));
            engine.stats().track_batch_end(false, started.elapsed());
            return;
        }
    };
    info!(batch_id = %batch_id, "batch created");

    engine.active.insert(&batch_id, &key.credential);

    let batch = match poll_until_terminal(&engine, &key.credential, &batch_id).await {
        Ok(batch) => batch,
        Err(err) => {
            error!(batch_id = %batch_id, "failed polling batch status: {err}");
            engine.synthesize_error_all(&owned, &format!("Batch processing failed: {err}"));
            engine.stats().track_batch_end(false, started.elapsed());
            engine.active.remove(&batch_id);
            return;
        }
    };

    // Output and error files are independently optional; both feed the
    // same demultiplexer.
    for file_id in [batch.output_file_id.as_deref(), batch.error_file_id.as_deref()]
        .into_iter()
        .flatten()
    {
        let content = match engine.upstream.file_content(&key.credential, file_id).await {
            Ok(content) => content,
            Err(err) => {
                warn!(file_id, "failed to retrieve result file: {err}");
                continue;
            }
        };
        debug!(file_id, bytes = content.len(), "retrieved result file");

        let upstream = engine.upstream.clone();
        let credential = key.credential.clone();
        let delete_id = file_id.to_string();
        spawn_supervised("delete-result-file", async move {
            if let Err(err) = upstream.delete_file(&credential, &delete_id).await {
                warn!(file_id = %delete_id, "failed to delete result file: {err}");
            }
        });

        demux::dispatch(&engine, &content, &mut owned);
    }

    // Not expected from a compliant upstream: ids neither result file
    // mentioned.
    for custom_id in &owned {
        engine.synthesize_error(
            custom_id,
            &format!("No response received for request [{custom_id}] in the batch"),
        );
    }

    engine.stats().track_batch_end(true, started.elapsed());
    engine.active.remove(&batch_id);
    info!(
        batch_id = %batch_id,
        status = batch.status.as_str(),
        "finished processing batch"
    );
}

/// Polls the batch document at a fixed cadence until the upstream reports
/// completed, failed, expired, or cancelled. Shutdown never interrupts the
/// poll directly; the shutdown-time cancel request drives the status to
/// cancelled instead.
async fn poll_until_terminal(
    engine: &Engine,
    credential: &str,
    batch_id: &str,
) -> Result<BatchObject> {
    debug!(batch_id, "starting to poll batch status");
    loop {
        tokio::time::sleep(engine.config.poll_interval).await;

        let batch = engine.upstream.batch_status(credential, batch_id).await?;
        if batch.status.is_terminal() {
            info!(
                batch_id,
                status = batch.status.as_str(),
                output_file_id = batch.output_file_id.as_deref().unwrap_or(""),
                error_file_id = batch.error_file_id.as_deref().unwrap_or(""),
                "batch reached terminal status"
            );
            return Ok(batch);
        }
        debug!(batch_id, status = batch.status.as_str(), "batch still in progress");
    }
}
