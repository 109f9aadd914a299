use std::collections::HashSet;

use serde_json::json;
use tracing::{debug, warn};

use super::Engine;
use crate::types::ResultLine;

/// Routes a newline-delimited result payload back to the callers waiting in
/// the pending registry. Delivered correlation ids leave the owned set;
/// whatever remains afterwards is the executor's to synthesize.
pub(crate) fn dispatch(engine: &Engine, content: &[u8], owned: &mut HashSet<String>) {
    for line in content.split(|byte| *byte == b'\n') {
        if line.is_empty() {
            continue;
        }

        let parsed: ResultLine = match serde_json::from_slice(line) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!("failed to parse batch output line: {err}");
                continue;
            }
        };
        debug!(request_id = %parsed.custom_id, "processing result line");

        let delivery = if let Some(error) = parsed.error {
            json!({ "error": error })
        } else if let Some(response) = parsed.response {
            response.body
        } else {
            warn!(
                request_id = %parsed.custom_id,
                "result line carries neither a response nor an error"
            );
            continue;
        };

        if engine.deliver(&parsed.custom_id, delivery) {
            owned.remove(&parsed.custom_id);
        } else {
            warn!(request_id = %parsed.custom_id, "no waiting request for result line");
        }
    }
}
