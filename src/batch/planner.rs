use uuid::Uuid;

use super::model::{Batch, BatchOrder, JobProgress};
use crate::state_machine::{PartChainIdentificationKey, ProcessingState};

/// Splits `keys` into consecutive batches of at most `batch_size` keys.
///
/// Batches are numbered from 1 in key order and each starts CREATED with one
/// pending progress entry per key.
pub fn plan_batches(
    order: &BatchOrder,
    keys: &[PartChainIdentificationKey],
    batch_size: usize,
    public_base_url: &str,
) -> Vec<Batch> {
    let chunks: Vec<_> = keys.chunks(batch_size.max(1)).collect();
    let batch_total = chunks.len() as u32;

    chunks
        .into_iter()
        .enumerate()
        .map(|(i, chunk)| {
            let batch_id = Uuid::new_v4();
            Batch {
                batch_id,
                batch_order_id: order.batch_order_id,
                batch_number: i as u32 + 1,
                batch_total,
                batch_state: ProcessingState::Created,
                job_progress: chunk.iter().cloned().map(JobProgress::pending).collect(),
                started_on: None,
                completed_on: None,
                owner: order.owner.clone(),
                batch_url: batch_url(public_base_url, order.batch_order_id, batch_id),
            }
        })
        .collect()
}

pub fn batch_url(public_base_url: &str, batch_order_id: Uuid, batch_id: Uuid) -> String {
    format!(
        "{}/orders/{batch_order_id}/batches/{batch_id}",
        public_base_url.trim_end_matches('/')
    )
}
