//! Job de ejemplo que usa los cuatro operadores sobre `i64`.
//!
//! La raíz difunde un factor (`model`), reparte los números 1..=N (`shards`),
//! y recibe la suma (`sum`) y los parciales por task (`results`). Cada miembro
//! multiplica la suma de su porción por el factor.

use std::sync::Arc;

use common::{FunctionRegistry, Result, Sum};
use tracing::info;

use crate::client::GroupCommClient;

pub const MODEL_OPERATOR: &str = "model";
pub const SUM_OPERATOR: &str = "sum";
pub const SHARDS_OPERATOR: &str = "shards";
pub const RESULTS_OPERATOR: &str = "results";
pub const SUM_FUNCTION: &str = "sum";

const FACTOR: i64 = 3;
const INPUT_LEN: i64 = 100;

/// Lo que obtiene la raíz al final del job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DemoSummary {
    pub total: i64,
    pub partials: Vec<(String, i64)>,
}

pub fn registry() -> FunctionRegistry<i64> {
    FunctionRegistry::new().with_reduce_function(SUM_FUNCTION, Sum::new())
}

/// Corre el job. Devuelve `Some` sólo en la raíz.
pub async fn run(client: &Arc<GroupCommClient>, group_id: &str) -> Result<Option<DemoSummary>> {
    let registry = registry();
    let snapshot = client.wait_ready(group_id).await?;

    if snapshot.is_root(client.task_id()) {
        client
            .broadcast(group_id, MODEL_OPERATOR, &registry)
            .await?
            .send(&FACTOR)
            .await?;
        client
            .scatter(group_id, SHARDS_OPERATOR, &registry)
            .await?
            .send((1..=INPUT_LEN).collect())
            .await?;

        let total = client
            .reduce(group_id, SUM_OPERATOR, &registry)
            .await?
            .receive()
            .await?;
        let partials = client
            .gather(group_id, RESULTS_OPERATOR, &registry)
            .await?
            .receive_keyed()
            .await?;

        info!("[{}] total {} con {} parciales", client.task_id(), total, partials.len());
        return Ok(Some(DemoSummary { total, partials }));
    }

    let factor = client
        .broadcast(group_id, MODEL_OPERATOR, &registry)
        .await?
        .receive()
        .await?;
    let shard = client
        .scatter(group_id, SHARDS_OPERATOR, &registry)
        .await?
        .receive()
        .await?;
    let partial = shard.iter().sum::<i64>() * factor;
    info!(
        "[{}] porción de {} elementos, parcial {}",
        client.task_id(),
        shard.len(),
        partial
    );

    client
        .reduce(group_id, SUM_OPERATOR, &registry)
        .await?
        .send(&partial)
        .await?;
    client
        .gather(group_id, RESULTS_OPERATOR, &registry)
        .await?
        .send(&partial)
        .await?;
    Ok(None)
}
