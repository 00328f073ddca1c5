use std::sync::Arc;

use crate::catalog::CatalogStore;
use crate::pipeline::Pipeline;

pub(crate) struct ServerState {
    pub(crate) pipeline: Pipeline,
    pub(crate) catalog: Arc<dyn CatalogStore>,
}
