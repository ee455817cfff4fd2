use std::sync::Arc;

use crate::{artifacts::ArtifactService, auth::TokenService};

#[derive(Clone)]
pub struct RouteState {
    pub service: Arc<ArtifactService>,
    pub tokens: Arc<TokenService>,
}
