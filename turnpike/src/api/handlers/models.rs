//! `GET /v1/models` and `GET /v1/models/{alias}`: the catalog as the
//! authenticated tenant sees it.

use axum::{
    Extension, Json,
    extract::{Path, State},
};

use crate::AppState;
use crate::auth::AuthContext;
use crate::db::handlers::Catalog;
use crate::errors::{Error, Result};
use crate::openai::{ModelList, ModelObject};

pub async fn list(State(state): State<AppState>, Extension(ctx): Extension<AuthContext>) -> Result<Json<ModelList>> {
    let aliases = Catalog::enabled_aliases(&state.db).await?;
    let data = aliases
        .into_iter()
        .filter(|(alias, _)| ctx.tenant.allows_alias(alias) && state.dispatcher.router().has_alias(alias))
        .map(|(alias, created_at)| ModelObject {
            id: alias,
            object: "model".to_string(),
            created: created_at.timestamp(),
            owned_by: "turnpike".to_string(),
        })
        .collect();
    Ok(Json(ModelList::new(data)))
}

pub async fn retrieve(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(alias): Path<String>,
) -> Result<Json<ModelObject>> {
    if !ctx.tenant.allows_alias(&alias) || !state.dispatcher.router().has_alias(&alias) {
        return Err(Error::ModelNotFound { alias });
    }
    let aliases = Catalog::enabled_aliases(&state.db).await?;
    let created = aliases
        .into_iter()
        .find(|(candidate, _)| candidate == &alias)
        .map(|(_, created_at)| created_at.timestamp())
        .ok_or_else(|| Error::ModelNotFound { alias: alias.clone() })?;

    Ok(Json(ModelObject {
        id: alias,
        object: "model".to_string(),
        created,
        owned_by: "turnpike".to_string(),
    }))
}
