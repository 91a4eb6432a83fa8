use crate::commands::install::mirror_from_url;
use crate::errors::Result;
use crate::models::{GameEntry, MirrorLink};
use crate::services::catalogue_service::search;
use crate::AppState;

pub async fn list_catalogue(state: &AppState, query: Option<&str>) -> Result<Vec<GameEntry>> {
    let entries = state.catalogue.fetch_catalogue().await?;
    Ok(match query {
        Some(query) => search(&entries, query),
        None => entries,
    })
}

pub async fn list_mirrors(
    state: &AppState,
    detail_url: &str,
    title: Option<&str>,
) -> Result<Vec<MirrorLink>> {
    let game = GameEntry {
        title: title
            .map(str::to_string)
            .unwrap_or_else(|| mirror_from_url(detail_url).label),
        detail_url: detail_url.to_string(),
        region: None,
        size_hint: None,
    };
    let mirrors = state.catalogue.fetch_mirrors(&game).await?;
    Ok(mirrors)
}
