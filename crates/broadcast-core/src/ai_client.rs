// AI Processor collaborator (spec §6.1) — direct HTTP JSON calls to the
// external rewriting/research/vision service. Grounded on
// engine/providers.rs's reqwest client shape (a thin struct wrapping
// `reqwest::Client` + base url, one method per endpoint, JSON in/out).

use crate::error::{EngineError, EngineResult};
use crate::types::{BookSearchResult, CaptionAnalysis, Format, ImageCandidate, Level, ParsedItem};
use log::warn;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

/// Every call to the AI processor times out at 60s (spec §6.1).
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

pub struct AiClient {
    http: Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    draft: String,
    #[serde(default)]
    preview_links: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ResearchResponse {
    results: Vec<BookSearchResult>,
}

#[derive(Debug, Deserialize)]
struct EnrichResponse {
    enriched_description: String,
}

#[derive(Debug, Deserialize)]
struct SearchImagesResponse {
    images: Vec<ImageCandidate>,
}

#[derive(Debug, Deserialize)]
struct SearchLinksResponse {
    links: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct DisplayTitleResponse {
    display_title: String,
}

/// Rule-based parsing reported incomplete input — the missing required
/// fields the Flow Engine should ask the operator for (spec §4.5.1).
#[derive(Debug, Deserialize)]
pub struct IncompleteParse {
    pub missing_fields: Vec<String>,
}

pub enum ParseOutcome {
    Complete(ParsedItem),
    Incomplete(IncompleteParse),
}

impl AiClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        AiClient {
            http: Client::builder().timeout(REQUEST_TIMEOUT).build().expect("reqwest client"),
            base_url: base_url.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    async fn post_json<T: for<'de> Deserialize<'de>>(&self, path: &str, body: serde_json::Value) -> EngineResult<T> {
        let resp = self.http.post(self.url(path)).json(&body).send().await.map_err(|e| {
            warn!("[ai-client] POST {path} failed: {e}");
            EngineError::Network(e)
        })?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(EngineError::provider(format!("{status}: {text}")));
        }
        resp.json::<T>().await.map_err(EngineError::Network)
    }

    /// `POST /parse { text, media_count, supplier } → ParsedItem | incomplete`.
    pub async fn parse(&self, text: &str, media_count: usize, supplier: &str) -> EngineResult<ParseOutcome> {
        let value: serde_json::Value = self
            .post_json(
                "/parse",
                json!({ "text": text, "media_count": media_count, "supplier": supplier }),
            )
            .await?;
        if let Some(missing) = value.get("missing_fields") {
            let missing: Vec<String> = serde_json::from_value(missing.clone())?;
            return Ok(ParseOutcome::Incomplete(IncompleteParse { missing_fields: missing }));
        }
        let item: ParsedItem = serde_json::from_value(value)?;
        if item.title.is_empty() {
            return Err(EngineError::provider("AI parse returned an empty title"));
        }
        Ok(ParseOutcome::Complete(item))
    }

    /// `POST /generate { parsed_data, level, user_edit? } → { draft, parsed_data }`.
    pub async fn generate(&self, parsed: &ParsedItem, level: Level, user_edit: Option<&str>) -> EngineResult<String> {
        let resp: GenerateResponse = self
            .post_json(
                "/generate",
                json!({ "parsed_data": parsed, "level": level.as_u8(), "user_edit": user_edit }),
            )
            .await?;
        validate_level_marker(&resp.draft, level)?;
        Ok(resp.draft)
    }

    pub async fn research(&self, query: &str, max_results: u32) -> EngineResult<Vec<BookSearchResult>> {
        let resp: ResearchResponse =
            self.post_json("/research", json!({ "query": query, "max_results": max_results })).await?;
        Ok(resp.results)
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn research_generate(
        &self,
        book: &BookSearchResult,
        price_main: i64,
        format: Option<Format>,
        eta: Option<&str>,
        close_date: Option<&str>,
        min_order: Option<i64>,
        level: Level,
        user_edit: Option<&str>,
    ) -> EngineResult<String> {
        let resp: GenerateResponse = self
            .post_json(
                "/research/generate",
                json!({
                    "book": book,
                    "price_main": price_main,
                    "format": format.map(Format::as_str),
                    "eta": eta,
                    "close_date": close_date,
                    "min_order": min_order,
                    "level": level.as_u8(),
                    "user_edit": user_edit,
                }),
            )
            .await?;
        validate_level_marker(&resp.draft, level)?;
        Ok(resp.draft)
    }

    pub async fn research_enrich(&self, book_title: &str, current_description: &str, max_sources: u32) -> EngineResult<String> {
        let resp: EnrichResponse = self
            .post_json(
                "/research/enrich",
                json!({ "book_title": book_title, "current_description": current_description, "max_sources": max_sources }),
            )
            .await?;
        Ok(resp.enriched_description)
    }

    pub async fn search_images(&self, book_title: &str, max_images: u32) -> EngineResult<Vec<ImageCandidate>> {
        let resp: SearchImagesResponse = self
            .post_json("/research/search-images", json!({ "book_title": book_title, "max_images": max_images }))
            .await?;
        Ok(resp.images)
    }

    pub async fn search_links(&self, book_title: &str, max_links: u32) -> EngineResult<Vec<String>> {
        let resp: SearchLinksResponse = self
            .post_json("/research/search-links", json!({ "book_title": book_title, "max_links": max_links }))
            .await?;
        Ok(resp.links)
    }

    pub async fn display_title(&self, title: &str, source_url: Option<&str>, publisher: Option<&str>) -> EngineResult<String> {
        let resp: DisplayTitleResponse = self
            .post_json("/research/display-title", json!({ "title": title, "source_url": source_url, "publisher": publisher }))
            .await?;
        Ok(resp.display_title)
    }

    /// `POST /caption/analyze` multipart image → `CaptionAnalysis`.
    pub async fn caption_analyze(&self, image_bytes: Vec<u8>, file_name: &str) -> EngineResult<CaptionAnalysis> {
        let part = reqwest::multipart::Part::bytes(image_bytes).file_name(file_name.to_string());
        let form = reqwest::multipart::Form::new().part("image", part);
        let resp = self
            .http
            .post(self.url("/caption/analyze"))
            .multipart(form)
            .send()
            .await
            .map_err(EngineError::Network)?;
        if !resp.status().is_success() {
            return Err(EngineError::provider(format!("caption/analyze: {}", resp.status())));
        }
        resp.json::<CaptionAnalysis>().await.map_err(EngineError::Network)
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn caption_generate(
        &self,
        analysis: &CaptionAnalysis,
        price: i64,
        format: Option<Format>,
        eta: Option<&str>,
        close_date: Option<&str>,
        level: Level,
        preview_links: &[String],
    ) -> EngineResult<String> {
        let resp: GenerateResponse = self
            .post_json(
                "/caption/generate",
                json!({
                    "analysis": analysis,
                    "price": price,
                    "format": format.map(Format::as_str),
                    "eta": eta,
                    "close_date": close_date,
                    "level": level.as_u8(),
                    "preview_links": preview_links,
                }),
            )
            .await?;
        validate_level_marker(&resp.draft, level)?;
        Ok(resp.draft)
    }

    pub async fn get_markup(&self) -> EngineResult<i64> {
        #[derive(Deserialize)]
        struct Cfg {
            price_markup: i64,
        }
        let cfg: Cfg = self.get_json("/config").await?;
        Ok(cfg.price_markup)
    }

    pub async fn set_markup(&self, price_markup: i64) -> EngineResult<()> {
        let _: serde_json::Value = self.post_json("/config", json!({ "price_markup": price_markup })).await?;
        Ok(())
    }

    pub async fn health(&self) -> EngineResult<bool> {
        let resp = self.http.get(self.url("/health")).send().await.map_err(EngineError::Network)?;
        Ok(resp.status().is_success())
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(&self, path: &str) -> EngineResult<T> {
        let resp = self.http.get(self.url(path)).send().await.map_err(EngineError::Network)?;
        resp.json::<T>().await.map_err(EngineError::Network)
    }
}

/// Level 3 drafts must carry the configured Top-Pick marker line (spec
/// §3.4, §8 #6). The AI collaborator is contractually responsible for this;
/// the engine verifies it rather than trusting it blindly.
fn validate_level_marker(draft: &str, level: Level) -> EngineResult<()> {
    if level == Level::Urgent && !draft.contains(crate::config::TOP_PICK_MARKER) {
        return Err(EngineError::provider(
            "level-3 draft is missing the required Top Pick marker",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level3_draft_without_marker_is_rejected() {
        let err = validate_level_marker("some draft text", Level::Urgent).unwrap_err();
        assert!(err.to_string().contains("Top Pick"));
    }

    #[test]
    fn level3_draft_with_marker_passes() {
        let draft = format!("Great book!\n{}", crate::config::TOP_PICK_MARKER);
        assert!(validate_level_marker(&draft, Level::Urgent).is_ok());
    }

    #[test]
    fn level1_and_2_never_require_marker() {
        assert!(validate_level_marker("no marker here", Level::Informative).is_ok());
        assert!(validate_level_marker("no marker here", Level::Persuasive).is_ok());
    }
}
