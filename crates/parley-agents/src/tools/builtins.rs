use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parley_common::{Error, Result};
use reqwest::Client;
use serde_json::json;
use tokio::sync::RwLock;
use tracing::info;

use super::{Tool, ToolContext, ToolOutput};
use crate::providers::{ChatMessage, LlmProvider, LlmRequest, extract_text};

// ---------------------------------------------------------------------------
// GetWeather
// ---------------------------------------------------------------------------

/// Current conditions lookup via the Open-Meteo public API.
pub struct GetWeather {
    client: Client,
    base_url: String,
}

impl GetWeather {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
            base_url: "https://api.open-meteo.com/v1/forecast".to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: String) -> Self {
        self.base_url = base_url;
        self
    }
}

impl Default for GetWeather {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for GetWeather {
    fn name(&self) -> &str {
        "get_weather"
    }

    fn description(&self) -> &str {
        "Get the current weather and a short forecast for a location given its coordinates."
    }

    fn input_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "latitude": {"type": "number", "description": "Latitude of the location"},
                "longitude": {"type": "number", "description": "Longitude of the location"}
            },
            "required": ["latitude", "longitude"]
        })
    }

    async fn execute(&self, _context: &ToolContext, args: serde_json::Value) -> Result<ToolOutput> {
        let latitude = args["latitude"]
            .as_f64()
            .ok_or_else(|| Error::Agent("missing or invalid 'latitude' argument".to_string()))?;
        let longitude = args["longitude"]
            .as_f64()
            .ok_or_else(|| Error::Agent("missing or invalid 'longitude' argument".to_string()))?;

        let response = self
            .client
            .get(&self.base_url)
            .query(&[
                ("latitude", latitude.to_string()),
                ("longitude", longitude.to_string()),
                ("current", "temperature_2m,weather_code,wind_speed_10m".to_string()),
                ("daily", "temperature_2m_max,temperature_2m_min,sunrise,sunset".to_string()),
                ("timezone", "auto".to_string()),
            ])
            .send()
            .await
            .map_err(|e| Error::Agent(format!("weather request failed: {e}")))?;

        if !response.status().is_success() {
            return Ok(ToolOutput::error(format!(
                "weather service returned {}",
                response.status()
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| Error::Agent(format!("weather response read failed: {e}")))?;
        Ok(ToolOutput::ok(body))
    }
}

// ---------------------------------------------------------------------------
// WebSearch
// ---------------------------------------------------------------------------

/// Instant-answer search via the DuckDuckGo API.
pub struct WebSearch {
    client: Client,
    base_url: String,
}

impl WebSearch {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
            base_url: "https://api.duckduckgo.com".to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: String) -> Self {
        self.base_url = base_url;
        self
    }
}

impl Default for WebSearch {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for WebSearch {
    fn name(&self) -> &str {
        "web_search"
    }

    fn description(&self) -> &str {
        "Search the web and return a short summary of the top result for a query."
    }

    fn input_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "query": {"type": "string", "description": "The search query"}
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, _context: &ToolContext, args: serde_json::Value) -> Result<ToolOutput> {
        let query = args["query"]
            .as_str()
            .ok_or_else(|| Error::Agent("missing or invalid 'query' argument".to_string()))?;

        let response = self
            .client
            .get(&self.base_url)
            .query(&[("q", query), ("format", "json"), ("no_html", "1")])
            .send()
            .await
            .map_err(|e| Error::Agent(format!("search request failed: {e}")))?;

        if !response.status().is_success() {
            return Ok(ToolOutput::error(format!(
                "search service returned {}",
                response.status()
            )));
        }

        let raw: serde_json::Value = response
            .json()
            .await
            .map_err(|e| Error::Agent(format!("search response parse failed: {e}")))?;

        let abstract_text = raw["AbstractText"].as_str().unwrap_or_default();
        if abstract_text.is_empty() {
            return Ok(ToolOutput::ok(format!("no summary available for '{query}'")));
        }
        Ok(ToolOutput::ok(json!({
            "summary": abstract_text,
            "source": raw["AbstractURL"].as_str().unwrap_or_default(),
        })
        .to_string()))
    }
}

// ---------------------------------------------------------------------------
// Documents
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Document {
    pub id: String,
    pub title: String,
    pub kind: String,
    pub content: String,
    pub owner_id: String,
}

/// In-process document repository shared by the document tools.
#[derive(Default)]
pub struct DocumentStore {
    documents: RwLock<HashMap<String, Document>>,
}

impl DocumentStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn get(&self, id: &str) -> Option<Document> {
        self.documents.read().await.get(id).cloned()
    }

    pub async fn put(&self, document: Document) {
        self.documents
            .write()
            .await
            .insert(document.id.clone(), document);
    }
}

pub struct CreateDocument {
    store: Arc<DocumentStore>,
}

impl CreateDocument {
    pub fn new(store: Arc<DocumentStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Tool for CreateDocument {
    fn name(&self) -> &str {
        "create_document"
    }

    fn description(&self) -> &str {
        "Create a new document artifact (text, code, or sheet) the user can work on."
    }

    fn input_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "title": {"type": "string", "description": "Title for the document"},
                "kind": {
                    "type": "string",
                    "enum": ["text", "code", "sheet"],
                    "description": "Kind of document to create"
                }
            },
            "required": ["title", "kind"]
        })
    }

    async fn execute(&self, context: &ToolContext, args: serde_json::Value) -> Result<ToolOutput> {
        let title = args["title"]
            .as_str()
            .ok_or_else(|| Error::Agent("missing or invalid 'title' argument".to_string()))?;
        let kind = args["kind"]
            .as_str()
            .ok_or_else(|| Error::Agent("missing or invalid 'kind' argument".to_string()))?;
        if !matches!(kind, "text" | "code" | "sheet") {
            return Ok(ToolOutput::error(format!("unsupported document kind '{kind}'")));
        }

        let document = Document {
            id: uuid::Uuid::new_v4().to_string(),
            title: title.to_string(),
            kind: kind.to_string(),
            content: String::new(),
            owner_id: context.user_id.clone(),
        };
        let summary = json!({
            "id": document.id,
            "title": document.title,
            "kind": document.kind,
        });
        info!("created document {} for user {}", document.id, context.user_id);
        self.store.put(document).await;

        Ok(ToolOutput::ok(summary.to_string()))
    }
}

pub struct UpdateDocument {
    store: Arc<DocumentStore>,
}

impl UpdateDocument {
    pub fn new(store: Arc<DocumentStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Tool for UpdateDocument {
    fn name(&self) -> &str {
        "update_document"
    }

    fn description(&self) -> &str {
        "Update an existing document with new content based on a description of the change."
    }

    fn input_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "id": {"type": "string", "description": "Id of the document to update"},
                "content": {"type": "string", "description": "The full replacement content"}
            },
            "required": ["id", "content"]
        })
    }

    async fn execute(&self, context: &ToolContext, args: serde_json::Value) -> Result<ToolOutput> {
        let id = args["id"]
            .as_str()
            .ok_or_else(|| Error::Agent("missing or invalid 'id' argument".to_string()))?;
        let content = args["content"]
            .as_str()
            .ok_or_else(|| Error::Agent("missing or invalid 'content' argument".to_string()))?;

        let Some(mut document) = self.store.get(id).await else {
            return Ok(ToolOutput::error(format!("document '{id}' not found")));
        };
        if document.owner_id != context.user_id {
            return Ok(ToolOutput::error(format!("document '{id}' not found")));
        }

        document.content = content.to_string();
        self.store.put(document).await;
        Ok(ToolOutput::ok(json!({"id": id, "updated": true}).to_string()))
    }
}

// ---------------------------------------------------------------------------
// RequestSignature
// ---------------------------------------------------------------------------

/// Queues a signature request for a document. The actual e-sign delivery is
/// handled out of process; this tool records intent and returns a tracking id.
pub struct RequestSignature {
    store: Arc<DocumentStore>,
}

impl RequestSignature {
    pub fn new(store: Arc<DocumentStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Tool for RequestSignature {
    fn name(&self) -> &str {
        "request_signature"
    }

    fn description(&self) -> &str {
        "Request an electronic signature on a document from a named signer."
    }

    fn input_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "document_id": {"type": "string", "description": "Id of the document to sign"},
                "signer_email": {"type": "string", "description": "Email address of the signer"}
            },
            "required": ["document_id", "signer_email"]
        })
    }

    async fn execute(&self, _context: &ToolContext, args: serde_json::Value) -> Result<ToolOutput> {
        let document_id = args["document_id"]
            .as_str()
            .ok_or_else(|| Error::Agent("missing or invalid 'document_id' argument".to_string()))?;
        let signer = args["signer_email"]
            .as_str()
            .ok_or_else(|| Error::Agent("missing or invalid 'signer_email' argument".to_string()))?;
        if !signer.contains('@') {
            return Ok(ToolOutput::error(format!("'{signer}' is not a valid email address")));
        }

        if self.store.get(document_id).await.is_none() {
            return Ok(ToolOutput::error(format!("document '{document_id}' not found")));
        }

        let request_id = uuid::Uuid::new_v4().to_string();
        info!("signature request {request_id} queued for document {document_id}");
        Ok(ToolOutput::ok(
            json!({
                "request_id": request_id,
                "document_id": document_id,
                "signer": signer,
                "status": "pending",
            })
            .to_string(),
        ))
    }
}

// ---------------------------------------------------------------------------
// ExtractContractFields
// ---------------------------------------------------------------------------

/// Pulls structured fields out of a contract document with a one-shot model
/// call.
pub struct ExtractContractFields {
    store: Arc<DocumentStore>,
    provider: Arc<dyn LlmProvider>,
    model: String,
}

impl ExtractContractFields {
    pub fn new(store: Arc<DocumentStore>, provider: Arc<dyn LlmProvider>, model: String) -> Self {
        Self {
            store,
            provider,
            model,
        }
    }
}

#[async_trait]
impl Tool for ExtractContractFields {
    fn name(&self) -> &str {
        "extract_contract_fields"
    }

    fn description(&self) -> &str {
        "Extract the parties, effective date, term, and payment terms from a contract document."
    }

    fn input_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "document_id": {"type": "string", "description": "Id of the contract document"}
            },
            "required": ["document_id"]
        })
    }

    async fn execute(&self, _context: &ToolContext, args: serde_json::Value) -> Result<ToolOutput> {
        let document_id = args["document_id"]
            .as_str()
            .ok_or_else(|| Error::Agent("missing or invalid 'document_id' argument".to_string()))?;

        let Some(document) = self.store.get(document_id).await else {
            return Ok(ToolOutput::error(format!("document '{document_id}' not found")));
        };
        if document.content.is_empty() {
            return Ok(ToolOutput::error(format!("document '{document_id}' is empty")));
        }

        let request = LlmRequest {
            model: self.model.clone(),
            messages: vec![ChatMessage::user_text(document.content)],
            system: Some(
                "Extract the parties, effective date, term length, and payment terms from the \
                 contract. Respond with a single JSON object using the keys: parties, \
                 effective_date, term, payment_terms. Use null for anything absent."
                    .to_string(),
            ),
            max_tokens: Some(512),
            temperature: Some(0.0),
            tools: vec![],
        };

        let response = self.provider.complete(&request).await?;
        Ok(ToolOutput::ok(extract_text(&response.content)))
    }
}

// ---------------------------------------------------------------------------
// Image generation
// ---------------------------------------------------------------------------

/// Image generation through an OpenAI-compatible images endpoint. Registered
/// twice, once per quality tier.
pub struct GenerateImage {
    client: Client,
    api_key: Option<String>,
    base_url: String,
    hd: bool,
}

impl GenerateImage {
    pub fn standard(api_key: Option<String>) -> Self {
        Self {
            client: Client::new(),
            api_key,
            base_url: "https://api.openai.com/v1".to_string(),
            hd: false,
        }
    }

    pub fn hd(api_key: Option<String>) -> Self {
        Self {
            hd: true,
            ..Self::standard(api_key)
        }
    }

    pub fn with_base_url(mut self, base_url: String) -> Self {
        self.base_url = base_url;
        self
    }
}

#[async_trait]
impl Tool for GenerateImage {
    fn name(&self) -> &str {
        if self.hd { "generate_image_hd" } else { "generate_image" }
    }

    fn description(&self) -> &str {
        if self.hd {
            "Generate a high-quality image from a text prompt. Slower and more expensive."
        } else {
            "Generate an image from a text prompt."
        }
    }

    fn input_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "prompt": {"type": "string", "description": "Description of the image to generate"}
            },
            "required": ["prompt"]
        })
    }

    async fn execute(&self, _context: &ToolContext, args: serde_json::Value) -> Result<ToolOutput> {
        let prompt = args["prompt"]
            .as_str()
            .ok_or_else(|| Error::Agent("missing or invalid 'prompt' argument".to_string()))?;

        let Some(api_key) = &self.api_key else {
            return Ok(ToolOutput::error("image generation is not configured"));
        };

        let body = json!({
            "model": "dall-e-3",
            "prompt": prompt,
            "n": 1,
            "quality": if self.hd { "hd" } else { "standard" },
            "size": "1024x1024",
        });

        let response = self
            .client
            .post(format!("{}/images/generations", self.base_url))
            .header("Authorization", format!("Bearer {api_key}"))
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Agent(format!("image request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Ok(ToolOutput::error(format!(
                "image service returned {status}: {error_text}"
            )));
        }

        let raw: serde_json::Value = response
            .json()
            .await
            .map_err(|e| Error::Agent(format!("image response parse failed: {e}")))?;
        let url = raw["data"][0]["url"].as_str().unwrap_or_default();
        Ok(ToolOutput::ok(json!({"url": url}).to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> ToolContext {
        ToolContext {
            conversation_id: "c1".to_string(),
            user_id: "u1".to_string(),
            workspace_id: "ws-1".to_string(),
        }
    }

    #[tokio::test]
    async fn create_then_update_document() {
        let store = DocumentStore::new();
        let create = CreateDocument::new(Arc::clone(&store));
        let update = UpdateDocument::new(Arc::clone(&store));

        let out = create
            .execute(&context(), json!({"title": "Notes", "kind": "text"}))
            .await
            .unwrap();
        assert!(!out.is_error);
        let created: serde_json::Value = serde_json::from_str(&out.content).unwrap();
        let id = created["id"].as_str().unwrap();

        let out = update
            .execute(&context(), json!({"id": id, "content": "hello"}))
            .await
            .unwrap();
        assert!(!out.is_error);
        assert_eq!(store.get(id).await.unwrap().content, "hello");
    }

    #[tokio::test]
    async fn update_rejects_foreign_documents() {
        let store = DocumentStore::new();
        store
            .put(Document {
                id: "d1".to_string(),
                title: "t".to_string(),
                kind: "text".to_string(),
                content: String::new(),
                owner_id: "someone-else".to_string(),
            })
            .await;

        let update = UpdateDocument::new(Arc::clone(&store));
        let out = update
            .execute(&context(), json!({"id": "d1", "content": "x"}))
            .await
            .unwrap();
        assert!(out.is_error);
        assert_eq!(store.get("d1").await.unwrap().content, "");
    }

    #[tokio::test]
    async fn signature_request_validates_email_and_document() {
        let store = DocumentStore::new();
        let tool = RequestSignature::new(Arc::clone(&store));

        let out = tool
            .execute(
                &context(),
                json!({"document_id": "d1", "signer_email": "not-an-email"}),
            )
            .await
            .unwrap();
        assert!(out.is_error);

        let out = tool
            .execute(
                &context(),
                json!({"document_id": "missing", "signer_email": "a@b.com"}),
            )
            .await
            .unwrap();
        assert!(out.is_error);
    }

    #[tokio::test]
    async fn image_generation_without_key_reports_unconfigured() {
        let tool = GenerateImage::standard(None);
        let out = tool
            .execute(&context(), json!({"prompt": "a fjord at dawn"}))
            .await
            .unwrap();
        assert!(out.is_error);
        assert!(out.content.contains("not configured"));
    }

    #[test]
    fn quality_tiers_have_distinct_names() {
        assert_eq!(GenerateImage::standard(None).name(), "generate_image");
        assert_eq!(GenerateImage::hd(None).name(), "generate_image_hd");
    }
}
