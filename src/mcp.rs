use std::{collections::HashSet, sync::Arc};

use rmcp::{
    ServerHandler,
    ServiceExt,
    handler::server::{router::tool::ToolRouter, wrapper::Parameters},
    model::{
        CallToolResult,
        Content,
        Implementation,
        ServerCapabilities,
        ServerInfo,
    },
    tool,
    tool_handler,
    tool_router,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::{
    doc_id::DocumentId,
    error::{self, Error},
    knowledge_base::KnowledgeBase,
};

const SNIPPET_MAX_CHARS: usize = 400;

struct KnowbaseState {
    kb: KnowledgeBase,
    default_limit: usize,
}

#[derive(Clone)]
pub struct KnowbaseMcpServer {
    state: Arc<KnowbaseState>,
    tool_router: ToolRouter<Self>,
}

impl KnowbaseMcpServer {
    pub fn new(kb: KnowledgeBase, default_limit: usize) -> Self {
        Self {
            state: Arc::new(KnowbaseState { kb, default_limit }),
            tool_router: Self::tool_router(),
        }
    }

    /// Run a knowledge-base call off the async runtime; embedding and
    /// persistence block.
    async fn blocking<T, F>(
        &self,
        what: &str,
        f: F,
    ) -> Result<T, rmcp::ErrorData>
    where
        T: Send + 'static,
        F: FnOnce(&KnowledgeBase) -> error::Result<T> + Send + 'static,
    {
        let state = Arc::clone(&self.state);
        tokio::task::spawn_blocking(move || f(&state.kb))
            .await
            .map_err(|e| mcp_error(what, e))?
            .map_err(|e| tool_error(what, e))
    }
}

#[tool_router(router = tool_router)]
impl KnowbaseMcpServer {
    /// Semantic search over the knowledge base.
    #[tool(
        name = "knowbase_search",
        description = "Find the passages most relevant to a query. Optionally restrict to specific document ids."
    )]
    pub async fn knowbase_search(
        &self,
        params: Parameters<SearchParams>,
    ) -> Result<CallToolResult, rmcp::ErrorData> {
        let params = params.0;
        let limit = params.limit.unwrap_or(self.state.default_limit);
        let filter = params
            .doc_ids
            .map(|ids| parse_ids(&ids))
            .transpose()?;

        let query = params.query.clone();
        let results = self
            .blocking("search failed", move |kb| {
                kb.search(&query, limit, filter.as_ref())
            })
            .await?;

        let items: Vec<SearchResultItem> = results
            .into_iter()
            .map(|r| SearchResultItem {
                doc_id: r.metadata.doc_id.to_string(),
                doc_name: r.metadata.doc_name,
                chunk_id: r.metadata.chunk_id,
                title: r.metadata.title,
                score: r.score,
                content: r.content,
            })
            .collect();

        let summary = format_search_summary(&items, &params.query);
        tool_result(
            summary,
            SearchResponse {
                query: params.query,
                result_count: items.len(),
                results: items,
            },
        )
    }

    /// List every document in the knowledge base.
    #[tool(
        name = "knowbase_list_documents",
        description = "List the documents in the knowledge base with their ids and chunk counts."
    )]
    pub async fn knowbase_list_documents(
        &self,
    ) -> Result<CallToolResult, rmcp::ErrorData> {
        let documents = self
            .blocking("listing failed", |kb| Ok(kb.list_documents()))
            .await?;

        let items: Vec<DocumentItem> = documents
            .into_values()
            .map(|d| DocumentItem {
                doc_id: d.doc_id.to_string(),
                name: d.name,
                added_at: d.added_at,
                chunk_count: d.chunk_count,
            })
            .collect();

        let summary = if items.is_empty() {
            "The knowledge base is empty".to_string()
        } else {
            let mut lines = vec![format!("{} document(s):", items.len())];
            lines.extend(items.iter().map(|d| {
                format!("{} {} ({} chunks)", d.doc_id, d.name, d.chunk_count)
            }));
            lines.join("\n")
        };
        tool_result(summary, json!({ "documents": items }))
    }

    /// Add a text document.
    #[tool(
        name = "knowbase_add_document",
        description = "Add a text document to the knowledge base. It is chunked and embedded immediately."
    )]
    pub async fn knowbase_add_document(
        &self,
        params: Parameters<AddDocumentParams>,
    ) -> Result<CallToolResult, rmcp::ErrorData> {
        let AddDocumentParams { name, text } = params.0;
        let doc = self
            .blocking("add failed", move |kb| kb.add(&name, &text))
            .await?;

        tool_result(
            format!("Added {} {} ({} chunks)", doc.doc_id, doc.name, doc.chunk_count),
            json!({
                "docId": doc.doc_id.to_string(),
                "name": doc.name,
                "chunkCount": doc.chunk_count,
            }),
        )
    }

    /// Remove a document and rebuild the index.
    #[tool(
        name = "knowbase_remove_document",
        description = "Remove a document by id. The index is rebuilt, which re-embeds every remaining chunk."
    )]
    pub async fn knowbase_remove_document(
        &self,
        params: Parameters<RemoveDocumentParams>,
    ) -> Result<CallToolResult, rmcp::ErrorData> {
        let doc_id = parse_id(&params.0.doc_id)?;
        self.blocking("remove failed", move |kb| kb.remove_document(doc_id))
            .await?;

        tool_result(
            format!("Removed {doc_id}"),
            json!({ "docId": doc_id.to_string(), "removed": true }),
        )
    }
}

#[tool_handler(router = self.tool_router)]
impl ServerHandler for KnowbaseMcpServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo::new(ServerCapabilities::builder().enable_tools().build())
            .with_server_info(
                Implementation::new("knowbase", env!("CARGO_PKG_VERSION"))
                    .with_title("knowbase MCP"),
            )
            .with_instructions(
                "Use knowbase_search to retrieve passages relevant to a question. Use knowbase_list_documents to find document ids for filtering.",
            )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SearchParams {
    /// Search query string.
    pub query: String,
    /// Maximum number of results.
    pub limit: Option<usize>,
    /// Only return passages from these document ids (e.g. "#00002a").
    pub doc_ids: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AddDocumentParams {
    /// Display name of the document.
    pub name: String,
    /// Full text of the document.
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RemoveDocumentParams {
    /// Id of the document to remove (e.g. "#00002a").
    pub doc_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SearchResponse {
    query: String,
    result_count: usize,
    results: Vec<SearchResultItem>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SearchResultItem {
    doc_id: String,
    doc_name: String,
    chunk_id: usize,
    title: String,
    score: f32,
    content: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DocumentItem {
    doc_id: String,
    name: String,
    added_at: u64,
    chunk_count: usize,
}

fn format_search_summary(results: &[SearchResultItem], query: &str) -> String {
    if results.is_empty() {
        return format!("No results found for \"{query}\"");
    }

    let mut lines = Vec::with_capacity(results.len() + 1);
    let suffix = if results.len() == 1 { "" } else { "s" };
    lines.push(format!(
        "Found {} result{} for \"{query}\":",
        results.len(),
        suffix
    ));

    for item in results {
        lines.push(format!(
            "{} {:.3} {} / {}\n{}",
            item.doc_id,
            item.score,
            item.doc_name,
            item.title,
            snippet(&item.content)
        ));
    }

    lines.join("\n")
}

fn snippet(content: &str) -> String {
    match content.char_indices().nth(SNIPPET_MAX_CHARS) {
        Some((cut, _)) => format!("{}...", &content[..cut]),
        None => content.to_string(),
    }
}

fn parse_id(raw: &str) -> Result<DocumentId, rmcp::ErrorData> {
    raw.parse()
        .map_err(|e: Error| rmcp::ErrorData::invalid_params(e.to_string(), None))
}

fn parse_ids(raw: &[String]) -> Result<HashSet<DocumentId>, rmcp::ErrorData> {
    raw.iter().map(|s| parse_id(s)).collect()
}

fn tool_result(
    summary: String,
    structured: impl Serialize,
) -> Result<CallToolResult, rmcp::ErrorData> {
    let structured = serde_json::to_value(structured)
        .map_err(|e| mcp_error("failed to serialize result", e))?;
    let mut result = CallToolResult::success(vec![Content::text(summary)]);
    result.structured_content = Some(structured);
    Ok(result)
}

/// Caller mistakes become invalid-params errors; everything else is internal.
fn tool_error(message: &str, error: Error) -> rmcp::ErrorData {
    match error {
        Error::UnknownDocument(_)
        | Error::EmptyDocument { .. }
        | Error::Config(_) => rmcp::ErrorData::invalid_params(
            format!("{message}: {error}"),
            None,
        ),
        other => mcp_error(message, other),
    }
}

fn mcp_error(message: &str, error: impl std::fmt::Display) -> rmcp::ErrorData {
    rmcp::ErrorData::internal_error(
        message.to_string(),
        Some(json!({ "error": error.to_string() })),
    )
}

pub fn run_mcp(kb: KnowledgeBase, default_limit: usize) -> error::Result<()> {
    let server = KnowbaseMcpServer::new(kb, default_limit);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| {
            error::Error::Config(format!("failed to start tokio runtime: {e}"))
        })?;

    runtime.block_on(async move {
        let transport = rmcp::transport::stdio();
        let running = server.serve(transport).await.map_err(|e| {
            error::Error::Config(format!(
                "MCP server initialization failed: {e}"
            ))
        })?;
        running.waiting().await.map_err(|e| {
            error::Error::Config(format!("MCP server error: {e}"))
        })?;
        Ok(())
    })
}
