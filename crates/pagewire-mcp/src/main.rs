use anyhow::Result;
use clap::{Parser, Subcommand};
use pagewire_core::{FetchRequest, RenderOptions, SearchRequest, DEFAULT_RESULT_LIMIT};
use pagewire_local::{fetch::FetchPipeline, search::DuckDuckGoSearch, Settings};

#[derive(Parser, Debug)]
#[command(name = "pagewire")]
#[command(about = "Page fetch, web search and notes for agents (MCP stdio server)", long_about = None)]
struct Cli {
    /// Log filter (overrides RUST_LOG), e.g. `debug` or `pagewire_local=trace`.
    #[arg(long, global = true, env = "PAGEWIRE_LOG")]
    log_level: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run as an MCP stdio server (for MCP clients).
    #[cfg(feature = "stdio")]
    McpStdio,
    /// Fetch one URL and print it as readable text.
    Fetch(FetchCmd),
    /// Search the web and print the results as JSON.
    Search(SearchCmd),
    /// Print version info.
    Version(VersionCmd),
}

#[derive(clap::Args, Debug)]
struct FetchCmd {
    url: String,
    /// Skip the headless browser and issue a plain GET.
    #[arg(long)]
    no_render: bool,
    /// Extra browser launch flags, whitespace separated (e.g. "--no-sandbox --lang=en").
    #[arg(long, allow_hyphen_values = true)]
    flags: Option<String>,
    /// Run the browser headless (default: PAGEWIRE_RENDER_HEADLESS).
    #[arg(long)]
    headless: bool,
    /// Print the page markup instead of normalized text.
    #[arg(long)]
    raw: bool,
    /// Also drop nav/header/footer before normalizing.
    #[arg(long)]
    drop_chrome: bool,
}

#[derive(clap::Args, Debug)]
struct SearchCmd {
    query: String,
    /// Maximum number of results.
    #[arg(short = 'n', long, default_value_t = DEFAULT_RESULT_LIMIT)]
    num_results: usize,
}

#[derive(clap::Args, Debug)]
struct VersionCmd {
    /// Output format. Allowed: json, text
    #[arg(long = "output", default_value = "json")]
    output: String,
}

/// Load `KEY=VALUE` lines from `path` into the process env.
///
/// Blank lines and `#` comments are skipped; variables already set in the environment win.
/// Returns how many variables were set.
fn load_env_file(path: &std::path::Path) -> std::io::Result<usize> {
    let txt = std::fs::read_to_string(path)?;
    let mut n = 0;
    for raw in txt.lines() {
        let s = raw.trim();
        if s.is_empty() || s.starts_with('#') {
            continue;
        }
        let s = s.strip_prefix("export ").unwrap_or(s);
        let Some((k, v)) = s.split_once('=') else {
            continue;
        };
        let k = k.trim();
        let v = v.trim().trim_matches('"');
        if k.is_empty() {
            continue;
        }
        if std::env::var_os(k).is_none() {
            std::env::set_var(k, v);
            n += 1;
        }
    }
    Ok(n)
}

fn init_tracing(level: Option<&str>) {
    let filter = match level.map(str::trim).filter(|s| !s.is_empty()) {
        Some(l) => tracing_subscriber::EnvFilter::new(l),
        None => tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "info".into()),
    };
    // stdout belongs to the protocol in mcp-stdio mode.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .try_init();
}

fn fetch_request(cmd: &FetchCmd, settings: &Settings) -> FetchRequest {
    FetchRequest {
        url: cmd.url.clone(),
        use_rendered_retrieval: !cmd.no_render,
        renderer_flags: RenderOptions::split_flags(cmd.flags.as_deref().unwrap_or("")),
        render_headless: cmd.headless || settings.render_headless,
        return_raw: cmd.raw,
    }
}

#[cfg(feature = "stdio")]
mod mcp {
    use super::*;
    use pagewire_core::{SearchProvider, ToolReply};
    use pagewire_local::notes::{Note, NoteStore, NOTE_MIME_TYPE, SUMMARIZE_PROMPT};
    use pagewire_local::search::search_reply;
    use rmcp::{
        handler::server::router::tool::ToolRouter as RmcpToolRouter,
        handler::server::wrapper::Parameters,
        model::{
            AnnotateAble, CallToolResult, GetPromptRequestParam, GetPromptResult,
            ListPromptsResult, ListResourcesResult, PaginatedRequestParam, Prompt,
            PromptArgument, PromptMessage, PromptMessageRole, RawResource,
            ReadResourceRequestParam, ReadResourceResult, Resource, ResourceContents,
            ServerCapabilities, ServerInfo,
        },
        service::RequestContext,
        tool, tool_handler, tool_router,
        transport::stdio,
        ErrorData as McpError, RoleServer, ServiceExt,
    };
    use schemars::JsonSchema;
    use serde::Deserialize;
    use std::sync::Arc;

    #[path = "reply.rs"]
    mod reply;
    use reply::{call_result, mcp_error, tool_error};

    #[derive(Debug, Deserialize, JsonSchema, Default)]
    #[serde(rename_all = "camelCase")]
    struct FetchUrlArgs {
        /// Absolute http(s) URL to fetch.
        #[serde(default)]
        url: Option<String>,
        /// Render with a headless browser first, falling back to a plain GET (default true).
        #[serde(default)]
        use_puppeteer: Option<bool>,
        /// Extra browser launch flags, whitespace separated.
        #[serde(default)]
        puppeteer_flags: Option<String>,
        /// Hide the browser window (default from server config, normally false).
        #[serde(default)]
        puppeteer_headless: Option<bool>,
        /// Return the page markup instead of normalized text (default false).
        #[serde(default)]
        raw: Option<bool>,
    }

    #[derive(Debug, Deserialize, JsonSchema, Default)]
    struct FetchUrlPuppeteerArgs {
        /// Absolute http(s) URL to fetch.
        #[serde(default)]
        url: Option<String>,
    }

    #[derive(Debug, Deserialize, JsonSchema, Default)]
    struct DuckDuckGoSearchArgs {
        #[serde(default)]
        query: Option<String>,
        /// Maximum number of results (default 5).
        #[serde(default)]
        num_results: Option<usize>,
    }

    #[derive(Debug, Deserialize, JsonSchema, Default)]
    struct CreateNoteArgs {
        #[serde(default)]
        title: Option<String>,
        #[serde(default)]
        content: Option<String>,
    }

    #[derive(Clone)]
    pub(crate) struct PagewireMcp {
        tool_router: RmcpToolRouter<Self>,
        pipeline: FetchPipeline,
        search: Arc<dyn SearchProvider>,
        notes: NoteStore,
        render_headless: bool,
    }

    #[tool_router]
    impl PagewireMcp {
        pub(crate) fn new(settings: &Settings) -> Result<Self, McpError> {
            let pipeline = FetchPipeline::from_settings(settings).map_err(mcp_error)?;
            let search = DuckDuckGoSearch::from_settings(settings).map_err(mcp_error)?;
            Ok(Self::with_parts(
                pipeline,
                Arc::new(search),
                NoteStore::new(),
                settings.render_headless,
            ))
        }

        pub(crate) fn with_parts(
            pipeline: FetchPipeline,
            search: Arc<dyn SearchProvider>,
            notes: NoteStore,
            render_headless: bool,
        ) -> Self {
            Self {
                tool_router: Self::tool_router(),
                pipeline,
                search,
                notes,
                render_headless,
            }
        }

        fn fetch_request(&self, url: Option<String>) -> FetchRequest {
            let mut req = FetchRequest::new(url.unwrap_or_default());
            req.render_headless = self.render_headless;
            req
        }

        async fn run_fetch(&self, req: FetchRequest) -> Result<CallToolResult, McpError> {
            match self.pipeline.fetch(&req).await {
                Ok(reply) => Ok(call_result(reply)),
                Err(e) => tool_error(e),
            }
        }

        #[tool(
            description = "Fetch a web page and return it as readable text. Renders with a headless browser first (usePuppeteer, default true) and falls back to a plain GET."
        )]
        async fn fetch_url(
            &self,
            params: Parameters<Option<FetchUrlArgs>>,
        ) -> Result<CallToolResult, McpError> {
            let args = params.0.unwrap_or_default();
            let mut req = self.fetch_request(args.url);
            if let Some(v) = args.use_puppeteer {
                req.use_rendered_retrieval = v;
            }
            if let Some(flags) = args.puppeteer_flags.as_deref() {
                req.renderer_flags = RenderOptions::split_flags(flags);
            }
            if let Some(v) = args.puppeteer_headless {
                req.render_headless = v;
            }
            req.return_raw = args.raw.unwrap_or(false);
            self.run_fetch(req).await
        }

        #[tool(
            description = "Fetch a web page with the headless browser (plain GET fallback) and return readable text."
        )]
        async fn fetch_url_puppeteer(
            &self,
            params: Parameters<Option<FetchUrlPuppeteerArgs>>,
        ) -> Result<CallToolResult, McpError> {
            let args = params.0.unwrap_or_default();
            let mut req = self.fetch_request(args.url);
            req.use_rendered_retrieval = true;
            self.run_fetch(req).await
        }

        #[tool(
            description = "Search the web via DuckDuckGo. Returns a JSON array of {title, url, description}."
        )]
        async fn duckduckgo_search(
            &self,
            params: Parameters<Option<DuckDuckGoSearchArgs>>,
        ) -> Result<CallToolResult, McpError> {
            let args = params.0.unwrap_or_default();
            let req = SearchRequest::new(args.query.unwrap_or_default())
                .with_limit(args.num_results.unwrap_or(DEFAULT_RESULT_LIMIT));
            match search_reply(self.search.as_ref(), &req).await {
                Ok(reply) => Ok(call_result(reply)),
                Err(e) => tool_error(e),
            }
        }

        #[tool(description = "Create a note. Notes are readable as note:///<id> resources.")]
        async fn create_note(
            &self,
            params: Parameters<Option<CreateNoteArgs>>,
        ) -> Result<CallToolResult, McpError> {
            let args = params.0.unwrap_or_default();
            let note = self
                .notes
                .create(
                    args.title.as_deref().unwrap_or(""),
                    args.content.as_deref().unwrap_or(""),
                )
                .map_err(mcp_error)?;
            Ok(call_result(ToolReply::text(format!(
                "Added note '{}' with id {} ({})",
                note.title,
                note.id,
                note.uri()
            ))))
        }
    }

    fn note_resource(note: &Note) -> Resource {
        let mut raw = RawResource::new(note.uri(), format!("Note: {}", note.title));
        raw.description = Some(format!("A note titled {}", note.title));
        raw.mime_type = Some(NOTE_MIME_TYPE.to_string());
        raw.no_annotation()
    }

    fn summarize_prompt() -> Prompt {
        Prompt::new(
            SUMMARIZE_PROMPT,
            Some("Summarize all current notes"),
            Some(vec![PromptArgument {
                name: "style".to_string(),
                title: None,
                description: Some("brief (default) or detailed".to_string()),
                required: Some(false),
            }]),
        )
    }

    #[tool_handler]
    impl rmcp::ServerHandler for PagewireMcp {
        fn get_info(&self) -> ServerInfo {
            ServerInfo {
                instructions: Some(
                    "Fetch pages as readable text, search the web, and keep notes (exposed as note:/// resources)."
                        .to_string(),
                ),
                capabilities: ServerCapabilities::builder()
                    .enable_prompts()
                    .enable_resources()
                    .enable_tools()
                    .build(),
                ..Default::default()
            }
        }

        async fn list_resources(
            &self,
            _request: Option<PaginatedRequestParam>,
            _context: RequestContext<RoleServer>,
        ) -> Result<ListResourcesResult, McpError> {
            let resources = self.notes.list().iter().map(note_resource).collect();
            Ok(ListResourcesResult::with_all_items(resources))
        }

        async fn read_resource(
            &self,
            request: ReadResourceRequestParam,
            _context: RequestContext<RoleServer>,
        ) -> Result<ReadResourceResult, McpError> {
            let note = self.notes.read_uri(&request.uri).map_err(mcp_error)?;
            let mut contents = ResourceContents::text(note.content, request.uri);
            if let ResourceContents::TextResourceContents { mime_type, .. } = &mut contents {
                *mime_type = Some(NOTE_MIME_TYPE.to_string());
            }
            Ok(ReadResourceResult {
                contents: vec![contents],
            })
        }

        async fn list_prompts(
            &self,
            _request: Option<PaginatedRequestParam>,
            _context: RequestContext<RoleServer>,
        ) -> Result<ListPromptsResult, McpError> {
            Ok(ListPromptsResult::with_all_items(vec![summarize_prompt()]))
        }

        async fn get_prompt(
            &self,
            request: GetPromptRequestParam,
            _context: RequestContext<RoleServer>,
        ) -> Result<GetPromptResult, McpError> {
            let style = request
                .arguments
                .as_ref()
                .and_then(|a| a.get("style"))
                .and_then(|v| v.as_str());
            let text = self
                .notes
                .render_prompt(&request.name, style)
                .map_err(mcp_error)?;
            Ok(GetPromptResult {
                description: Some("Summarize the current notes".to_string()),
                messages: vec![PromptMessage::new_text(PromptMessageRole::User, text)],
            })
        }
    }

    pub(crate) async fn serve_stdio(settings: &Settings) -> Result<(), McpError> {
        let svc = PagewireMcp::new(settings)?;
        tracing::info!(version = env!("CARGO_PKG_VERSION"), "mcp stdio server starting");
        let running = svc
            .serve(stdio())
            .await
            .map_err(|e| McpError::internal_error(e.to_string(), None))?;
        // Keep the stdio server alive until the client closes.
        running
            .waiting()
            .await
            .map_err(|e| McpError::internal_error(e.to_string(), None))?;
        Ok(())
    }

}

#[tokio::main]
async fn main() -> Result<()> {
    // Opt-in env file: MCP hosts rarely run servers from an interactive shell.
    if let Ok(p) = std::env::var("PAGEWIRE_ENV_FILE") {
        let p = p.trim();
        if !p.is_empty() {
            // Logging isn't up yet; a missing file is not fatal.
            if let Err(e) = load_env_file(std::path::Path::new(p)) {
                eprintln!("pagewire: could not read PAGEWIRE_ENV_FILE {p}: {e}");
            }
        }
    }

    let cli = Cli::parse();
    init_tracing(cli.log_level.as_deref());
    let settings = Settings::from_env();

    match cli.command {
        #[cfg(feature = "stdio")]
        Commands::McpStdio => {
            mcp::serve_stdio(&settings)
                .await
                .map_err(|e| anyhow::anyhow!(e.to_string()))?;
        }
        Commands::Fetch(cmd) => {
            let mut settings = settings;
            settings.drop_chrome |= cmd.drop_chrome;
            let pipeline = FetchPipeline::from_settings(&settings)?;
            let reply = pipeline.fetch(&fetch_request(&cmd, &settings)).await?;
            if reply.is_error {
                eprintln!("{}", reply.first_text());
                std::process::exit(1);
            }
            println!("{}", reply.first_text());
        }
        Commands::Search(cmd) => {
            let provider = DuckDuckGoSearch::from_settings(&settings)?;
            let req = SearchRequest::new(cmd.query).with_limit(cmd.num_results);
            let reply = pagewire_local::search::search_reply(&provider, &req).await?;
            if reply.is_error {
                eprintln!("{}", reply.first_text());
                std::process::exit(1);
            }
            println!("{}", reply.first_text());
        }
        Commands::Version(args) => {
            let v = serde_json::json!({
                "name": "pagewire",
                "version": env!("CARGO_PKG_VERSION"),
            });
            match args.output.to_ascii_lowercase().as_str() {
                "text" => println!("pagewire {}", env!("CARGO_PKG_VERSION")),
                _ => println!("{}", v),
            }
        }
    }
    Ok(())
}
