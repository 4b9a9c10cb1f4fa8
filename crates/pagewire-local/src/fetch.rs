//! Fetch orchestration: rendered retrieval first (when asked), direct retrieval as the
//! fallback, then normalization.

use crate::normalize::{normalize_with, NormalizeOptions};
use pagewire_core::{
    Error, FetchRequest, PageRenderer, RawFetcher, RenderOptions, Result, ToolReply, WaitPolicy,
};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Rendered,
    Direct,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Rendered => "rendered",
            Self::Direct => "direct",
        }
    }
}

#[derive(Debug)]
pub struct StageFailure {
    pub stage: Stage,
    pub error: Error,
}

impl StageFailure {
    fn describe(&self) -> String {
        match self.stage {
            Stage::Rendered => format!(
                "rendered retrieval failed (see prior log): {}",
                self.error.message()
            ),
            Stage::Direct => format!("direct retrieval failed: {}", self.error.message()),
        }
    }
}

/// What happened across the stages of one fetch.
#[derive(Debug)]
pub enum FetchOutcome {
    Page {
        stage: Stage,
        html: String,
        /// Earlier stages that failed before this one succeeded.
        failures: Vec<StageFailure>,
    },
    Failed { failures: Vec<StageFailure> },
}

impl FetchOutcome {
    pub fn failures(&self) -> &[StageFailure] {
        match self {
            Self::Page { failures, .. } | Self::Failed { failures } => failures,
        }
    }

    /// Human-readable summary of every failed stage, in order.
    pub fn failure_text(&self) -> String {
        self.failures()
            .iter()
            .map(StageFailure::describe)
            .collect::<Vec<_>>()
            .join("; ")
    }
}

#[derive(Clone)]
pub struct FetchPipeline {
    renderer: Arc<dyn PageRenderer>,
    direct: Arc<dyn RawFetcher>,
    wait: WaitPolicy,
    render_timeout_ms: u64,
    normalize: NormalizeOptions,
}

impl FetchPipeline {
    pub fn new(renderer: Arc<dyn PageRenderer>, direct: Arc<dyn RawFetcher>) -> Self {
        let defaults = RenderOptions::default();
        Self {
            renderer,
            direct,
            wait: defaults.wait,
            render_timeout_ms: defaults.timeout_ms,
            normalize: NormalizeOptions::default(),
        }
    }

    pub fn with_render_policy(mut self, wait: WaitPolicy, timeout_ms: u64) -> Self {
        self.wait = wait;
        self.render_timeout_ms = timeout_ms;
        self
    }

    pub fn with_normalize_options(mut self, opts: NormalizeOptions) -> Self {
        self.normalize = opts;
        self
    }

    pub fn from_settings(settings: &crate::Settings) -> Result<Self> {
        let renderer = crate::render::PuppeteerRenderer::from_settings(settings);
        let direct = crate::DirectFetcher::from_settings(settings)?;
        Ok(Self::new(Arc::new(renderer), Arc::new(direct))
            .with_render_policy(settings.render_wait, settings.render_timeout_ms)
            .with_normalize_options(settings.normalize_options()))
    }

    fn render_options(&self, req: &FetchRequest) -> RenderOptions {
        RenderOptions {
            headless: req.render_headless,
            args: req.renderer_flags.clone(),
            wait: self.wait,
            timeout_ms: self.render_timeout_ms,
        }
    }

    /// Run the stages without normalizing. Only validation errors are returned as `Err`;
    /// every reachability problem ends up inside the outcome.
    pub async fn retrieve(&self, req: &FetchRequest) -> Result<FetchOutcome> {
        let url = req.validate()?;
        let url = url.as_str();
        let mut failures = Vec::new();

        if req.use_rendered_retrieval {
            match self.renderer.render(url, &self.render_options(req)).await {
                Ok(html) => {
                    tracing::info!(url, stage = "rendered", "page retrieved");
                    return Ok(FetchOutcome::Page {
                        stage: Stage::Rendered,
                        html,
                        failures,
                    });
                }
                Err(error) => {
                    tracing::warn!(url, error = %error, "rendered retrieval failed, falling back to direct");
                    failures.push(StageFailure {
                        stage: Stage::Rendered,
                        error,
                    });
                }
            }
        }

        match self.direct.fetch_raw(url).await {
            Ok(html) => {
                tracing::info!(url, stage = "direct", "page retrieved");
                Ok(FetchOutcome::Page {
                    stage: Stage::Direct,
                    html,
                    failures,
                })
            }
            Err(error) => {
                tracing::warn!(url, error = %error, "direct retrieval failed");
                failures.push(StageFailure {
                    stage: Stage::Direct,
                    error,
                });
                Ok(FetchOutcome::Failed { failures })
            }
        }
    }

    /// Retrieve and normalize into a single content block, or an error-flagged block naming
    /// the failed stages.
    pub async fn fetch(&self, req: &FetchRequest) -> Result<ToolReply> {
        let outcome = self.retrieve(req).await?;
        Ok(match outcome {
            FetchOutcome::Page { html, .. } => {
                ToolReply::text(normalize_with(&html, req.return_raw, &self.normalize))
            }
            failed @ FetchOutcome::Failed { .. } => ToolReply::error(format!(
                "Failed to fetch {}: {}",
                req.url.trim(),
                failed.failure_text()
            )),
        })
    }
}
