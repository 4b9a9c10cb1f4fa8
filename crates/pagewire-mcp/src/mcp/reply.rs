use pagewire_core::{ContentBlock, Error as PagewireError, ToolReply};
use rmcp::{
    model::{CallToolResult, Content},
    ErrorData as McpError,
};

/// Operator-facing advice appended to recoverable failures.
pub(crate) fn error_hint(e: &PagewireError) -> Option<&'static str> {
    match e {
        PagewireError::NotConfigured(_) => Some(
            "Rendered retrieval needs Node.js with the `puppeteer` package. Install it (npm i puppeteer), point PAGEWIRE_NODE_PATH at its node_modules, or call with usePuppeteer=false.",
        ),
        PagewireError::Search(_) => Some(
            "The results page may be rate limiting this client or its markup may have changed. Retry later or check PAGEWIRE_SEARCH_ENDPOINT.",
        ),
        _ => None,
    }
}

pub(crate) fn call_result(reply: ToolReply) -> CallToolResult {
    let content = reply
        .content
        .into_iter()
        .map(|block| match block {
            ContentBlock::Text { text } => Content::text(text),
        })
        .collect();
    if reply.is_error {
        CallToolResult::error(content)
    } else {
        CallToolResult::success(content)
    }
}

/// Protocol-level fault for errors the caller has to fix.
pub(crate) fn mcp_error(e: PagewireError) -> McpError {
    match e {
        PagewireError::Validation(m) => McpError::invalid_params(m, None),
        PagewireError::UnknownOperation(m) => McpError::invalid_params(m, None),
        PagewireError::NotFound(m) => McpError::resource_not_found(m, None),
        other => McpError::internal_error(other.to_string(), None),
    }
}

/// Recoverable failures become an error-flagged result; everything else is a fault.
pub(crate) fn tool_error(e: PagewireError) -> Result<CallToolResult, McpError> {
    if !e.is_recoverable() {
        return Err(mcp_error(e));
    }
    let mut text = e.to_string();
    if let Some(hint) = error_hint(&e) {
        text.push_str("\nhint: ");
        text.push_str(hint);
    }
    Ok(CallToolResult::error(vec![Content::text(text)]))
}
