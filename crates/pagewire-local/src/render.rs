use crate::config::Settings;
use pagewire_core::{Error, PageRenderer, RenderOptions, Result};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Rendered retrieval via Node.js + Puppeteer.
///
/// Expected setup:
/// - Node.js on PATH (or `PAGEWIRE_NODE`)
/// - the `puppeteer` npm package resolvable by Node (global, local project, or `PAGEWIRE_NODE_PATH`)
///
/// Every call launches its own browser and closes it before returning; nothing is pooled.
#[derive(Debug, Clone)]
pub struct PuppeteerRenderer {
    node_bin: String,
    node_path: Option<String>,
    disabled: bool,
    hard_timeout_margin: Duration,
    kill_grace: Duration,
}

const DEFAULT_HARD_TIMEOUT_MARGIN: Duration = Duration::from_secs(10);
const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(2);

/// Line prefix the script writes to stderr once the browser is up.
const BROWSER_PID_MARKER: &str = "pagewire-browser-pid ";

#[derive(Debug, Clone)]
pub struct RenderedPage {
    pub final_url: String,
    pub status: Option<u16>,
    pub html: String,
}

// stdout carries exactly one JSON object; the browser is closed in `finally` on every path.
const JS: &str = r#"
const fs = require('fs');

function ok(obj) { process.stdout.write(JSON.stringify(obj)); }
function bad(code, message) { ok({ ok: false, error: { code, message } }); }

async function main() {
  let req;
  try { req = JSON.parse(fs.readFileSync(0, 'utf8')); } catch (e) { return bad('invalid_params', 'bad JSON args'); }

  let puppeteer;
  try { puppeteer = require('puppeteer'); } catch (e) {
    return bad('not_configured', 'puppeteer is not installed for Node.js (npm i -g puppeteer)');
  }

  const url = String(req.url || '').trim();
  if (!url) return bad('invalid_params', 'url must be non-empty');

  let browser;
  try {
    browser = await puppeteer.launch({
      headless: !!req.headless,
      args: Array.isArray(req.args) ? req.args : [],
    });
    const bp = browser.process();
    if (bp && bp.pid) process.stderr.write(`pagewire-browser-pid ${bp.pid}\n`);
    const page = await browser.newPage();
    const resp = await page.goto(url, {
      waitUntil: req.wait_until || 'networkidle0',
      timeout: Number(req.timeout_ms || 30000),
    });
    const html = await page.content();
    ok({ ok: true, final_url: page.url(), status: resp ? resp.status() : null, html });
  } catch (e) {
    const code = (e && e.name === 'TimeoutError') ? 'timeout' : 'render_failed';
    bad(code, String(e && e.message ? e.message : e));
  } finally {
    try { if (browser) await browser.close(); } catch (_) {}
  }
}

main().catch((e) => bad('render_failed', String(e && e.message ? e.message : e)));
"#;

/// Owns the Node child for exactly one render attempt. Dropping it before the child is reaped
/// (an early return or a cancelled future) shuts the child down in the background.
struct RenderProcess {
    child: Option<tokio::process::Child>,
    grace: Duration,
}

impl RenderProcess {
    async fn wait(&mut self) -> std::io::Result<std::process::ExitStatus> {
        let Some(child) = self.child.as_mut() else {
            return Err(std::io::Error::other("renderer already shut down"));
        };
        let status = child.wait().await?;
        self.child = None;
        Ok(status)
    }

    async fn terminate(&mut self, browser_pid: Option<u32>) {
        if let Some(mut child) = self.child.take() {
            shutdown(&mut child, browser_pid, self.grace).await;
        }
    }
}

impl Drop for RenderProcess {
    fn drop(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let grace = self.grace;
                handle.spawn(async move { shutdown(&mut child, None, grace).await });
            }
            Err(_) => {
                let _ = child.start_kill();
            }
        }
    }
}

/// SIGTERM first: Puppeteer's default handler closes its browser, which runs detached and
/// would outlive a SIGKILLed Node. Escalate to SIGKILL after `grace`, then kill any browser
/// the script reported.
async fn shutdown(child: &mut tokio::process::Child, browser_pid: Option<u32>, grace: Duration) {
    if let Some(pid) = child.id() {
        let exited = send_signal(pid, "TERM").await
            && tokio::time::timeout(grace, child.wait()).await.is_ok();
        if !exited {
            tracing::debug!(pid, "renderer still running after SIGTERM; killing");
            let _ = child.kill().await;
        }
    }
    if let Some(pid) = browser_pid {
        if send_signal(pid, "KILL").await {
            tracing::warn!(pid, "killed browser left behind by renderer");
        }
    }
}

#[cfg(unix)]
async fn send_signal(pid: u32, signal: &str) -> bool {
    tokio::process::Command::new("kill")
        .arg("-s")
        .arg(signal)
        .arg(pid.to_string())
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .await
        .map(|s| s.success())
        .unwrap_or(false)
}

#[cfg(not(unix))]
async fn send_signal(_pid: u32, _signal: &str) -> bool {
    false
}

/// Browser pid the script announced on stderr, if it got that far.
fn browser_pid(stderr: &[u8]) -> Option<u32> {
    String::from_utf8_lossy(stderr)
        .lines()
        .filter_map(|l| l.trim().strip_prefix(BROWSER_PID_MARKER))
        .filter_map(|pid| pid.trim().parse().ok())
        .last()
}

/// Drain a pipe into `buf`. `read_buf` is cancel safe, so a timeout keeps what arrived.
async fn drain(mut pipe: impl tokio::io::AsyncRead + Unpin, buf: &mut Vec<u8>) {
    while let Ok(n) = pipe.read_buf(buf).await {
        if n == 0 {
            break;
        }
    }
}

fn node_path_candidates() -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    if let Some(home) = std::env::var_os("HOME").map(std::path::PathBuf::from) {
        out.push(
            home.join(".npm-global")
                .join("lib")
                .join("node_modules")
                .to_string_lossy()
                .to_string(),
        );
    }
    out.push("/opt/homebrew/lib/node_modules".to_string());
    out.push("/usr/local/lib/node_modules".to_string());
    out.push("/usr/lib/node_modules".to_string());
    out
}

fn node_path_has_puppeteer(np: &str) -> bool {
    np.split(':')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .any(|p| std::path::Path::new(p).join("puppeteer").is_dir())
}

/// NODE_PATH to hand the child, or None to leave the inherited one alone.
fn resolve_node_path(explicit: Option<&str>) -> Option<String> {
    if let Some(v) = explicit.map(str::trim).filter(|v| !v.is_empty()) {
        return Some(v.to_string());
    }
    let existing = std::env::var("NODE_PATH").unwrap_or_default();
    if node_path_has_puppeteer(&existing) {
        return None;
    }
    let found = node_path_candidates()
        .into_iter()
        .find(|root| std::path::Path::new(root).join("puppeteer").is_dir())?;
    if existing.trim().is_empty() {
        Some(found)
    } else {
        Some(format!("{existing}:{found}"))
    }
}

fn render_args_json(url: &str, opts: &RenderOptions) -> String {
    serde_json::json!({
        "url": url,
        "headless": opts.headless,
        "args": opts.args,
        "wait_until": opts.wait.as_puppeteer(),
        "timeout_ms": opts.timeout_ms,
    })
    .to_string()
}

/// Interpret the script's stdout. Non-zero exits still print JSON, so stdout wins over status.
fn parse_render_output(stdout: &[u8], stderr: &[u8], url: &str) -> Result<RenderedPage> {
    let stdout = String::from_utf8_lossy(stdout);
    let v: serde_json::Value = serde_json::from_str(stdout.trim()).map_err(|e| {
        let stderr = String::from_utf8_lossy(stderr)
            .lines()
            .filter(|l| !l.trim().starts_with(BROWSER_PID_MARKER))
            .collect::<Vec<_>>()
            .join("\n")
            .trim()
            .to_string();
        if stderr.is_empty() {
            Error::Render(format!("renderer returned invalid JSON: {e}"))
        } else {
            Error::Render(format!("renderer returned invalid JSON: {e}. stderr: {stderr}"))
        }
    })?;

    if v.get("ok").and_then(|x| x.as_bool()) != Some(true) {
        let code = v
            .pointer("/error/code")
            .and_then(|x| x.as_str())
            .unwrap_or("render_failed");
        let message = v
            .pointer("/error/message")
            .and_then(|x| x.as_str())
            .unwrap_or("renderer failed")
            .to_string();
        return Err(match code {
            "not_configured" => Error::NotConfigured(message),
            "timeout" => Error::Render(format!("navigation timed out: {message}")),
            _ => Error::Render(message),
        });
    }

    let html = v
        .get("html")
        .and_then(|x| x.as_str())
        .unwrap_or("")
        .to_string();
    if html.trim().is_empty() {
        return Err(Error::Render("renderer returned empty HTML".to_string()));
    }
    Ok(RenderedPage {
        final_url: v
            .get("final_url")
            .and_then(|x| x.as_str())
            .unwrap_or(url)
            .to_string(),
        status: v.get("status").and_then(|x| x.as_u64()).map(|n| n as u16),
        html,
    })
}

impl PuppeteerRenderer {
    pub fn new(node_bin: impl Into<String>, node_path: Option<String>) -> Self {
        Self {
            node_bin: node_bin.into(),
            node_path,
            disabled: false,
            hard_timeout_margin: DEFAULT_HARD_TIMEOUT_MARGIN,
            kill_grace: DEFAULT_KILL_GRACE,
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(settings.node_bin.clone(), settings.node_path.clone())
            .disabled(settings.render_disabled)
    }

    pub fn disabled(mut self, disabled: bool) -> Self {
        self.disabled = disabled;
        self
    }

    /// Time allowed past the navigation timeout before the child is torn down.
    pub fn with_hard_timeout_margin(mut self, margin: Duration) -> Self {
        self.hard_timeout_margin = margin;
        self
    }

    /// How long the child gets to exit after SIGTERM before it is killed.
    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    pub async fn render_page(&self, url: &str, opts: &RenderOptions) -> Result<RenderedPage> {
        if self.disabled {
            return Err(Error::NotConfigured(
                "rendered retrieval disabled (PAGEWIRE_RENDER_DISABLE)".to_string(),
            ));
        }

        // The navigation timeout lives inside the script; this outer bound covers browser
        // launch and a wedged Node process.
        let hard_timeout = opts.timeout().saturating_add(self.hard_timeout_margin);

        let mut cmd = tokio::process::Command::new(&self.node_bin);
        if let Some(np) = resolve_node_path(self.node_path.as_deref()) {
            cmd.env("NODE_PATH", np);
        }
        let mut child = cmd
            .arg("-e")
            .arg(JS)
            .kill_on_drop(true)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .map_err(|e| {
                Error::NotConfigured(format!(
                    "rendered retrieval requires Node.js ({}) and the puppeteer npm package: {e}",
                    self.node_bin
                ))
            })?;
        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let mut proc = RenderProcess {
            child: Some(child),
            grace: self.kill_grace,
        };
        let (Some(stdout), Some(stderr)) = (stdout, stderr) else {
            return Err(Error::Render("renderer: missing stdio pipes".to_string()));
        };

        if let Some(mut stdin) = stdin {
            // A failed write surfaces as a JSON error from the script.
            let _ = stdin
                .write_all(render_args_json(url, opts).as_bytes())
                .await;
            let _ = stdin.shutdown().await;
        }

        // Drain both pipes while waiting so a chatty child can't block on a full pipe.
        let mut out = Vec::new();
        let mut err = Vec::new();
        let waited = {
            let drained = async {
                tokio::join!(drain(stdout, &mut out), drain(stderr, &mut err));
                proc.wait().await
            };
            tokio::time::timeout(hard_timeout, drained).await
        };
        let status = match waited {
            Ok(status) => status,
            Err(_) => {
                proc.terminate(browser_pid(&err)).await;
                return Err(Error::Render(format!(
                    "renderer hard timeout after {}ms",
                    hard_timeout.as_millis()
                )));
            }
        };
        let status = status.map_err(|e| Error::Render(format!("renderer wait failed: {e}")))?;
        if !status.success() {
            tracing::debug!(?status, "renderer exited non-zero");
        }
        parse_render_output(&out, &err, url)
    }
}

#[async_trait::async_trait]
impl PageRenderer for PuppeteerRenderer {
    async fn render(&self, url: &str, opts: &RenderOptions) -> Result<String> {
        self.render_page(url, opts).await.map(|p| p.html)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pagewire_core::WaitPolicy;

    #[test]
    fn args_json_carries_launch_configuration() {
        let opts = RenderOptions {
            headless: true,
            args: RenderOptions::split_flags("--no-sandbox  --lang=en"),
            wait: WaitPolicy::DomContentLoaded,
            timeout_ms: 5_000,
        };
        let v: serde_json::Value =
            serde_json::from_str(&render_args_json("https://example.com", &opts)).unwrap();
        assert_eq!(v["url"], "https://example.com");
        assert_eq!(v["headless"], true);
        assert_eq!(v["args"], serde_json::json!(["--no-sandbox", "--lang=en"]));
        assert_eq!(v["wait_until"], "domcontentloaded");
        assert_eq!(v["timeout_ms"], 5_000);
    }

    #[test]
    fn parses_successful_render() {
        let out = br#"{"ok":true,"final_url":"https://example.com/","status":200,"html":"<html><body>hi</body></html>"}"#;
        let page = parse_render_output(out, b"", "https://example.com").unwrap();
        assert_eq!(page.final_url, "https://example.com/");
        assert_eq!(page.status, Some(200));
        assert!(page.html.contains("hi"));
    }

    #[test]
    fn maps_script_errors_to_taxonomy() {
        let out = br#"{"ok":false,"error":{"code":"not_configured","message":"puppeteer missing"}}"#;
        assert!(matches!(
            parse_render_output(out, b"", "u"),
            Err(Error::NotConfigured(_))
        ));

        let out = br#"{"ok":false,"error":{"code":"timeout","message":"Navigation timeout of 30000 ms exceeded"}}"#;
        match parse_render_output(out, b"", "u") {
            Err(Error::Render(m)) => assert!(m.contains("timed out")),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn garbage_or_empty_output_is_a_render_error() {
        match parse_render_output(b"Segmentation fault", b"boom", "u") {
            Err(Error::Render(m)) => assert!(m.contains("stderr: boom")),
            other => panic!("unexpected: {other:?}"),
        }
        let out = br#"{"ok":true,"html":"   "}"#;
        assert!(matches!(
            parse_render_output(out, b"", "u"),
            Err(Error::Render(_))
        ));
    }

    #[test]
    fn explicit_node_path_wins() {
        assert_eq!(
            resolve_node_path(Some(" /opt/node_modules ")),
            Some("/opt/node_modules".to_string())
        );
    }

    #[tokio::test]
    async fn disabled_renderer_fails_without_spawning() {
        let r = PuppeteerRenderer::new("node", None).disabled(true);
        let err = r
            .render("https://example.com", &RenderOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotConfigured(_)));
    }

    #[test]
    fn browser_pid_is_read_from_stderr_and_kept_out_of_errors() {
        let err = b"warming up\npagewire-browser-pid 4242\n";
        assert_eq!(browser_pid(err), Some(4242));
        assert_eq!(browser_pid(b"no marker here"), None);
        match parse_render_output(b"", err, "u") {
            Err(Error::Render(m)) => {
                assert!(m.contains("warming up"), "{m}");
                assert!(!m.contains("4242"), "{m}");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    /// Stand-in for `node` that starts a long-lived "browser", announces its pid the way the
    /// script does, and never answers. With `ignore_term` it also shrugs off SIGTERM.
    #[cfg(target_os = "linux")]
    fn hung_renderer(dir: &std::path::Path, ignore_term: bool) -> std::path::PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let script = dir.join("fake-node");
        let trap = if ignore_term { "trap '' TERM\n" } else { "" };
        std::fs::write(
            &script,
            format!(
                "#!/bin/sh\n{trap}echo $$ > '{dir}/node.pid'\nsleep 600 &\necho $! > '{dir}/browser.pid'\necho \"{BROWSER_PID_MARKER}$!\" >&2\nwhile :; do sleep 1; done\n",
                dir = dir.display(),
            ),
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        script
    }

    /// Zombies count as gone: nothing may reap them inside a container.
    #[cfg(target_os = "linux")]
    fn is_running(pid: u32) -> bool {
        match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            Ok(stat) => stat
                .rsplit_once(") ")
                .and_then(|(_, rest)| rest.chars().next())
                .is_some_and(|state| state != 'Z' && state != 'X'),
            Err(_) => false,
        }
    }

    #[cfg(target_os = "linux")]
    async fn assert_gone(dir: &std::path::Path, name: &str) {
        let pid: u32 = std::fs::read_to_string(dir.join(name))
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        for _ in 0..50 {
            if !is_running(pid) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("{name} ({pid}) still running after hard timeout");
    }

    #[cfg(target_os = "linux")]
    async fn render_until_hard_timeout(script: &std::path::Path) {
        let r = PuppeteerRenderer::new(script.to_string_lossy(), None)
            .with_hard_timeout_margin(Duration::from_millis(700))
            .with_kill_grace(Duration::from_millis(300));
        let opts = RenderOptions {
            timeout_ms: 100,
            ..RenderOptions::default()
        };
        match r.render("https://example.com", &opts).await {
            Err(Error::Render(m)) => assert!(m.contains("hard timeout"), "{m}"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn hard_timeout_tears_down_renderer_and_browser() {
        let dir = tempfile::tempdir().unwrap();
        let script = hung_renderer(dir.path(), false);
        render_until_hard_timeout(&script).await;
        assert_gone(dir.path(), "node.pid").await;
        assert_gone(dir.path(), "browser.pid").await;
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn renderer_ignoring_sigterm_is_killed_after_grace() {
        let dir = tempfile::tempdir().unwrap();
        let script = hung_renderer(dir.path(), true);
        render_until_hard_timeout(&script).await;
        assert_gone(dir.path(), "node.pid").await;
        assert_gone(dir.path(), "browser.pid").await;
    }

    #[tokio::test]
    async fn missing_node_binary_is_not_configured() {
        let r = PuppeteerRenderer::new("pagewire-definitely-not-a-node-binary", None);
        let err = r
            .render("https://example.com", &RenderOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotConfigured(_)), "got {err:?}");
    }
}
