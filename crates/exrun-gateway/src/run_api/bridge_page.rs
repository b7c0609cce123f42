//! Static page the orchestrator opens as a regular web tab next to the
//! extension pages.

use super::{HEALTH_ENDPOINT, RUNS_STREAM_ENDPOINT};

pub(super) fn render_bridge_page(port: u16) -> String {
    format!(
        r#"<!doctype html>
<html lang="en">
<head>
<meta charset="utf-8">
<title>exrun bridge</title>
<style>
body {{ font-family: system-ui, sans-serif; margin: 2rem; color: #1f2933; }}
code {{ background: #eef2f7; padding: 0 .25rem; }}
#runs {{ margin-top: 1rem; font-size: .9rem; white-space: pre-line; }}
</style>
</head>
<body>
<h1>exrun bridge</h1>
<p>This tab is kept open by the runner on port <code>{port}</code>. Closing it does not stop the run.</p>
<p>Health: <a href="{HEALTH_ENDPOINT}">{HEALTH_ENDPOINT}</a></p>
<div id="runs">waiting for runs...</div>
<script>
(function () {{
  var target = document.getElementById("runs");
  if (!window.EventSource) return;
  var source = new EventSource("{RUNS_STREAM_ENDPOINT}");
  source.onmessage = function (event) {{
    try {{
      var payload = JSON.parse(event.data);
      if (!payload.items) return;
      target.textContent = payload.items
        .map(function (run) {{ return run.id + " " + run.status + " " + run.workflowName; }})
        .join("\n") || "no runs";
    }} catch (_) {{}}
  }};
}})();
</script>
</body>
</html>
"#
    )
}
