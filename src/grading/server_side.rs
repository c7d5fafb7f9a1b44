// src/grading/server_side.rs

//! Runs a course's compiled `server_side.js` bundle under `node`.
//!
//! Dynamic FITB problems define their variables in JavaScript, so they are
//! rendered and graded by the same functions the page itself uses.

use std::{
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use serde_json::Value;
use tokio::{io::AsyncWriteExt, process::Command, time::timeout};

use super::GradingError;
use crate::config::ServerJsConfig;

/// Where the book build puts the bundle, relative to the published book.
pub const BUNDLE_RELATIVE: &str = "_static/server_side.js";

/// Loads the bundle into a fresh VM context and answers one request read from
/// stdin. `Number_` and `exports` are the globals the bundle expects.
const FITB_DRIVER: &str = r#"
"use strict";
const fs = require("fs");
const vm = require("vm");

const bundlePath = process.argv[process.argv.length - 1];
const context = vm.createContext({ exports: {}, console: new console.Console(process.stderr) });
vm.runInContext(
    "var Number_ = function (n) {" +
    "  if (typeof n === 'string' && n.trim().slice(0, 2).toLowerCase() === '0b') {" +
    "    return parseInt(n.trim().slice(2), 2);" +
    "  }" +
    "  return Number(n);" +
    "};",
    context
);
vm.runInContext(fs.readFileSync(bundlePath, "utf8"), context, { filename: bundlePath });
const serverSide = context.serverSide || context.exports.serverSide || context.exports;
const fitb = serverSide.fitb;

let input = "";
process.stdin.setEncoding("utf8");
process.stdin.on("data", (chunk) => { input += chunk; });
process.stdin.on("end", () => {
    const req = JSON.parse(input);
    const out = { problemHtml: "" };
    let dynVars = null;
    if (req.dyn_vars) {
        const rendered = fitb.renderDynamicContent(req.seed, req.dyn_vars, req.problemHtml);
        out.problemHtml = rendered[0];
        dynVars = rendered[1];
    }
    if (req.answer !== null) {
        const graded = fitb.evaluateAnswersCore(req.blankNames, req.answer, req.feedbackArray, dynVars, true);
        const displayFeed = graded[0];
        if (req.dyn_vars) {
            for (let i = 0; i < displayFeed.length; i++) {
                displayFeed[i] = fitb.renderDynamicFeedback(req.blankNames, req.answer, i, displayFeed[i], dynVars);
            }
        }
        out.displayFeed = displayFeed;
        out.correct = graded[1];
        out.isCorrectArray = graded[2];
        out.percent = graded[3];
    }
    process.stdout.write(JSON.stringify(out));
});
"#;

/// A `node` command line plus the time one evaluation may take.
#[derive(Debug, Clone)]
pub struct ServerSideJs {
    command: String,
    timeout: Duration,
}

impl ServerSideJs {
    pub fn new(command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            timeout,
        }
    }

    pub fn from_config(config: &ServerJsConfig) -> Self {
        Self::new(config.node_command.clone(), config.timeout)
    }

    /// `<book_path>/<base>/published/<base>/_static/server_side.js`
    pub fn bundle_path(book_path: &Path, base_course: &str) -> PathBuf {
        book_path
            .join(base_course)
            .join("published")
            .join(base_course)
            .join(BUNDLE_RELATIVE)
    }

    /// Renders and (when `answer` is not null) grades one FITB problem.
    ///
    /// A missing bundle or interpreter is a configuration error. A script that
    /// fails or hangs is a grading failure for this submission only.
    pub async fn evaluate_fitb(&self, bundle: &Path, request: &Value) -> Result<Value, GradingError> {
        if !tokio::fs::try_exists(bundle).await.unwrap_or(false) {
            return Err(GradingError::Config(format!(
                "Missing server-side grader {}",
                bundle.display()
            )));
        }

        let mut parts = self.command.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| GradingError::Config("NODE_COMMAND is empty".to_string()))?;

        let mut child = Command::new(program)
            .args(parts)
            .arg("-e")
            .arg(FITB_DRIVER)
            .arg("--")
            .arg(bundle)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| GradingError::Config(format!("Unable to start {}: {}", program, e)))?;

        let input = serde_json::to_vec(request)
            .map_err(|e| GradingError::Config(format!("Unencodable FITB request: {}", e)))?;
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| GradingError::Failure("Unable to grade this question.".to_string()))?;

        let run = async move {
            stdin.write_all(&input).await?;
            drop(stdin);
            child.wait_with_output().await
        };

        let output = match timeout(self.timeout, run).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                tracing::warn!(bundle = %bundle.display(), "server_side.js I/O failed: {:?}", e);
                return Err(GradingError::Failure("Unable to grade this question.".to_string()));
            }
            Err(_) => {
                tracing::warn!(bundle = %bundle.display(), "server_side.js timed out");
                return Err(GradingError::Failure("Grading timed out.".to_string()));
            }
        };

        if !output.status.success() {
            tracing::warn!(
                bundle = %bundle.display(),
                status = ?output.status,
                "server_side.js failed: {}",
                String::from_utf8_lossy(&output.stderr)
            );
            return Err(GradingError::Failure("Unable to grade this question.".to_string()));
        }

        serde_json::from_slice(&output.stdout).map_err(|e| {
            tracing::warn!(bundle = %bundle.display(), "Unreadable server_side.js output: {}", e);
            GradingError::Failure("Unable to grade this question.".to_string())
        })
    }
}
