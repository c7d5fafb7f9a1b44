// src/grading/lp.rs

use std::{collections::BTreeMap, path::PathBuf, sync::Arc};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use uuid::Uuid;

use super::{
    Grader, GradingContext, GradingError,
    builders::{BuildRequest, BuildService, Builder, SphinxPaths},
};
use crate::config::OUTPUT_TAIL_BYTES;

/// Student-visible copies of the templates, under the Sphinx output dir.
const STUDENT_SOURCE_PATH: &str = "sphinx-enki-info/student_source";
const SPHINX_SETTINGS: &str = "sphinx_settings.json";

/// Grades linked-program ("lp") exercises: splices the student's snippets
/// into the course template, builds it and runs it against a harness.
pub struct LpGrader {
    book_path: PathBuf,
    builds: Arc<BuildService>,
}

impl LpGrader {
    pub fn new(book_path: PathBuf, builds: Arc<BuildService>) -> Self {
        Self { book_path, builds }
    }
}

#[derive(Debug, Deserialize)]
struct LpConfig {
    source_path: String,
    builder: String,
}

#[derive(Debug, Deserialize)]
struct SphinxSettings {
    #[serde(rename = "SPHINX_SOURCE_PATH")]
    source_path: String,
    #[serde(rename = "SPHINX_OUT_PATH")]
    out_path: String,
}

/// Per-language splicing rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Language {
    C,
    Asm,
    Python,
    Rust,
}

impl Language {
    fn from_source_path(source_path: &str) -> Result<Self, GradingError> {
        match std::path::Path::new(source_path)
            .extension()
            .and_then(|e| e.to_str())
        {
            Some("c") => Ok(Language::C),
            Some("s") => Ok(Language::Asm),
            Some("py") => Ok(Language::Python),
            Some("rs") => Ok(Language::Rust),
            other => Err(GradingError::Config(format!(
                "Unsupported extension {}",
                other.map(|e| format!(".{}", e)).unwrap_or_default()
            ))),
        }
    }

    /// The comment in a template marking where a snippet goes.
    fn marker(self) -> &'static str {
        match self {
            Language::C | Language::Rust => "// Put code here.",
            Language::Python => "# Put code here.",
            Language::Asm => "; Put code here.",
        }
    }

    /// Makes compiler diagnostics refer to the snippet box, not the spliced file.
    fn edit(self, index: usize, snippet: &str) -> String {
        match self {
            Language::C => format!("#line 1 \"box {}\"\n{}", index + 1, snippet),
            Language::Asm | Language::Python | Language::Rust => snippet.to_string(),
        }
    }
}

/// Reads the submitted snippets: a JSON array, or an object keyed by
/// snippet number.
fn parse_snippets(raw: &str) -> Option<Vec<String>> {
    match serde_json::from_str::<Value>(raw).ok()? {
        Value::Array(items) => items
            .into_iter()
            .map(|item| item.as_str().map(str::to_string))
            .collect(),
        Value::Object(map) => {
            let mut numbered = BTreeMap::new();
            for (key, value) in map {
                numbered.insert(key.parse::<u32>().ok()?, value.as_str()?.to_string());
            }
            Some(numbered.into_values().collect())
        }
        _ => None,
    }
}

/// Fills each marker of `template` with a snippet.
fn splice(template: &str, snippets: &[String], language: Language) -> Result<String, GradingError> {
    let segments: Vec<&str> = template.split(language.marker()).collect();
    if segments.len() - 1 != snippets.len() {
        return Err(GradingError::Failure("Wrong number of snippets.".into()));
    }

    let mut pieces = Vec::with_capacity(segments.len() * 2);
    for (index, segment) in segments.iter().enumerate() {
        pieces.push(segment.to_string());
        if let Some(snippet) = snippets.get(index) {
            pieces.push(language.edit(index, snippet));
        }
    }
    Ok(pieces.join("\n"))
}

/// The last `max` bytes of `text`, cut on a char boundary.
fn tail(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}

impl LpGrader {
    async fn read_settings(&self, base: &std::path::Path) -> Result<SphinxSettings, GradingError> {
        let raw = tokio::fs::read(base.join(SPHINX_SETTINGS)).await;
        raw.ok()
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
            .ok_or_else(|| {
                GradingError::Failure(format!(
                    "Unable to load Sphinx configuration file from {}",
                    base.display()
                ))
            })
    }
}

#[async_trait]
impl Grader for LpGrader {
    async fn grade(&self, ctx: GradingContext<'_>) -> Result<Map<String, Value>, GradingError> {
        let raw = ctx.row.answer.clone().unwrap_or_default();
        let Some(snippets) = parse_snippets(&raw) else {
            ctx.row.answer = Some("{}".into());
            return Err(GradingError::Failure(format!(
                "Unable to load answers from '{}'.",
                raw
            )));
        };
        ctx.row.answer = Some(json!({ "code_snippets": snippets }).to_string());

        let config: LpConfig = serde_json::from_value(ctx.feedback.clone())
            .map_err(|e| GradingError::Config(format!("lp feedback is malformed: {}", e)))?;
        let language = Language::from_source_path(&config.source_path)?;

        let base = self.book_path.join(ctx.base_course);
        let settings = self.read_settings(&base).await?;

        let template_path = base
            .join(&settings.out_path)
            .join(STUDENT_SOURCE_PATH)
            .join(&config.source_path);
        let template = tokio::fs::read_to_string(&template_path).await.map_err(|e| {
            GradingError::Failure(format!(
                "Cannot open source file {}: {}.",
                template_path.display(),
                e
            ))
        })?;

        let source = splice(&template, &snippets, language)?;

        let builder: Builder = config
            .builder
            .parse()
            .map_err(|e| GradingError::Failure(format!("Error in build task: {}", e)))?;

        let file_name = std::path::Path::new(&config.source_path)
            .file_name()
            .map(|n| n.to_os_string())
            .ok_or_else(|| GradingError::Config(format!("bad source_path {}", config.source_path)))?;
        let scratch = std::env::temp_dir().join(format!("bookserver-lp-{}", Uuid::new_v4()));
        let file_path = scratch.join(file_name);

        let write = async {
            tokio::fs::create_dir_all(&scratch).await?;
            tokio::fs::write(&file_path, &source).await
        };
        if let Err(e) = write.await {
            tracing::error!("Failed to write {}: {}", file_path.display(), e);
            return Err(GradingError::Failure(format!("Error in build task: {}", e)));
        }

        let request = BuildRequest {
            builder,
            file_path,
            sphinx: SphinxPaths {
                base,
                source: settings.source_path,
                out: settings.out_path,
            },
            source_path: config.source_path,
        };
        let result = self.builds.build(&request).await;

        if let Err(e) = tokio::fs::remove_dir_all(&scratch).await {
            tracing::warn!("Failed to remove {}: {}", scratch.display(), e);
        }

        let output = result.map_err(|e| {
            tracing::warn!(div_id = %ctx.row.div_id, "Build task failed: {}", e);
            GradingError::Failure(format!("Error in build task: {}", e))
        })?;

        let result_string = tail(output.output.trim(), OUTPUT_TAIL_BYTES).to_string();
        let correct = output.grade == 100;

        ctx.row.answer = Some(
            json!({ "code_snippets": snippets, "resultString": result_string }).to_string(),
        );
        ctx.row.correct = Some(correct);
        ctx.row.percent = Some(f64::from(output.grade) / 100.0);

        let mut response = Map::new();
        response.insert("answer".into(), json!({ "resultString": result_string }));
        response.insert("correct".into(), json!(correct));
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BuildConfig;
    use crate::models::answer::{AnswerExtra, AnswerRow};
    use crate::sandbox::{SandboxPool, SimLauncher, SimProcess};
    use chrono::Utc;
    use std::time::Duration;

    struct NoSimulator;

    #[async_trait]
    impl SimLauncher for NoSimulator {
        async fn launch(&self) -> std::io::Result<Box<dyn SimProcess>> {
            Err(std::io::Error::other("no simulator"))
        }
    }

    /// A book with one python lp exercise `ch1/lp.py` that has two markers.
    fn book() -> PathBuf {
        let root = std::env::temp_dir().join(format!("bookserver-book-{}", Uuid::new_v4()));
        let base = root.join("pic24");
        std::fs::create_dir_all(base.join("_build/sphinx-enki-info/student_source/ch1")).unwrap();
        std::fs::write(
            base.join(SPHINX_SETTINGS),
            r#"{"SPHINX_SOURCE_PATH": "_sources", "SPHINX_OUT_PATH": "_build"}"#,
        )
        .unwrap();
        std::fs::write(
            base.join("_build/sphinx-enki-info/student_source/ch1/lp.py"),
            "a = 1\n# Put code here.\nb = 2\n# Put code here.\n",
        )
        .unwrap();
        root
    }

    fn grader(book_path: PathBuf, config: BuildConfig) -> LpGrader {
        let sandbox = Arc::new(SandboxPool::new(Arc::new(NoSimulator), 1, Duration::from_secs(1)));
        LpGrader::new(book_path, Arc::new(BuildService::new(config, sandbox)))
    }

    fn row(answer: &str) -> AnswerRow {
        AnswerRow {
            timestamp: Utc::now(),
            div_id: "lp_demo".into(),
            sid: "alice".into(),
            course_name: "pic24".into(),
            answer: Some(answer.into()),
            correct: None,
            percent: None,
            source: None,
            extra: AnswerExtra::None,
        }
    }

    async fn grade(grader: &LpGrader, row: &mut AnswerRow, feedback: Value) -> Result<Map<String, Value>, GradingError> {
        grader
            .grade(GradingContext {
                row,
                feedback: &feedback,
                base_course: "pic24",
                seed: None,
            })
            .await
    }

    #[test]
    fn test_splice_adds_line_directives_for_c() {
        let template = "int a;\n// Put code here.\nint b;\n// Put code here.\n";
        let snippets = vec!["x();".to_string(), "y();".to_string()];
        let spliced = splice(template, &snippets, Language::C).unwrap();
        assert_eq!(
            spliced,
            "int a;\n\n#line 1 \"box 1\"\nx();\n\nint b;\n\n#line 1 \"box 2\"\ny();\n\n"
        );
    }

    #[test]
    fn test_splice_leaves_python_untouched() {
        let snippets = vec!["print(1)".to_string()];
        let spliced = splice("# Put code here.", &snippets, Language::Python).unwrap();
        assert_eq!(spliced, "\nprint(1)\n");
    }

    #[test]
    fn test_splice_rejects_wrong_snippet_count() {
        let template = "// Put code here.\n// Put code here.\n// Put code here.\n";
        let snippets = vec!["a".to_string(), "b".to_string()];
        let err = splice(template, &snippets, Language::C).unwrap_err();
        assert!(!err.is_fatal());
        assert_eq!(err.to_feedback()["errors"], json!(["Wrong number of snippets."]));
    }

    #[test]
    fn test_unsupported_extension_is_fatal() {
        assert!(Language::from_source_path("ch1/lp.java").unwrap_err().is_fatal());
        assert_eq!(Language::from_source_path("ch1/lp.rs").unwrap(), Language::Rust);
    }

    #[test]
    fn test_parse_snippets_formats() {
        assert_eq!(parse_snippets(r#"["a","b"]"#), Some(vec!["a".into(), "b".into()]));
        assert_eq!(
            parse_snippets(r#"{"10":"c","2":"b","1":"a"}"#),
            Some(vec!["a".into(), "b".into(), "c".into()])
        );
        assert_eq!(parse_snippets("not json"), None);
    }

    #[test]
    fn test_tail_respects_char_boundaries() {
        assert_eq!(tail("hello", 10), "hello");
        assert_eq!(tail("hello", 3), "llo");
        assert_eq!(tail("aé", 1), "");
    }

    #[tokio::test]
    async fn test_snippet_mismatch_keeps_snippets_only() {
        let book = book();
        let grader = grader(book.clone(), BuildConfig::default());
        let mut row = row(r#"["c = 3"]"#);

        let err = grade(&grader, &mut row, json!({"source_path": "ch1/lp.py", "builder": "python"}))
            .await
            .unwrap_err();

        assert!(!err.is_fatal());
        assert_eq!(err.to_string(), "Wrong number of snippets.");
        assert_eq!(row.answer.as_deref(), Some(r#"{"code_snippets":["c = 3"]}"#));
        std::fs::remove_dir_all(book).unwrap();
    }

    #[tokio::test]
    async fn test_python_build_end_to_end() {
        let book = book();
        // `cat` stands in for the interpreter, so the spliced file is echoed back.
        let config = BuildConfig {
            python_command: "cat".into(),
            ..BuildConfig::default()
        };
        let grader = grader(book.clone(), config);
        let mut row = row(r#"["c = 3","d = 4"]"#);

        let feedback = grade(&grader, &mut row, json!({"source_path": "ch1/lp.py", "builder": "python"}))
            .await
            .unwrap();

        let result = feedback["answer"]["resultString"].as_str().unwrap();
        assert!(result.starts_with("Run\n===\n"));
        assert!(result.ends_with("a = 1\n\nc = 3\n\nb = 2\n\nd = 4"));
        assert_eq!(feedback["correct"], true);
        assert_eq!(row.correct, Some(true));
        assert_eq!(row.percent, Some(1.0));

        let stored: Value = serde_json::from_str(row.answer.as_deref().unwrap()).unwrap();
        assert_eq!(stored["code_snippets"], json!(["c = 3", "d = 4"]));
        assert_eq!(stored["resultString"], result);
        std::fs::remove_dir_all(book).unwrap();
    }

    #[tokio::test]
    async fn test_missing_settings_is_a_grading_failure() {
        let grader = grader(PathBuf::from("/nonexistent"), BuildConfig::default());
        let mut row = row(r#"["x"]"#);

        let err = grade(&grader, &mut row, json!({"source_path": "lp.c", "builder": "pic24-xc16-bullylib"}))
            .await
            .unwrap_err();

        assert!(!err.is_fatal());
        assert!(err.to_string().starts_with("Unable to load Sphinx configuration file"));
    }

    #[tokio::test]
    async fn test_unknown_builder_reports_build_task_error() {
        let book = book();
        let grader = grader(book.clone(), BuildConfig::default());
        let mut row = row(r#"["c = 3","d = 4"]"#);

        let err = grade(&grader, &mut row, json!({"source_path": "ch1/lp.py", "builder": "cobol"}))
            .await
            .unwrap_err();

        assert_eq!(err.to_string(), "Error in build task: Unknown builder cobol");
        std::fs::remove_dir_all(book).unwrap();
    }
}
