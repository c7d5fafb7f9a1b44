// src/grading/fitb.rs

use std::path::PathBuf;

use async_trait::async_trait;
use regex::{Regex, RegexBuilder};
use serde::Deserialize;
use serde_json::{Map, Value, json};

use super::{Grader, GradingContext, GradingError, server_side::ServerSideJs};

const NO_ANSWER: &str = "No answer provided.";
const NO_MATCH: &str = "Incorrect.";
const EXAM_FEEDBACK: &str = "Response recorded.";

/// Grades fill-in-the-blank answers against the question's `feedbackArray`.
///
/// Static problems are graded here. Dynamic problems (`dyn_vars` is
/// JavaScript) go through the course's `server_side.js` bundle.
pub struct FitbGrader {
    is_exam: bool,
    book_path: PathBuf,
    js: ServerSideJs,
}

impl FitbGrader {
    pub fn new(is_exam: bool, book_path: PathBuf, js: ServerSideJs) -> Self {
        Self {
            is_exam,
            book_path,
            js,
        }
    }
}

/// The `feedback` column of a FITB question.
#[derive(Debug, Deserialize)]
struct FitbConfig {
    #[serde(rename = "feedbackArray")]
    feedback_array: Vec<Value>,
    #[serde(default, rename = "blankNames")]
    blank_names: Value,
    #[serde(default)]
    dyn_vars: Value,
    #[serde(default, rename = "problemHtml")]
    problem_html: String,
}

impl FitbConfig {
    fn is_dynamic(&self) -> bool {
        is_dynamic(&self.dyn_vars)
    }
}

/// `dyn_vars` is JavaScript source; empty or absent means a static problem.
fn is_dynamic(dyn_vars: &Value) -> bool {
    match dyn_vars {
        Value::Null | Value::Bool(false) => false,
        Value::String(source) => !source.trim().is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(fields) => !fields.is_empty(),
        _ => true,
    }
}

/// One test applied to a blank. The first matching item wins; only the first
/// item of a blank describes a correct answer. An item with only `feedback`
/// matches anything.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum FeedbackItem {
    Regex {
        regex: String,
        #[serde(default, rename = "regexFlags")]
        regex_flags: String,
        #[serde(default)]
        feedback: String,
    },
    Number {
        number: (f64, f64),
        #[serde(default)]
        feedback: String,
    },
    Fallback {
        feedback: String,
    },
}

/// A graded submission, in the shape the page expects.
#[derive(Debug, Deserialize)]
struct Evaluation {
    #[serde(rename = "displayFeed")]
    display_feed: Vec<Value>,
    correct: bool,
    #[serde(rename = "isCorrectArray")]
    is_correct_array: Vec<Value>,
    percent: f64,
}

/// What `server_side.js` sends back.
#[derive(Debug, Deserialize)]
struct ScriptResult {
    #[serde(default, rename = "problemHtml")]
    problem_html: String,
    #[serde(flatten)]
    evaluation: Option<Evaluation>,
}

/// Accepts the JSON array format and the legacy comma-separated format.
pub fn normalize_answer(raw: &str) -> Vec<String> {
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Array(items)) => items
            .into_iter()
            .map(|item| match item {
                Value::String(s) => s,
                Value::Null => String::new(),
                other => other.to_string(),
            })
            .collect(),
        _ => raw.split(',').map(str::to_string).collect(),
    }
}

/// Parses a blank the way the page does: trimmed, with `0b` binary literals.
fn parse_number(given: &str) -> Option<f64> {
    let trimmed = given.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Some(bits) = trimmed
        .strip_prefix("0b")
        .or_else(|| trimmed.strip_prefix("0B"))
    {
        return i64::from_str_radix(bits, 2).ok().map(|n| n as f64);
    }
    trimmed.parse::<f64>().ok().filter(|n| !n.is_nan())
}

fn build_regex(pattern: &str, flags: &str) -> Option<Regex> {
    RegexBuilder::new(pattern)
        .case_insensitive(flags.contains('i'))
        .multi_line(flags.contains('m'))
        .dot_matches_new_line(flags.contains('s'))
        .build()
        .map_err(|e| tracing::warn!("Skipping invalid FITB regex {:?}: {}", pattern, e))
        .ok()
}

/// Result of grading one blank.
#[derive(Debug, Clone, PartialEq)]
struct BlankResult {
    feedback: String,
    /// `None` for an empty blank.
    correct: Option<bool>,
}

fn grade_blank(given: &str, items: &[FeedbackItem]) -> BlankResult {
    if given.is_empty() {
        return BlankResult {
            feedback: NO_ANSWER.to_string(),
            correct: None,
        };
    }

    for (index, item) in items.iter().enumerate() {
        let (matched, feedback) = match item {
            FeedbackItem::Regex {
                regex,
                regex_flags,
                feedback,
            } => (
                build_regex(regex, regex_flags).is_some_and(|re| re.is_match(given)),
                feedback,
            ),
            FeedbackItem::Number {
                number: (min, max),
                feedback,
            } => (
                parse_number(given).is_some_and(|value| *min <= value && value <= *max),
                feedback,
            ),
            FeedbackItem::Fallback { feedback } => (true, feedback),
        };

        if matched {
            return BlankResult {
                feedback: feedback.clone(),
                correct: Some(index == 0),
            };
        }
    }

    BlankResult {
        feedback: NO_MATCH.to_string(),
        correct: Some(false),
    }
}

/// Grades a static problem natively.
fn evaluate_static(config: &FitbConfig, answers: &[String]) -> Result<Evaluation, GradingError> {
    let blanks: Vec<Vec<FeedbackItem>> = config
        .feedback_array
        .iter()
        .map(|items| serde_json::from_value(items.clone()))
        .collect::<Result<_, _>>()
        .map_err(|e| GradingError::Config(format!("FITB feedback is malformed: {}", e)))?;

    let results: Vec<BlankResult> = blanks
        .iter()
        .enumerate()
        .map(|(i, items)| grade_blank(answers.get(i).map(String::as_str).unwrap_or(""), items))
        .collect();

    let correct_count = results.iter().filter(|r| r.correct == Some(true)).count();

    Ok(Evaluation {
        display_feed: results.iter().map(|r| json!(r.feedback)).collect(),
        correct: correct_count == results.len(),
        is_correct_array: results.iter().map(|r| json!(r.correct)).collect(),
        percent: correct_count as f64 / results.len() as f64,
    })
}

impl FitbGrader {
    /// Renders and grades a dynamic problem with the course's bundle.
    async fn evaluate_dynamic(
        &self,
        config: &FitbConfig,
        base_course: &str,
        seed: u64,
        answers: Option<&[String]>,
    ) -> Result<ScriptResult, GradingError> {
        let bundle = ServerSideJs::bundle_path(&self.book_path, base_course);
        let request = json!({
            "seed": seed,
            "dyn_vars": config.dyn_vars,
            "problemHtml": config.problem_html,
            "blankNames": config.blank_names,
            "feedbackArray": config.feedback_array,
            "answer": answers,
        });

        let output = self.js.evaluate_fitb(&bundle, &request).await?;
        let result: ScriptResult = serde_json::from_value(output).map_err(|e| {
            tracing::warn!(bundle = %bundle.display(), "Unexpected server_side.js result: {}", e);
            GradingError::Failure("Unable to grade this question.".to_string())
        })?;

        if answers.is_some() && result.evaluation.is_none() {
            return Err(GradingError::Failure("Unable to grade this question.".to_string()));
        }
        Ok(result)
    }
}

#[async_trait]
impl Grader for FitbGrader {
    async fn grade(&self, ctx: GradingContext<'_>) -> Result<Map<String, Value>, GradingError> {
        let config: FitbConfig = serde_json::from_value(ctx.feedback.clone())
            .map_err(|e| GradingError::Config(format!("FITB feedback is malformed: {}", e)))?;

        if config.feedback_array.is_empty() {
            return Err(GradingError::Failure("This question has no blanks to grade.".into()));
        }

        let answers = ctx.row.answer.as_deref().map(normalize_answer);
        let mut response = Map::new();

        let (problem_html, evaluation) = if config.is_dynamic() {
            let seed = ctx.seed.unwrap_or_else(|| u64::from(rand::random::<u32>()));
            response.insert("seed".into(), json!(seed));
            let result = self
                .evaluate_dynamic(&config, ctx.base_course, seed, answers.as_deref())
                .await?;
            (result.problem_html, result.evaluation)
        } else {
            let evaluation = answers
                .as_deref()
                .map(|answers| evaluate_static(&config, answers))
                .transpose()?;
            (String::new(), evaluation)
        };

        let (Some(answers), Some(evaluation)) = (answers, evaluation) else {
            response.insert("problemHtml".into(), json!(problem_html));
            return Ok(response);
        };

        ctx.row.answer = Some(json!(answers).to_string());
        ctx.row.correct = Some(evaluation.correct);
        ctx.row.percent = Some(evaluation.percent);

        if self.is_exam {
            response.insert("displayFeed".into(), json!(vec![EXAM_FEEDBACK; answers.len()]));
            response.insert("correct".into(), json!(true));
            response.insert("isCorrectArray".into(), json!(vec![true; answers.len()]));
        } else {
            response.insert("displayFeed".into(), json!(evaluation.display_feed));
            response.insert("correct".into(), json!(evaluation.correct));
            response.insert("isCorrectArray".into(), json!(evaluation.is_correct_array));
        }
        response.insert("problemHtml".into(), json!(problem_html));

        Ok(response)
    }

    /// Static problems always replay. Dynamic ones only with the page's seed.
    fn replays_on_fetch(&self, feedback: &Value, seed: Option<u64>) -> bool {
        seed.is_some() || !feedback.get("dyn_vars").is_some_and(is_dynamic)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::answer::{AnswerExtra, AnswerRow};
    use chrono::Utc;
    use std::{path::Path, time::Duration};

    fn grader(is_exam: bool) -> FitbGrader {
        FitbGrader::new(
            is_exam,
            PathBuf::from("/nonexistent"),
            ServerSideJs::new("node", Duration::from_secs(5)),
        )
    }

    /// A book tree with an empty bundle, graded by a stand-in for `node`
    /// that prints `stdout`.
    fn dynamic_grader(stdout: &str) -> (FitbGrader, PathBuf) {
        let book = std::env::temp_dir().join(format!("bookserver-fitb-{}", uuid::Uuid::new_v4()));
        let bundle = ServerSideJs::bundle_path(&book, "fopp");
        std::fs::create_dir_all(bundle.parent().unwrap()).unwrap();
        std::fs::write(&bundle, "").unwrap();

        let script = book.join("fake-node.sh");
        std::fs::write(&script, format!("cat > /dev/null\nprintf '%s' '{}'\n", stdout)).unwrap();
        let js = ServerSideJs::new(format!("sh {}", script.display()), Duration::from_secs(5));
        (FitbGrader::new(false, book.clone(), js), book)
    }

    fn dynamic_config() -> Value {
        json!({
            "blankNames": {},
            "problemHtml": "<p>What is [%= a %] + 1?</p>",
            "dyn_vars": "v.a = Math.floor(rand() * 10);",
            "feedbackArray": [[{"solution_code": "v.a + 1", "feedback": "Right."}]]
        })
    }

    fn row(answer: Option<&str>) -> AnswerRow {
        AnswerRow {
            timestamp: Utc::now(),
            div_id: "test_fitb_string".into(),
            sid: "alice".into(),
            course_name: "fopp".into(),
            answer: answer.map(str::to_string),
            correct: None,
            percent: None,
            source: None,
            extra: AnswerExtra::None,
        }
    }

    fn string_config() -> Value {
        json!({
            "blankNames": {},
            "problemHtml": "",
            "dyn_vars": null,
            "feedbackArray": [
                [
                    {"regex": "^red$", "regexFlags": "", "feedback": "Correct."},
                    {"regex": ".*", "regexFlags": "", "feedback": "Try a color."}
                ],
                [
                    {"regex": "^away$", "regexFlags": "i", "feedback": "Correct."},
                    {"regex": ".*", "regexFlags": "", "feedback": "Where did it go?"}
                ]
            ]
        })
    }

    async fn grade_with(
        grader: &FitbGrader,
        row: &mut AnswerRow,
        config: &Value,
        seed: Option<u64>,
    ) -> Map<String, Value> {
        grader
            .grade(GradingContext {
                row,
                feedback: config,
                base_course: "fopp",
                seed,
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_all_blanks_correct() {
        let config = string_config();
        let mut row = row(Some(r#"["red","away"]"#));
        let feedback = grade_with(&grader(false), &mut row, &config, None).await;

        assert_eq!(row.correct, Some(true));
        assert_eq!(row.percent, Some(1.0));
        assert_eq!(feedback["correct"], true);
        assert_eq!(feedback["isCorrectArray"], json!([true, true]));
        assert_eq!(feedback["displayFeed"], json!(["Correct.", "Correct."]));
    }

    #[tokio::test]
    async fn test_half_correct_and_empty_blank() {
        let config = string_config();
        let mut row = row(Some(r#"["red",""]"#));
        let feedback = grade_with(&grader(false), &mut row, &config, None).await;

        assert_eq!(row.correct, Some(false));
        assert_eq!(row.percent, Some(0.5));
        assert_eq!(feedback["isCorrectArray"], json!([true, null]));
        assert_eq!(feedback["displayFeed"][1], NO_ANSWER);
    }

    #[tokio::test]
    async fn test_wrong_answer_uses_fallback_feedback() {
        let config = string_config();
        let mut row = row(Some(r#"["blue","AWAY"]"#));
        let feedback = grade_with(&grader(false), &mut row, &config, None).await;

        assert_eq!(row.percent, Some(0.5));
        assert_eq!(feedback["displayFeed"], json!(["Try a color.", "Correct."]));
    }

    #[tokio::test]
    async fn test_no_answer_skips_grading() {
        let config = string_config();
        let mut row = row(None);
        let feedback = grade_with(&grader(false), &mut row, &config, None).await;

        assert_eq!(row.correct, None);
        assert_eq!(row.percent, None);
        assert!(feedback.contains_key("problemHtml"));
        assert!(!feedback.contains_key("correct"));
    }

    #[tokio::test]
    async fn test_legacy_csv_matches_json_format() {
        let config = string_config();
        let grader = grader(false);

        let mut json_row = row(Some(r#"["red","away"]"#));
        let json_feedback = grade_with(&grader, &mut json_row, &config, None).await;

        let mut csv_row = row(Some("red,away"));
        let csv_feedback = grade_with(&grader, &mut csv_row, &config, None).await;

        assert_eq!(json_feedback, csv_feedback);
        assert_eq!(json_row.answer, csv_row.answer);
        assert_eq!(json_row.percent, csv_row.percent);
        assert_eq!(csv_row.answer.as_deref(), Some(r#"["red","away"]"#));
    }

    #[tokio::test]
    async fn test_exam_mode_hides_outcome_but_records_it() {
        let config = string_config();
        let mut row = row(Some(r#"["red","nowhere"]"#));
        let feedback = grade_with(&grader(true), &mut row, &config, None).await;

        assert_eq!(row.correct, Some(false));
        assert_eq!(row.percent, Some(0.5));
        assert_eq!(
            feedback["displayFeed"],
            json!(["Response recorded.", "Response recorded."])
        );
        assert_eq!(feedback["isCorrectArray"], json!([true, true]));
        assert_eq!(feedback["correct"], true);
    }

    #[tokio::test]
    async fn test_number_ranges_and_regex_escapes() {
        let config = json!({
            "feedbackArray": [
                [
                    {"number": [6.28, 6.29], "feedback": "Good work!"},
                    {"number": [-1000, 6.27], "feedback": "Too low."},
                    {"regex": ".*", "feedback": "A number, please."}
                ],
                [
                    {"regex": "C:\\\\windows\\\\system", "feedback": "Right."}
                ],
                [
                    {"number": [5, 5], "feedback": "Binary works."}
                ]
            ]
        });
        let mut first = row(Some(r#"[" 6.28 ","C:\\windows\\system","0b101"]"#));
        let feedback = grade_with(&grader(false), &mut first, &config, None).await;
        assert_eq!(feedback["isCorrectArray"], json!([true, true, true]));

        let mut low = row(Some(r#"[" 6","x","7"]"#));
        let feedback = grade_with(&grader(false), &mut low, &config, None).await;
        assert_eq!(feedback["displayFeed"][0], "Too low.");
        assert_eq!(feedback["isCorrectArray"], json!([false, false, false]));
        assert_eq!(low.percent, Some(0.0));
    }

    #[test]
    fn test_normalize_answer() {
        assert_eq!(normalize_answer(r#"["a","b"]"#), vec!["a", "b"]);
        assert_eq!(normalize_answer("a,b"), vec!["a", "b"]);
        assert_eq!(normalize_answer("42"), vec!["42"]);
        assert_eq!(normalize_answer("[1, null]"), vec!["1", ""]);
    }

    #[tokio::test]
    async fn test_malformed_config_is_a_configuration_error() {
        let mut row = row(Some("a"));
        let err = grader(false)
            .grade(GradingContext {
                row: &mut row,
                feedback: &json!({"nope": true}),
                base_course: "fopp",
                seed: None,
            })
            .await
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_feedback_only_item_matches_anything() {
        let config = json!({
            "feedbackArray": [[
                {"regex": "^42$", "feedback": "Correct."},
                {"feedback": "Think about the question."}
            ]]
        });
        let mut row = row(Some("41"));
        let feedback = grade_with(&grader(false), &mut row, &config, None).await;

        assert_eq!(feedback["displayFeed"], json!(["Think about the question."]));
        assert_eq!(feedback["isCorrectArray"], json!([false]));
    }

    #[tokio::test]
    async fn test_dynamic_problem_is_graded_by_the_bundle() {
        let (grader, book) = dynamic_grader(
            r#"{"problemHtml":"<p>What is 3 + 1?</p>","displayFeed":["Right."],"correct":true,"isCorrectArray":[true],"percent":1}"#,
        );
        let mut row = row(Some(r#"["4"]"#));
        let feedback = grade_with(&grader, &mut row, &dynamic_config(), Some(7)).await;

        assert_eq!(feedback["seed"], 7);
        assert_eq!(feedback["problemHtml"], "<p>What is 3 + 1?</p>");
        assert_eq!(feedback["displayFeed"], json!(["Right."]));
        assert_eq!(row.correct, Some(true));
        assert_eq!(row.percent, Some(1.0));
        assert_eq!(row.answer.as_deref(), Some(r#"["4"]"#));

        std::fs::remove_dir_all(book).unwrap();
    }

    #[tokio::test]
    async fn test_dynamic_problem_without_answer_only_renders() {
        let (grader, book) = dynamic_grader(r#"{"problemHtml":"<p>What is 5 + 1?</p>"}"#);
        let mut row = row(None);
        let feedback = grade_with(&grader, &mut row, &dynamic_config(), None).await;

        assert!(feedback["seed"].is_u64());
        assert_eq!(feedback["problemHtml"], "<p>What is 5 + 1?</p>");
        assert!(!feedback.contains_key("correct"));
        assert_eq!(row.correct, None);

        std::fs::remove_dir_all(book).unwrap();
    }

    #[tokio::test]
    async fn test_incomplete_bundle_result_is_recoverable() {
        let (grader, book) = dynamic_grader(r#"{"problemHtml":""}"#);
        let mut row = row(Some(r#"["4"]"#));
        let err = grader
            .grade(GradingContext {
                row: &mut row,
                feedback: &dynamic_config(),
                base_course: "fopp",
                seed: Some(7),
            })
            .await
            .unwrap_err();

        assert!(!err.is_fatal());
        std::fs::remove_dir_all(book).unwrap();
    }

    #[tokio::test]
    async fn test_dynamic_problem_needs_the_bundle() {
        let mut row = row(Some(r#"["4"]"#));
        let err = grader(false)
            .grade(GradingContext {
                row: &mut row,
                feedback: &dynamic_config(),
                base_course: "fopp",
                seed: Some(7),
            })
            .await
            .unwrap_err();

        assert!(err.is_fatal());
        let bundle = ServerSideJs::bundle_path(Path::new("/nonexistent"), "fopp");
        assert!(err.to_string().contains(&bundle.display().to_string()));
    }

    #[test]
    fn test_replay_needs_seed_for_dynamic_problems() {
        let grader = grader(false);
        assert!(grader.replays_on_fetch(&string_config(), None));
        assert!(grader.replays_on_fetch(&dynamic_config(), Some(3)));
        assert!(!grader.replays_on_fetch(&dynamic_config(), None));
        assert!(grader.replays_on_fetch(&json!({"dyn_vars": ""}), None));
    }
}
