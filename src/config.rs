// src/config.rs

use std::{env, path::PathBuf, str::FromStr, time::Duration};

use dotenvy::dotenv;

/// Captured program output kept for storage and for the client.
pub const OUTPUT_TAIL_BYTES: usize = 4096;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub jwt_secret: String,
    pub jwt_expiration: u64,
    pub rust_log: String,
    pub bind_addr: String,

    /// Root of the per-course grading resources (`<book_path>/<base_course>/...`).
    pub book_path: PathBuf,

    /// When set, FITB feedback is suppressed so exam-takers cannot infer answers.
    pub is_exam: bool,

    pub sandbox: SandboxConfig,
    pub build: BuildConfig,
    pub server_js: ServerJsConfig,
}

/// Settings for the long-lived simulator sessions.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub sim_command: String,
    pub workers: usize,
    pub wait: Duration,
}

/// Settings for linked-program builds.
#[derive(Debug, Clone)]
pub struct BuildConfig {
    pub timeout: Duration,
    pub workers: usize,
    pub step_timeout: Duration,
    pub python_command: String,
    pub runguard: Option<String>,
}

/// Settings for running a course's `server_side.js` (dynamic FITB problems).
#[derive(Debug, Clone)]
pub struct ServerJsConfig {
    pub node_command: String,
    pub timeout: Duration,
}

impl Default for ServerJsConfig {
    fn default() -> Self {
        Self {
            node_command: "node".to_string(),
            timeout: Duration::from_secs(10),
        }
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            sim_command: "mdb".to_string(),
            workers: 2,
            wait: Duration::from_secs(15),
        }
    }
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            workers: 4,
            step_timeout: Duration::from_secs(15),
            python_command: "python3".to_string(),
            runguard: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        dotenv().ok();

        let database_url = env::var("DATABASE_URL")
            .expect("DATABASE_URL must be set");

        let jwt_secret = env::var("JWT_SECRET")
            .expect("JWT_SECRET must be set");

        let rust_log = env::var("RUST_LOG")
            .unwrap_or_else(|_| "info".to_string());

        let sandbox = SandboxConfig {
            sim_command: env::var("SIM_COMMAND").unwrap_or_else(|_| "mdb".to_string()),
            workers: parse_var("SANDBOX_WORKERS", 2),
            wait: Duration::from_secs(parse_var("SIM_WAIT_SECS", 15)),
        };

        let build = BuildConfig {
            timeout: Duration::from_secs(parse_var("BUILD_TIMEOUT_SECS", 60)),
            workers: parse_var("BUILD_WORKERS", 4),
            step_timeout: Duration::from_secs(parse_var("STEP_TIMEOUT_SECS", 15)),
            python_command: env::var("PYTHON_COMMAND").unwrap_or_else(|_| "python3".to_string()),
            runguard: env::var("RUNGUARD").ok().filter(|v| !v.is_empty()),
        };

        let server_js = ServerJsConfig {
            node_command: env::var("NODE_COMMAND").unwrap_or_else(|_| "node".to_string()),
            timeout: Duration::from_secs(parse_var("SERVER_JS_TIMEOUT_SECS", 10)),
        };

        Self {
            database_url,
            jwt_secret,
            jwt_expiration: parse_var("JWT_EXPIRATION", 12 * 60 * 60),
            rust_log,
            bind_addr: env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            book_path: env::var("BOOK_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./books")),
            is_exam: parse_var("BOOK_SERVER_EXAM", false),
            sandbox,
            build,
            server_js,
        }
    }
}

/// Reads an optional variable, falling back to `default` when unset.
/// A value that is present but unparsable is a startup error.
fn parse_var<T: FromStr>(name: &str, default: T) -> T {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .unwrap_or_else(|_| panic!("{} has an invalid value: {}", name, raw)),
        Err(_) => default,
    }
}
