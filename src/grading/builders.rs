// src/grading/builders.rs

//! Compiles and runs spliced linked-program sources.
//!
//! Each builder runs a fixed sequence of subprocess steps and appends a
//! titled section per step to a log. The log is what the student sees.

use std::{
    fmt, io,
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
};

use tokio::{io::AsyncWriteExt, process::Command, sync::Semaphore, time::timeout};

use crate::{
    config::BuildConfig,
    sandbox::{SandboxError, SandboxPool, protocol::sim30_script},
};

/// Directory under the Sphinx output holding the build system's libraries.
pub const BUILD_SYSTEM_PATH: &str = "sphinx-enki-info";

const XC16_MCU: &str = "dspic33EP128GP502";
const SIM30_MCU: &str = "dspic33epsuper";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builder {
    Python,
    Rust,
    Xc16,
    Armv7,
}

impl FromStr for Builder {
    type Err = BuildError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "python" => Ok(Builder::Python),
            "rust" => Ok(Builder::Rust),
            "pic24-xc16-bullylib" => Ok(Builder::Xc16),
            "armv7-newlib-sim" => Ok(Builder::Armv7),
            other => Err(BuildError::UnknownBuilder(other.to_string())),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Unknown builder {0}")]
    UnknownBuilder(String),
    #[error("Unknown file extension in {0}.")]
    UnknownExtension(String),
    #[error("{0}")]
    InvalidPath(String),
    #[error("timed out after {0} seconds")]
    Timeout(u64),
    #[error("{0}")]
    Io(#[from] io::Error),
    #[error("{0}")]
    Sandbox(#[from] SandboxError),
}

/// Locations of a course's Sphinx project.
#[derive(Debug, Clone)]
pub struct SphinxPaths {
    /// `<BOOK_PATH>/<base_course>`
    pub base: PathBuf,
    pub source: String,
    pub out: String,
}

impl SphinxPaths {
    fn source_dir(&self) -> PathBuf {
        self.base.join(&self.source)
    }

    /// Where the prebuilt support libraries live.
    fn lib_dir(&self) -> PathBuf {
        self.base.join(&self.out).join(BUILD_SYSTEM_PATH)
    }
}

/// One build of a spliced source file.
#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub builder: Builder,
    /// The spliced file, inside its own scratch directory.
    pub file_path: PathBuf,
    pub sphinx: SphinxPaths,
    /// Path of the template relative to the source tree.
    pub source_path: String,
}

impl BuildRequest {
    fn cwd(&self) -> PathBuf {
        self.file_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default()
    }

    fn source_subdir(&self) -> PathBuf {
        self.sphinx
            .source_dir()
            .join(Path::new(&self.source_path).parent().unwrap_or(Path::new("")))
    }

    fn harness_path(&self) -> PathBuf {
        let stem = Path::new(&self.source_path).with_extension("");
        self.sphinx
            .source_dir()
            .join(format!("{}-test.c", stem.to_string_lossy()))
    }

    fn with_suffix(&self, suffix: &str) -> PathBuf {
        let mut path = self.file_path.clone().into_os_string();
        path.push(suffix);
        PathBuf::from(path)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BuildOutput {
    pub output: String,
    /// 100 when the program verified itself, 0 otherwise.
    pub grade: u8,
}

/// Accumulates the human-readable build transcript.
#[derive(Debug, Default)]
pub struct BuildLog {
    text: String,
}

impl BuildLog {
    fn begin_step(&mut self, desc: &str, cwd: &Path, args: &[String]) {
        if !self.text.is_empty() {
            self.text.push('\n');
        }
        self.text.push_str(desc);
        self.text.push('\n');
        self.text.push_str(&"=".repeat(desc.chars().count()));
        self.text.push('\n');
        self.text
            .push_str(&format!("{}% {}\n", cwd.display(), args.join(" ")));
    }

    fn push(&mut self, text: &str) {
        self.text.push_str(text);
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }
}

impl fmt::Display for BuildLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

enum StepError {
    /// The step ran and failed; the build stops with grade 0.
    Failed,
    Build(BuildError),
}

impl From<BuildError> for StepError {
    fn from(e: BuildError) -> Self {
        StepError::Build(e)
    }
}

impl From<io::Error> for StepError {
    fn from(e: io::Error) -> Self {
        StepError::Build(BuildError::Io(e))
    }
}

impl From<SandboxError> for StepError {
    fn from(e: SandboxError) -> Self {
        StepError::Build(BuildError::Sandbox(e))
    }
}

type StepResult<T> = Result<T, StepError>;

/// Runs one subprocess step, recording its command line and output in `log`.
async fn report_subprocess(
    log: &mut BuildLog,
    args: &[String],
    desc: &str,
    cwd: &Path,
    include_stderr: bool,
    step_timeout: std::time::Duration,
) -> StepResult<()> {
    log.begin_step(desc, cwd, args);

    let Some((program, rest)) = args.split_first() else {
        return Err(StepError::Failed);
    };

    let child = Command::new(program)
        .args(rest)
        .current_dir(cwd)
        .kill_on_drop(true)
        .output();

    match timeout(step_timeout, child).await {
        Ok(output) => {
            let output = output?;
            log.push(&String::from_utf8_lossy(&output.stdout));
            if include_stderr {
                log.push(&String::from_utf8_lossy(&output.stderr));
            }
            if output.status.success() {
                Ok(())
            } else {
                Err(StepError::Failed)
            }
        }
        Err(_) => {
            log.push("Timeout.\n\n");
            Err(StepError::Failed)
        }
    }
}

/// A fresh code for the harness to print after `Correct.`.
pub fn verification_code() -> u32 {
    rand::random::<u32>()
}

/// True when the output ends with `Correct.` followed by `verification_code`.
pub fn check_sim_out(output: &str, verification_code: u32) -> bool {
    let lines: Vec<&str> = output.lines().collect();
    match lines.as_slice() {
        [.., second_to_last, last] => {
            second_to_last.trim_end() == "Correct."
                && last.trim() == verification_code.to_string()
        }
        _ => false,
    }
}

/// Runs builds with a bound on concurrency and on total time.
pub struct BuildService {
    config: BuildConfig,
    permits: Semaphore,
    sandbox: Arc<SandboxPool>,
}

impl BuildService {
    pub fn new(config: BuildConfig, sandbox: Arc<SandboxPool>) -> Self {
        let permits = Semaphore::new(config.workers.max(1));
        Self {
            config,
            permits,
            sandbox,
        }
    }

    /// Builds and runs `request`. The timeout covers waiting for a free
    /// worker as well as the build itself.
    pub async fn build(&self, request: &BuildRequest) -> Result<BuildOutput, BuildError> {
        let limit = self.config.timeout;
        let job = async {
            let _permit = self
                .permits
                .acquire()
                .await
                .map_err(|e| BuildError::Io(io::Error::other(e)))?;
            self.run(request).await
        };

        timeout(limit, job)
            .await
            .map_err(|_| BuildError::Timeout(limit.as_secs()))?
    }

    async fn run(&self, request: &BuildRequest) -> Result<BuildOutput, BuildError> {
        let mut log = BuildLog::default();
        let result = match request.builder {
            Builder::Python => self.python(request, &mut log).await,
            Builder::Rust => self.rust(request, &mut log).await,
            Builder::Xc16 => self.xc16(request, &mut log).await,
            Builder::Armv7 => self.armv7(request, &mut log).await,
        };

        let grade = match result {
            Ok(grade) => grade,
            Err(StepError::Failed) => 0,
            Err(StepError::Build(e)) => return Err(e),
        };
        tracing::debug!(builder = ?request.builder, grade, "Build finished");

        Ok(BuildOutput {
            output: log.text,
            grade,
        })
    }

    async fn step(
        &self,
        log: &mut BuildLog,
        args: Vec<String>,
        desc: &str,
        cwd: &Path,
    ) -> StepResult<()> {
        report_subprocess(log, &args, desc, cwd, true, self.config.step_timeout).await
    }

    /// Prefixes `args` with the resource-limiting wrapper, if configured.
    fn guarded(&self, args: Vec<String>) -> Vec<String> {
        match &self.config.runguard {
            Some(wrapper) => wrapper
                .split_whitespace()
                .map(str::to_string)
                .chain(args)
                .collect(),
            None => args,
        }
    }

    async fn python(&self, request: &BuildRequest, log: &mut BuildLog) -> StepResult<u8> {
        let cwd = request.cwd();
        let run_file = copy_harness(request, &cwd).await;
        let args = self.guarded(vec![self.config.python_command.clone(), run_file]);
        self.step(log, args, "Run", &cwd).await?;
        Ok(100)
    }

    async fn rust(&self, request: &BuildRequest, log: &mut BuildLog) -> StepResult<u8> {
        let cwd = request.cwd();
        let run_file = copy_harness(request, &cwd).await;
        self.step(log, args(["rustc", "--test", run_file.as_str()]), "Compile", &cwd)
            .await?;

        let binary = Path::new(&run_file).with_extension("");
        let args = self.guarded(vec![format!("./{}", binary.to_string_lossy())]);
        self.step(log, args, "Run", &cwd).await?;
        Ok(100)
    }

    fn include_flags(&self, request: &BuildRequest, platform: &str) -> Vec<String> {
        let source = request.sphinx.source_dir();
        vec![
            format!("-I{}", source.join("lib/include").display()),
            format!("-I{}", source.join("tests").display()),
            format!("-I{}", source.join("tests/platform").join(platform).display()),
            format!("-I{}", request.source_subdir().display()),
        ]
    }

    async fn xc16(&self, request: &BuildRequest, log: &mut BuildLog) -> StepResult<u8> {
        let cwd = request.cwd();
        let file = request.file_path.display().to_string();
        let o_path = request.with_suffix(".o");
        let is_asm = match request.file_path.extension().and_then(|e| e.to_str()) {
            Some("s") => true,
            Some("c") => false,
            _ => return Err(BuildError::UnknownExtension(file).into()),
        };

        let compile = if is_asm {
            args([
                "xc16-as",
                "-omf=elf",
                "-g",
                "--processor=33EP128GP502",
                file.as_str(),
                format!("-o{}", o_path.display()).as_str(),
            ])
        } else {
            let mut compile = args([
                "xc16-gcc",
                "-mcpu=33EP128GP502",
                "-omf=elf",
                "-g",
                "-O0",
                "-msmart-io=1",
                "-Wall",
                "-Wextra",
                "-Wdeclaration-after-statement",
            ]);
            compile.extend(self.include_flags(request, "Microchip_PIC24"));
            compile.extend(args(["-DSIM", file.as_str(), "-c", format!("-o{}", o_path.display()).as_str()]));
            compile
        };
        self.step(log, compile, "Compile / Assemble", &cwd).await?;

        let code = verification_code();
        let test_object = request.with_suffix(".test.o");
        let mut harness = args([
            "xc16-gcc",
            "-mcpu=33EP128GP502",
            "-omf=elf",
            "-g",
            "-O0",
            "-msmart-io=1",
            "-Wall",
            "-Wextra",
            "-Wdeclaration-after-statement",
        ]);
        harness.extend(self.include_flags(request, "Microchip_PIC24"));
        harness.extend(vec![
            request.harness_path().display().to_string(),
            "-DSIM".into(),
            format!("-DVERIFICATION_CODE=({}u)", code),
            "-c".into(),
            format!("-o{}", test_object.display()),
        ]);
        self.step(log, harness, "Compile test code", &cwd).await?;

        let elf = request.with_suffix(".elf");
        let source = request.sphinx.source_dir();
        let link = vec![
            "xc16-gcc".to_string(),
            "-omf=elf".into(),
            "-Wl,--heap=100,--stack=16,--check-sections,--data-init,--pack-data,--handles,--isr,--no-gc-sections,--fill-upper=0,--stackguard=16,--no-force-link,--smart-io".into(),
            format!("-Wl,--script={}", source.join("lib/lkr/p33EP128GP502_bootldr.gld").display()),
            test_object.display().to_string(),
            o_path.display().to_string(),
            "-lpic24_stdlib".into(),
            format!("-L{}", request.sphinx.lib_dir().display()),
            format!("-o{}", elf.display()),
        ];
        self.step(log, link, "Link", &cwd).await?;

        if !is_asm {
            let output = self.sandbox.run(XC16_MCU, &elf).await?;
            log.push(&output);
            return Ok(grade_for(log, code));
        }

        self.sim30(request, log, &elf, code).await
    }

    /// Runs an assembly program through a one-shot SIM30 process.
    async fn sim30(
        &self,
        request: &BuildRequest,
        log: &mut BuildLog,
        elf: &Path,
        code: u32,
    ) -> StepResult<u8> {
        let cwd = request.cwd();
        let simout = request.with_suffix(".simout");
        let script = sim30_script(SIM30_MCU, elf, &simout).map_err(BuildError::InvalidPath)?;

        log.begin_step("Simulation", &cwd, &args(["sim30"]));
        let mut child = Command::new("sim30")
            .current_dir(&cwd)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(script.as_bytes()).await?;
        }

        let (succeeded, timed_out) =
            match timeout(self.config.step_timeout, child.wait_with_output()).await {
                Ok(output) => (output?.status.success(), false),
                Err(_) => (false, true),
            };

        match tokio::fs::read(&simout).await {
            Ok(bytes) => log.push(String::from_utf8_lossy(&bytes).trim_end()),
            Err(e) => log.push(&format!(
                "No simulation output produced in {} - {}.\n",
                simout.display(),
                e
            )),
        }
        if timed_out {
            log.push("\n\nTimeout.");
        }

        Ok(if succeeded { grade_for(log, code) } else { 0 })
    }

    async fn armv7(&self, request: &BuildRequest, log: &mut BuildLog) -> StepResult<u8> {
        let cwd = request.cwd();
        let file = request.file_path.display().to_string();
        let o_path = request.with_suffix(".o");
        let warnings = ["-g", "-O0", "-Wall", "-Wextra", "-Wdeclaration-after-statement"];

        let mut compile = args(["arm-none-eabi-gcc", file.as_str()]);
        compile.extend(args(warnings));
        compile.extend(self.include_flags(request, "ARMv7-A_ARMv7-R"));
        compile.extend(args(["-c", format!("-o{}", o_path.display()).as_str()]));
        self.step(log, compile, "Compile / Assemble", &cwd).await?;

        let code = verification_code();
        let test_object = request.with_suffix(".test.o");
        let mut harness = vec![
            "arm-none-eabi-gcc".to_string(),
            request.harness_path().display().to_string(),
            format!("-DVERIFICATION_CODE=({}u)", code),
        ];
        harness.extend(args(warnings));
        harness.extend(self.include_flags(request, "ARMv7-A_ARMv7-R"));
        harness.extend(args(["-c", format!("-o{}", test_object.display()).as_str()]));
        self.step(log, harness, "Compile test code", &cwd).await?;

        let elf = request.with_suffix(".elf");
        let platform = request.sphinx.source_dir().join("tests/platform/ARMv7-A_ARMv7-R");
        let link = vec![
            "arm-none-eabi-gcc".to_string(),
            o_path.display().to_string(),
            test_object.display().to_string(),
            "-o".into(),
            elf.display().to_string(),
            platform.join("interrupts.S").display().to_string(),
            "-larmv7_stdlib".into(),
            format!("-L{}", request.sphinx.lib_dir().display()),
            "-T".into(),
            platform.join("redboot.ld").display().to_string(),
            "--specs=/usr/lib/arm-none-eabi/newlib/aprofile-ve.specs".into(),
            "-Wl,--section-start=.text=0x60010000".into(),
        ];
        self.step(log, link, "Link", &cwd).await?;

        let bin = request.with_suffix(".bin");
        let objcopy = args([
            "arm-none-eabi-objcopy",
            "-O",
            "binary",
            elf.display().to_string().as_str(),
            bin.display().to_string().as_str(),
        ]);
        self.step(log, objcopy, "Transform to bin", &cwd).await?;

        let simulate = args([
            "qemu-system-arm",
            "-M",
            "vexpress-a9",
            "-m",
            "32M",
            "-no-reboot",
            "-nographic",
            "-audiodev",
            "id=none,driver=none",
            "-monitor",
            "none",
            "-kernel",
            bin.display().to_string().as_str(),
            "-serial",
            "stdio",
            "-semihosting",
        ]);
        report_subprocess(log, &simulate, "Simulate", &cwd, false, self.config.step_timeout)
            .await?;

        Ok(grade_for(log, code))
    }
}

fn grade_for(log: &BuildLog, code: u32) -> u8 {
    if check_sim_out(log.as_str(), code) { 100 } else { 0 }
}

fn args<'a>(parts: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    parts.into_iter().map(str::to_string).collect()
}

/// Copies `<name>-test.<ext>` next to the spliced file when the course has
/// one, and returns the file name to run.
async fn copy_harness(request: &BuildRequest, cwd: &Path) -> String {
    let file_name = request
        .file_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let path = Path::new(&file_name);
    let stem = path.file_stem().map(|s| s.to_string_lossy()).unwrap_or_default();
    let ext = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    let test_name = format!("{}-test{}", stem, ext);

    match tokio::fs::copy(request.source_subdir().join(&test_name), cwd.join(&test_name)).await {
        Ok(_) => test_name,
        Err(_) => file_name,
    }
}
