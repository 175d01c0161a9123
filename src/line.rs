use std::ffi::{CString, NulError};
use std::fmt;
use std::path::{Path, PathBuf};

/// Arguments of one pipeline stage. `argv[0]` is the program name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArgVector {
    args: Vec<String>,
}

impl ArgVector {
    pub fn push(&mut self, arg: String) {
        self.args.push(arg);
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.args.iter().map(String::as_str)
    }

    pub fn program(&self) -> Option<&str> {
        self.args.first().map(String::as_str)
    }

    /// Exec form of the arguments. `execvp` appends the NULL sentinel.
    pub fn to_exec(&self) -> Result<Vec<CString>, NulError> {
        self.args.iter().map(|arg| CString::new(arg.as_bytes())).collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Stage {
    argv: ArgVector,
}

impl Stage {
    pub fn argv(&self) -> &ArgVector {
        &self.argv
    }

    pub fn program(&self) -> Option<&str> {
        self.argv.program()
    }
}

/// Stages connected left to right by anonymous pipes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pipeline {
    stages: Vec<Stage>,
}

impl Pipeline {
    fn new() -> Self {
        Self {
            stages: vec![Stage::default()],
        }
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    fn current_stage_mut(&mut self) -> &mut Stage {
        // A pipeline is created with one stage and only ever grows.
        let last = self.stages.len() - 1;
        &mut self.stages[last]
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    pipeline: Pipeline,
    input: Option<PathBuf>,
    output: Option<PathBuf>,
    background: bool,
}

impl Statement {
    fn new(background: bool) -> Self {
        Self {
            pipeline: Pipeline::new(),
            input: None,
            output: None,
            background,
        }
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn input(&self) -> Option<&Path> {
        self.input.as_deref()
    }

    pub fn output(&self) -> Option<&Path> {
        self.output.as_deref()
    }

    pub fn background(&self) -> bool {
        self.background
    }

    pub fn set_input(&mut self, path: impl Into<PathBuf>) {
        self.input = Some(path.into());
    }

    pub fn set_output(&mut self, path: impl Into<PathBuf>) {
        self.output = Some(path.into());
    }

    pub fn set_background(&mut self, background: bool) {
        self.background = background;
    }

    pub fn current_stage(&self) -> &Stage {
        let stages = self.pipeline.stages();
        &stages[stages.len() - 1]
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, stage) in self.pipeline.stages().iter().enumerate() {
            if i > 0 {
                f.write_str(" | ")?;
            }
            let words: Vec<&str> = stage.argv().iter().collect();
            f.write_str(&words.join(" "))?;
        }
        if let Some(input) = &self.input {
            write!(f, " < {}", input.display())?;
        }
        if let Some(output) = &self.output {
            write!(f, " > {}", output.display())?;
        }
        if self.background {
            f.write_str(" &")?;
        }
        Ok(())
    }
}

/// Flags scoped to one input line. Copied into every supervising process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LineStatus {
    error_occurred: bool,
    exit_requested: bool,
}

impl LineStatus {
    pub fn error_occurred(&self) -> bool {
        self.error_occurred
    }

    pub fn mark_error(&mut self) {
        self.error_occurred = true;
    }

    pub fn exit_requested(&self) -> bool {
        self.exit_requested
    }
}

/// Everything parsed from one line of input.
#[derive(Debug, Default)]
pub struct InputLine {
    statements: Vec<Statement>,
    status: LineStatus,
}

impl InputLine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops the previous tree and clears both flags.
    pub fn start_new_line(&mut self) {
        self.statements.clear();
        self.status = LineStatus::default();
    }

    pub fn append_statement(&mut self, background: bool) -> &mut Statement {
        self.statements.push(Statement::new(background));
        let last = self.statements.len() - 1;
        &mut self.statements[last]
    }

    /// Appends to the current stage. A quoted token loses its first and last character.
    pub fn append_argument(&mut self, text: &str, is_quoted: bool) {
        let arg = if is_quoted {
            strip_delimiters(text)
        } else {
            text
        };
        self.current_or_new()
            .pipeline
            .current_stage_mut()
            .argv
            .push(arg.to_string());
    }

    pub fn append_stage(&mut self) {
        self.current_or_new().pipeline.stages.push(Stage::default());
    }

    pub fn current_statement_mut(&mut self) -> Option<&mut Statement> {
        self.statements.last_mut()
    }

    pub fn request_exit(&mut self) {
        self.status.exit_requested = true;
    }

    pub fn statements(&self) -> &[Statement] {
        &self.statements
    }

    pub fn len(&self) -> usize {
        self.statements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }

    pub fn status(&self) -> LineStatus {
        self.status
    }

    pub fn error_occurred(&self) -> bool {
        self.status.error_occurred()
    }

    pub fn exit_requested(&self) -> bool {
        self.status.exit_requested()
    }

    /// Statements and the mutable status, borrowed separately for the runner.
    pub fn parts_mut(&mut self) -> (&[Statement], &mut LineStatus) {
        (&self.statements, &mut self.status)
    }

    fn current_or_new(&mut self) -> &mut Statement {
        if self.statements.is_empty() {
            return self.append_statement(false);
        }
        let last = self.statements.len() - 1;
        &mut self.statements[last]
    }
}

fn strip_delimiters(text: &str) -> &str {
    let mut chars = text.chars();
    if chars.next().is_none() || chars.next_back().is_none() {
        return "";
    }
    chars.as_str()
}
