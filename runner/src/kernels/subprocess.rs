use super::KernelError;
use crate::{
    filehandle::{FileHandle, FileHandleError, Session, TMP_DIR},
    record::{Record, Value, CMD, OUTPUT},
    template::{Template, TemplateError},
};
use globset::{GlobBuilder, GlobMatcher};
use ignore::WalkBuilder;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    io::Read,
    os::unix::process::ExitStatusExt,
    path::{Path, PathBuf},
    process::{Command, ExitStatus, Stdio},
    sync::Arc,
    thread,
    time::{Duration, Instant},
};
use tracing::{debug, instrument, trace, warn};
use wait_timeout::ChildExt;

/// output name that is satisfied by the captured text instead of a file
pub const STDOUT: &str = "STDOUT";
/// returncode of commands killed after running into their timeout
pub const TIMEOUT_RETURNCODE: i64 = 124;
pub const DEFAULT_SHELL: &str = "/bin/sh";

/// Where a command runs
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum WorkDir {
    /// a fresh temporary directory per invocation, removed afterwards
    #[default]
    Scratch,
    /// the working directory of the process
    Inherit,
}

#[derive(Debug, Clone)]
enum OutputPattern {
    Stdout,
    File(String),
    Glob(GlobMatcher),
}

/// Runs a shell command built from a template or from the record's `cmd`
#[derive(Debug, Clone)]
pub struct SubprocessKernel {
    template: Option<Template>,
    shell: String,
    timeout: Option<Duration>,
    workdir: WorkDir,
    inputs: BTreeMap<String, String>,
    outputs: BTreeMap<String, OutputPattern>,
    constants: BTreeMap<String, Value>,
    session: Arc<Session>,
}

/// A file that has to be put into the work dir before the command starts
struct Staged {
    name: String,
    handle: FileHandle,
}

/// Result of a finished or killed child
struct Finished {
    returncode: i64,
    output: String,
}

impl SubprocessKernel {
    pub fn new(template: &str) -> Result<Self, TemplateError> {
        Ok(Self {
            template: Some(Template::parse(template)?),
            ..Self::from_record_cmd()
        })
    }

    /// Kernel without own template, it runs whatever `cmd` the record carries
    pub fn from_record_cmd() -> Self {
        Self {
            template: None,
            shell: DEFAULT_SHELL.to_string(),
            timeout: None,
            workdir: WorkDir::default(),
            inputs: BTreeMap::new(),
            outputs: BTreeMap::new(),
            constants: BTreeMap::new(),
            session: Arc::new(Session::default()),
        }
    }

    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_workdir(mut self, workdir: WorkDir) -> Self {
        self.workdir = workdir;
        self
    }

    pub fn with_session(mut self, session: Arc<Session>) -> Self {
        self.session = session;
        self
    }

    pub fn template(&self) -> Option<&Template> {
        self.template.as_ref()
    }

    pub fn shell(&self) -> &str {
        &self.shell
    }

    /// Record keys holding files, staged into the work dir under the given names
    ///
    /// A list of files needs a name with `*` or `?`, which is replaced by a running number.
    pub fn set_inputs<K, V>(&mut self, inputs: impl IntoIterator<Item = (K, V)>)
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.inputs = inputs
            .into_iter()
            .map(|(key, name)| (key.into(), name.into()))
            .filter(|(key, _)| !self.constants.contains_key(key))
            .collect();
    }

    /// Files collected into the record after a successful run, keyed by record key
    ///
    /// Patterns with `*`, `?` or `[` collect a list of files, `STDOUT` copies the output.
    pub fn set_outputs<K, V>(
        &mut self,
        outputs: impl IntoIterator<Item = (K, V)>,
    ) -> Result<(), KernelError>
    where
        K: Into<String>,
        V: Into<String>,
    {
        let mut compiled = BTreeMap::new();

        for (key, pattern) in outputs {
            let pattern = pattern.into();

            let output = if pattern == STDOUT {
                OutputPattern::Stdout
            } else if pattern.contains(&['*', '?', '['][..]) {
                let matcher = GlobBuilder::new(&pattern)
                    .literal_separator(true)
                    .build()
                    .map(|glob| glob.compile_matcher())
                    .map_err(|error| KernelError::OutputPattern {
                        pattern: pattern.clone(),
                        message: error.to_string(),
                    })?;

                OutputPattern::Glob(matcher)
            } else if pattern.contains('/') {
                return Err(KernelError::OutputPattern {
                    pattern,
                    message: "outputs must be plain file names in the work dir".to_string(),
                });
            } else {
                OutputPattern::File(pattern)
            };

            compiled.insert(key.into(), output);
        }

        self.outputs = compiled;
        Ok(())
    }

    /// Kernel scoped value, a string naming an existing path is loaded as a file
    pub fn set_constant(
        &mut self,
        key: impl Into<String>,
        value: impl Into<Value>,
    ) -> Result<(), FileHandleError> {
        let key = key.into();
        let value = match value.into() {
            Value::Str(path) if Path::new(&path).exists() => Value::File(self.session.load(&path)?),
            value => value,
        };

        self.inputs.remove(&key);
        self.constants.insert(key, value);

        Ok(())
    }

    #[instrument(skip_all, level = "debug")]
    pub fn run(&self, record: Record, dryrun: bool) -> Record {
        if record.is_failed() {
            return record;
        }

        let mut output = record;
        if output.returncode().is_none() {
            output.succeed();
        }

        let (context, staged) = match self.context(&output) {
            Ok(prepared) => prepared,
            Err(message) => {
                output.fail(1, message);
                return output;
            }
        };

        let cmd = match &self.template {
            Some(template) => match template.render(&context) {
                Ok(cmd) => cmd,
                Err(error) => {
                    output.fail(1, error.to_string());
                    return output;
                }
            },
            None => match output.cmd() {
                Some(cmd) => cmd.to_string(),
                None => {
                    output.fail(1, "No command template and no 'cmd' in the record");
                    return output;
                }
            },
        };

        output.insert(CMD, cmd.as_str());
        if dryrun {
            return output;
        }

        let scratch = match self.workdir {
            WorkDir::Scratch => match tempfile::Builder::new()
                .prefix("xflow-")
                .tempdir_in(TMP_DIR.as_path())
            {
                Ok(dir) => Some(dir),
                Err(error) => {
                    output.fail(1, format!("Failed to create a scratch directory: {error}"));
                    return output;
                }
            },
            WorkDir::Inherit => None,
        };
        let dir = scratch
            .as_ref()
            .map(|dir| dir.path().to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));

        for file in &staged {
            if let Err(error) = file.handle.save(dir.join(&file.name)) {
                output.fail(1, error.to_string());
                return output;
            }
        }

        let finished = self.execute(&cmd, &dir);
        if finished.returncode != 0 {
            output.fail(finished.returncode, finished.output);
            return output;
        }
        output.insert(OUTPUT, finished.output);

        if let Err(message) = self.collect(&mut output, &dir) {
            output.fail(1, message);
        }

        output
    }

    /// Values the template is rendered against, plus the files that must be staged
    fn context(&self, record: &Record) -> Result<(Record, Vec<Staged>), String> {
        let mut context = record.clone();
        let mut staged = Vec::new();

        for (key, name) in &self.inputs {
            match record.get(key) {
                Some(Value::File(handle)) => {
                    staged.push(Staged {
                        name: name.clone(),
                        handle: handle.clone(),
                    });
                    context.insert(key.as_str(), name.as_str());
                }
                Some(Value::Files(handles)) => {
                    let names = numbered_names(name, handles.len())?;
                    context.insert(key.as_str(), names.clone());
                    staged.extend(
                        names
                            .into_iter()
                            .zip(handles)
                            .map(|(name, handle)| Staged {
                                name,
                                handle: handle.clone(),
                            }),
                    );
                }
                Some(other) => return Err(format!("Input '{key}' = '{other}' is not a file")),
                None => return Err(format!("Input '{key}' is not present in the record")),
            }
        }

        for (key, value) in &self.constants {
            match value {
                Value::File(handle) => {
                    let name = handle
                        .origin()
                        .file_name()
                        .map(|name| name.to_string_lossy().into_owned())
                        .unwrap_or_else(|| key.clone());
                    context.insert(key.as_str(), name.as_str());
                    staged.push(Staged {
                        name,
                        handle: handle.clone(),
                    });
                }
                value => {
                    context.insert(key.as_str(), value.clone());
                }
            }
        }

        Ok((context, staged))
    }

    fn execute(&self, cmd: &str, dir: &Path) -> Finished {
        let start = Instant::now();
        debug!(cmd, dir = ?dir, "Spawning command");

        let mut child = match Command::new(&self.shell)
            .arg("-c")
            // merge stderr into stdout for the whole command line
            .arg(format!("exec 2>&1\n{cmd}"))
            .current_dir(dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
        {
            Ok(child) => child,
            Err(error) => {
                return Finished {
                    returncode: 1,
                    output: format!("Failed to spawn '{}': {error}", self.shell),
                }
            }
        };

        // drain the pipe while waiting, a full pipe would block the child forever
        let reader = child.stdout.take().map(|mut stdout| {
            thread::spawn(move || {
                let mut buffer = Vec::new();
                if let Err(error) = stdout.read_to_end(&mut buffer) {
                    warn!(error = ?error, read = buffer.len(), "Failed to read command output, it is truncated");
                }
                String::from_utf8_lossy(&buffer).into_owned()
            })
        });

        let status = match self.timeout {
            Some(timeout) => child.wait_timeout(timeout),
            None => child.wait().map(Some),
        };

        let returncode = match status {
            Ok(Some(status)) => exit_code(status),
            Ok(None) => {
                warn!(cmd, timeout = ?self.timeout, "Command ran into its timeout");
                if let Err(error) = child.kill().and_then(|()| child.wait()) {
                    warn!(error = ?error, "Failed to kill timed out command");
                }

                // processes started by the command may still hold the pipe, don't wait on them
                return Finished {
                    returncode: TIMEOUT_RETURNCODE,
                    output: format!(
                        "Command timed out after {}s",
                        self.timeout.unwrap_or_default().as_secs_f64()
                    ),
                };
            }
            Err(error) => {
                return Finished {
                    returncode: 1,
                    output: format!("Failed to wait for command: {error}"),
                }
            }
        };

        let output = reader
            .and_then(|reader| reader.join().ok())
            .unwrap_or_default();

        debug!(
            returncode,
            elapsed = ?start.elapsed(),
            "Command finished"
        );
        trace!("Output: {output}");

        Finished { returncode, output }
    }

    /// Load the declared outputs of a successful run into the record
    fn collect(&self, output: &mut Record, dir: &Path) -> Result<(), String> {
        for (key, pattern) in &self.outputs {
            match pattern {
                OutputPattern::Stdout => {
                    let text = output.output().unwrap_or_default().to_string();
                    output.insert(key.as_str(), text);
                }
                OutputPattern::File(name) => {
                    let path = dir.join(name);
                    if !path.is_file() {
                        return Err(format!("Expected output '{name}' was not produced"));
                    }

                    let handle = self.session.load(&path).map_err(|error| error.to_string())?;
                    output.insert(key.as_str(), handle);
                }
                OutputPattern::Glob(matcher) => {
                    let handles = WalkBuilder::new(dir)
                        .max_depth(Some(1))
                        .standard_filters(false)
                        .build()
                        .filter_map(|entry| match entry {
                            Ok(entry) => Some(entry),
                            Err(error) => {
                                warn!("Failed to search for outputs: {error}");
                                None
                            }
                        })
                        .filter(|entry| entry.file_type().map_or(false, |kind| kind.is_file()))
                        .map(|entry| entry.into_path())
                        .filter(|path| {
                            path.file_name()
                                .map_or(false, |name| matcher.is_match(Path::new(name)))
                        })
                        .sorted()
                        .map(|path| self.session.load(path))
                        .collect::<Result<Vec<_>, _>>()
                        .map_err(|error| error.to_string())?;

                    output.insert(key.as_str(), handles);
                }
            }
        }

        Ok(())
    }
}

fn exit_code(status: ExitStatus) -> i64 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code.into(),
        (None, Some(signal)) => 128 + i64::from(signal),
        (None, None) => 1,
    }
}

/// `frame*.pdb` with 12 files gives `frame00.pdb` up to `frame11.pdb`
fn numbered_names(pattern: &str, count: usize) -> Result<Vec<String>, String> {
    let digits = count.max(1).to_string().len();

    let (prefix, suffix, width) = if let Some((prefix, suffix)) = pattern.split_once('*') {
        (prefix, suffix, digits)
    } else if let Some(start) = pattern.find('?') {
        let width = pattern[start..].chars().take_while(|c| *c == '?').count();
        if width < digits {
            return Err(format!("Too many files ({count}) for pattern '{pattern}'"));
        }

        (&pattern[..start], &pattern[start + width..], width)
    } else {
        return Err(format!(
            "Input pattern '{pattern}' must contain '*' or '?' to hold a list of files"
        ));
    };

    Ok((0..count)
        .map(|index| format!("{prefix}{index:0width$}{suffix}"))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbered_names_fill_patterns() {
        assert_eq!(
            numbered_names("frame*.pdb", 3).unwrap(),
            vec!["frame0.pdb", "frame1.pdb", "frame2.pdb"]
        );
        assert_eq!(numbered_names("frame*.pdb", 11).unwrap()[10], "frame10.pdb");
        assert_eq!(numbered_names("frame*.pdb", 11).unwrap()[0], "frame00.pdb");
        assert_eq!(
            numbered_names("run???.log", 2).unwrap(),
            vec!["run000.log", "run001.log"]
        );
        assert!(numbered_names("run?.log", 11).is_err());
        assert!(numbered_names("plain.log", 2).is_err());
    }

    #[test]
    fn bad_output_patterns() {
        let mut kernel = SubprocessKernel::from_record_cmd();

        assert!(kernel.set_outputs([("traj", "*.dcd"), ("log", STDOUT)]).is_ok());
        assert!(matches!(
            kernel.set_outputs([("traj", "out/traj.dcd")]),
            Err(KernelError::OutputPattern { .. })
        ));
        assert!(matches!(
            kernel.set_outputs([("traj", "[.dcd")]),
            Err(KernelError::OutputPattern { .. })
        ));
    }

    #[test]
    fn constants_replace_inputs() {
        let mut kernel = SubprocessKernel::new("cat {topology}").unwrap();
        kernel.set_inputs([("topology", "top.prmtop")]);
        kernel.set_constant("topology", "no such file here").unwrap();

        assert!(kernel.inputs.is_empty());
        assert_eq!(
            kernel.constants.get("topology"),
            Some(&Value::from("no such file here"))
        );
    }

    #[test]
    fn exit_code_from_signal() {
        assert_eq!(exit_code(ExitStatus::from_raw(0)), 0);
        assert_eq!(exit_code(ExitStatus::from_raw(3 << 8)), 3);
        assert_eq!(exit_code(ExitStatus::from_raw(9)), 137);
    }
}
