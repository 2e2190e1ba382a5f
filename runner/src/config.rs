use crate::{
    clients::{ClientError, Clients},
    filehandle::{FileHandleError, FileHandlerKind, Session},
    kernels::{
        subprocess::DEFAULT_SHELL, DummyKernel, FunctionRegistry, InterfaceKernel, Kernel,
        KernelError, SubprocessKernel, WorkDir,
    },
    pipeline::Pipeline,
    record::{Payload, Value},
};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs::{self, File},
    io::Error,
    os::unix::fs::MetadataExt,
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
    time::Duration,
};
use thiserror::Error;
use tracing::{debug, error, warn};

// check if a file is executable
pub fn check_executable(path: &Path) -> Result<bool, ConfigErrors> {
    if !path.is_file() {
        Err(ConfigErrors::FileNotFound)
    } else {
        match File::open(path).map(|file| file.metadata()) {
            Ok(Ok(metadata)) => Ok((metadata.mode() & 0o111) != 0),
            Ok(Err(e)) | Err(e) => Err(ConfigErrors::MetadataNotFound(e)),
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigErrors {
    #[error("Failed to read {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: Error,
    },
    #[error("Pipeline definition is invalid: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Client not supported: {0}")]
    UnsupportedClient(String),
    #[error("Client failed to load: {0}")]
    FailedLoadClient(#[from] ClientError),
    #[error("Kernel {index} is invalid: {source}")]
    Kernel {
        index: usize,
        #[source]
        source: KernelError,
    },
    #[error("File handling failed: {0}")]
    FileHandle(#[from] FileHandleError),
    #[error("File not found")]
    FileNotFound,
    #[error("Metadata not found")]
    MetadataNotFound(#[from] Error),
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    // client config, selects where tasks run
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub files: FilesConfig,
    // default shell for all subprocess kernels
    #[serde(default = "default_shell")]
    pub shell: PathBuf,
    pub kernels: Vec<KernelConfig>,
    // a record or a list of records, may be replaced from the command line
    pub inputs: Option<Payload>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct ClientConfig {
    // Name of the selected client, see Clients::load for the selection process
    #[serde(default = "default_client")]
    pub name: String,
    // parameters for the client, e.g. `threads` for the local client
    pub parameter: Option<BTreeMap<String, serde_yaml::Value>>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            name: default_client(),
            parameter: None,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct FilesConfig {
    #[serde(default)]
    pub handler: FileHandlerKind,
    // used when $SHARED is not set
    pub shared_dir: Option<PathBuf>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(rename_all = "lowercase")]
pub enum KernelConfig {
    /// connection lines, e.g. `rep ]= {reps}`
    Interface(Vec<String>),
    Subprocess(SubprocessConfig),
    /// name of a function in the registry passed to `build`
    Function(String),
    Dummy(DummyConfig),
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct SubprocessConfig {
    // without a template the record's cmd is run
    pub template: Option<String>,
    pub shell: Option<PathBuf>,
    // seconds
    pub timeout: Option<u64>,
    #[serde(default)]
    pub workdir: WorkDir,
    // record key -> file name in the work dir
    #[serde(default)]
    pub inputs: BTreeMap<String, String>,
    // record key -> file name, glob or STDOUT
    #[serde(default)]
    pub outputs: BTreeMap<String, String>,
    #[serde(default)]
    pub constants: BTreeMap<String, Value>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct DummyConfig {
    #[serde(default)]
    pub fail: bool,
    #[serde(default = "default_returncode")]
    pub returncode: i64,
    #[serde(default = "default_message")]
    pub message: String,
}

impl FromStr for PipelineConfig {
    type Err = ConfigErrors;

    fn from_str(source: &str) -> Result<Self, Self::Err> {
        Ok(serde_yaml::from_str(source)?)
    }
}

impl PipelineConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigErrors> {
        let source = fs::read_to_string(path).map_err(|source| ConfigErrors::Read {
            path: path.to_path_buf(),
            source,
        })?;

        debug!("Loaded pipeline definition from {}", path.to_string_lossy());
        source.parse()
    }

    /// File handling context for one run of this pipeline
    pub fn session(&self) -> Session {
        let session = Session::new(self.files.handler);

        match &self.files.shared_dir {
            Some(dir) => session.with_shared_dir(dir),
            None => session,
        }
    }

    pub fn preflight_checks(&self) -> bool {
        // attempt to catch all errors instead of piece-by-piece to make debugging easier for users
        let mut contains_error = false;

        if self.kernels.is_empty() {
            error!("No kernel was defined, the pipeline would do nothing");
            contains_error = true;
        }

        if let Some(Some(threads)) = self
            .client
            .parameter
            .as_ref()
            .map(|parameters| parameters.get("threads"))
        {
            match threads.as_u64() {
                Some(0) => {
                    error!("client.parameter.threads cannot be 0");
                    contains_error = true;
                }
                Some(_) => {}
                None => {
                    error!("client.parameter.threads must be a natural number");
                    contains_error = true;
                }
            }
        }

        if self.files.handler == FileHandlerKind::Shared
            && self.files.shared_dir.is_none()
            && std::env::var_os(crate::filehandle::SHARED_ENV).is_none()
        {
            error!("files.handler is 'shared' but neither files.shared_dir nor $SHARED is set");
            contains_error = true;
        }

        let shells = std::iter::once(("shell".to_string(), &self.shell)).chain(
            self.kernels
                .iter()
                .enumerate()
                .filter_map(|(index, kernel)| match kernel {
                    KernelConfig::Subprocess(SubprocessConfig {
                        shell: Some(shell), ..
                    }) => Some((format!("kernels.{index}.shell"), shell)),
                    _ => None,
                }),
        );

        for (name, shell) in shells {
            match check_executable(shell) {
                Ok(true) => {}
                Ok(false) => {
                    error!("{name} ({}) is not executable", shell.to_string_lossy());
                    contains_error = true;
                }
                Err(e) => {
                    error!(
                        "Failed to determine if {name} ({}) is an executable: {e}",
                        shell.to_string_lossy()
                    );
                    contains_error = true;
                }
            }
        }

        for (index, kernel) in self.kernels.iter().enumerate() {
            match kernel {
                KernelConfig::Interface(lines) if lines.is_empty() => {
                    warn!("kernels.{index} is an interface without connections, it only sets returncode");
                }
                KernelConfig::Subprocess(SubprocessConfig {
                    timeout: Some(0), ..
                }) => {
                    error!("kernels.{index}.timeout cannot be 0");
                    contains_error = true;
                }
                KernelConfig::Dummy(DummyConfig {
                    fail: true,
                    returncode: 0,
                    ..
                }) => {
                    error!("kernels.{index} is a failing dummy with returncode 0");
                    contains_error = true;
                }
                _ => {}
            }
        }

        contains_error
    }

    /// Turn the kernel definitions into kernels
    pub fn build_kernels(
        &self,
        session: &Arc<Session>,
        registry: &FunctionRegistry,
    ) -> Result<Vec<Kernel>, ConfigErrors> {
        self.kernels
            .iter()
            .enumerate()
            .map(|(index, config)| {
                self.build_kernel(config, session, registry)
                    .map_err(|error| match error {
                        ConfigErrors::Kernel { source, .. } => {
                            ConfigErrors::Kernel { index, source }
                        }
                        error => error,
                    })
            })
            .collect()
    }

    fn build_kernel(
        &self,
        config: &KernelConfig,
        session: &Arc<Session>,
        registry: &FunctionRegistry,
    ) -> Result<Kernel, ConfigErrors> {
        let invalid = |source: KernelError| ConfigErrors::Kernel { index: 0, source };

        Ok(match config {
            KernelConfig::Interface(lines) => InterfaceKernel::parse(lines)
                .map_err(|error| invalid(error.into()))?
                .into(),
            KernelConfig::Subprocess(config) => {
                let kernel = match &config.template {
                    Some(template) => {
                        SubprocessKernel::new(template).map_err(|error| invalid(error.into()))?
                    }
                    None => SubprocessKernel::from_record_cmd(),
                };

                let shell = config.shell.as_ref().unwrap_or(&self.shell);
                let mut kernel = kernel
                    .with_shell(shell.to_string_lossy())
                    .with_workdir(config.workdir)
                    .with_session(session.clone());
                if let Some(timeout) = config.timeout {
                    kernel = kernel.with_timeout(Duration::from_secs(timeout));
                }

                kernel.set_inputs(config.inputs.clone());
                kernel.set_outputs(config.outputs.clone()).map_err(invalid)?;
                for (key, value) in &config.constants {
                    kernel.set_constant(key.as_str(), value.clone())?;
                }

                kernel.into()
            }
            KernelConfig::Function(name) => registry.kernel(name).map_err(invalid)?.into(),
            KernelConfig::Dummy(config) if config.fail => {
                DummyKernel::failing(config.returncode, config.message.as_str())
                    .map_err(invalid)?
                    .into()
            }
            KernelConfig::Dummy(_) => DummyKernel::new().into(),
        })
    }

    /// Build the pipeline together with the session its files live in
    pub fn build(
        &self,
        registry: &FunctionRegistry,
    ) -> Result<(Pipeline<Clients>, Arc<Session>), ConfigErrors> {
        let session = Arc::new(self.session());
        let kernels = self.build_kernels(&session, registry)?;
        let client = Clients::load(&self.client)?;

        debug!(
            kernels = kernels.len(),
            session = %session.id(),
            "Built pipeline"
        );

        Ok((Pipeline::new(client, kernels), session))
    }
}

fn default_shell() -> PathBuf {
    PathBuf::from(DEFAULT_SHELL)
}

fn default_client() -> String {
    "local".to_string()
}

fn default_returncode() -> i64 {
    1
}

fn default_message() -> String {
    "dummy failure".to_string()
}
